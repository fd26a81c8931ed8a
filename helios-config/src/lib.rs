//! Operator configuration for the helios display engine.
//!
//! The configuration is a KDL document. A minimal example:
//!
//! ```kdl
//! connector "DP-1"
//! connector "*"
//!
//! preferred-mode width=1920 height=1080 refresh=60.0
//!
//! color-management {
//!     no-ctm
//! }
//! ```
//!
//! Connector nodes form a priority list: the first entry has the highest
//! priority, and `"*"` matches any connector name.

use std::path::{Path, PathBuf};

use miette::{Context, IntoDiagnostic};
use tracing::debug;

#[derive(knuffel::Decode, Debug, Clone, Default, PartialEq)]
pub struct Config {
    /// Connector priority list, highest priority first.
    #[knuffel(children(name = "connector"))]
    pub connectors: Vec<ConnectorMatch>,
    /// Mode the operator asked for, matched against the modes a connector
    /// reports.
    #[knuffel(child)]
    pub preferred_mode: Option<PreferredMode>,
    /// Enable adaptive sync on capable connectors.
    #[knuffel(child)]
    pub allow_vrr: bool,
    #[knuffel(child, default)]
    pub color_management: ColorManagement,
    #[knuffel(child, default)]
    pub debug: DebugConfig,
    /// Where to persist the chosen mode per external display.
    #[knuffel(child, unwrap(argument))]
    pub mode_memory: Option<PathBuf>,
}

#[derive(knuffel::Decode, Debug, Clone, PartialEq, Eq)]
pub struct ConnectorMatch {
    #[knuffel(argument)]
    pub name: String,
}

impl ConnectorMatch {
    pub fn matches(&self, connector_name: &str) -> bool {
        self.name == "*" || self.name == connector_name
    }
}

#[derive(knuffel::Decode, Debug, Clone, Copy, PartialEq)]
pub struct PreferredMode {
    #[knuffel(property)]
    pub width: u16,
    #[knuffel(property)]
    pub height: u16,
    /// Refresh rate in Hz. When unset, the highest matching refresh wins.
    #[knuffel(property)]
    pub refresh: Option<f64>,
}

#[derive(knuffel::Decode, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ColorManagement {
    /// Kill switch: never stage any color-management state.
    #[knuffel(child)]
    pub disabled: bool,
    /// Per-feature toggles for bisecting driver problems.
    #[knuffel(child)]
    pub no_degamma: bool,
    #[knuffel(child)]
    pub no_ctm: bool,
    #[knuffel(child)]
    pub no_regamma: bool,
}

#[derive(knuffel::Decode, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DebugConfig {
    /// Always take the software-composite path, never direct scanout.
    #[knuffel(child)]
    pub force_composite: bool,
    /// Skip the rejected-layout cache in the plane allocator.
    #[knuffel(child)]
    pub disable_allocation_cache: bool,
}

impl Config {
    pub fn load(path: &Path) -> miette::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .into_diagnostic()
            .with_context(|| format!("error reading {path:?}"))?;

        let config = Self::parse(
            path.file_name()
                .and_then(|name| name.to_str())
                .unwrap_or("config.kdl"),
            &contents,
        )?;
        debug!("loaded config from {path:?}");
        Ok(config)
    }

    pub fn parse(filename: &str, text: &str) -> Result<Self, knuffel::Error> {
        knuffel::parse(filename, text)
    }

    /// Priority rank of a connector name, lower is better.
    ///
    /// An exact entry always outranks the `"*"` wildcard, regardless of their
    /// relative order in the file. Unlisted connectors get `None` and rank
    /// after every listed one.
    pub fn connector_priority(&self, connector_name: &str) -> Option<usize> {
        let exact = self
            .connectors
            .iter()
            .position(|c| c.name == connector_name);
        if exact.is_some() {
            return exact;
        }
        self.connectors.iter().position(|c| c.name == "*")
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn parse(text: &str) -> Config {
        Config::parse("test.kdl", text).unwrap()
    }

    #[test]
    fn parse_empty() {
        assert_eq!(parse(""), Config::default());
    }

    #[test]
    fn parse_full() {
        let config = parse(
            r##"
            connector "DP-1"
            connector "HDMI-A-1"
            connector "*"

            preferred-mode width=1920 height=1080 refresh=60.0
            allow-vrr

            color-management {
                no-ctm
            }

            debug {
                force-composite
            }

            mode-memory "/var/lib/helios/modes"
            "##,
        );

        assert_eq!(
            config.connectors,
            vec![
                ConnectorMatch {
                    name: "DP-1".to_owned()
                },
                ConnectorMatch {
                    name: "HDMI-A-1".to_owned()
                },
                ConnectorMatch {
                    name: "*".to_owned()
                },
            ],
        );
        assert_eq!(
            config.preferred_mode,
            Some(PreferredMode {
                width: 1920,
                height: 1080,
                refresh: Some(60.0),
            }),
        );
        assert!(config.allow_vrr);
        assert!(config.color_management.no_ctm);
        assert!(!config.color_management.disabled);
        assert!(config.debug.force_composite);
        assert_eq!(
            config.mode_memory.as_deref(),
            Some(Path::new("/var/lib/helios/modes")),
        );
    }

    #[test]
    fn priority_prefers_exact_over_wildcard() {
        let config = parse(
            r#"
            connector "*"
            connector "DP-1"
            "#,
        );

        assert_eq!(config.connector_priority("DP-1"), Some(1));
        assert_eq!(config.connector_priority("HDMI-A-1"), Some(0));
    }

    #[test]
    fn priority_unlisted_is_none() {
        let config = parse(r#"connector "DP-1""#);

        assert_eq!(config.connector_priority("DP-1"), Some(0));
        assert_eq!(config.connector_priority("HDMI-A-1"), None);
    }

    #[test]
    fn preferred_mode_without_refresh() {
        let config = parse("preferred-mode width=1280 height=800");
        assert_eq!(
            config.preferred_mode,
            Some(PreferredMode {
                width: 1280,
                height: 800,
                refresh: None,
            }),
        );
    }
}
