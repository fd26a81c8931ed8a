//! Persisted per-display mode choices.
//!
//! Plain text, one display per line: `description<TAB>WIDTHxHEIGHT@MILLIHZ`.
//! Only external displays are remembered; internal panels always renegotiate
//! from EDID.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs;
use std::path::PathBuf;

use tracing::{debug, warn};

/// One remembered mode choice.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SavedMode {
    pub width: u16,
    pub height: u16,
    pub refresh_mhz: i32,
}

#[derive(Debug, Default)]
pub struct ModeMemory {
    path: Option<PathBuf>,
    entries: HashMap<String, SavedMode>,
}

impl ModeMemory {
    /// Loads the file if a path is configured. Unreadable or malformed
    /// content degrades to an empty memory; persistence is best-effort
    /// throughout.
    pub fn load(path: Option<PathBuf>) -> Self {
        let mut entries = HashMap::new();

        if let Some(path) = &path {
            match fs::read_to_string(path) {
                Ok(contents) => {
                    for line in contents.lines() {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        match parse_line(line) {
                            Some((description, mode)) => {
                                entries.insert(description, mode);
                            }
                            None => warn!("skipping malformed mode memory line: {line:?}"),
                        }
                    }
                    debug!("loaded {} saved modes from {path:?}", entries.len());
                }
                Err(err) => {
                    debug!("no mode memory at {path:?}: {err}");
                }
            }
        }

        Self { path, entries }
    }

    pub fn recall(&self, description: &str) -> Option<SavedMode> {
        self.entries.get(description).copied()
    }

    /// Records a choice and rewrites the file when it changed.
    pub fn remember(&mut self, description: &str, mode: SavedMode) {
        if self.entries.get(description) == Some(&mode) {
            return;
        }
        self.entries.insert(description.to_owned(), mode);
        self.save();
    }

    fn save(&self) {
        let Some(path) = &self.path else {
            return;
        };

        let mut contents = String::new();
        let mut descriptions: Vec<_> = self.entries.keys().collect();
        descriptions.sort();
        for description in descriptions {
            let mode = &self.entries[description];
            let _ = writeln!(
                contents,
                "{description}\t{}x{}@{}",
                mode.width, mode.height, mode.refresh_mhz
            );
        }

        if let Some(parent) = path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        if let Err(err) = fs::write(path, contents) {
            warn!("error writing mode memory to {path:?}: {err:?}");
        }
    }
}

fn parse_line(line: &str) -> Option<(String, SavedMode)> {
    let (description, mode) = line.rsplit_once('\t')?;
    let (size, refresh) = mode.split_once('@')?;
    let (width, height) = size.split_once('x')?;

    Some((
        description.to_owned(),
        SavedMode {
            width: width.parse().ok()?,
            height: height.parse().ok()?,
            refresh_mhz: refresh.parse().ok()?,
        },
    ))
}
