//! Flip completion handling.
//!
//! Two threads touch the display pipeline: the presentation thread submits
//! commits, and a dedicated flip thread blocks on the DRM event fd and
//! processes page-flip completions. At most one flip is ever in flight; the
//! presentation thread waits on [`FlipGate`] before submitting the next
//! event-carrying commit.

use std::io;
use std::mem;
use std::os::fd::{AsFd, AsRawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use drm::control::{Device as ControlDevice, Event};
use tracing::{debug, trace, warn};

use super::device::Device;
use super::framebuffer::FrameSets;

/// Binary flip-in-flight gate. Bounds the hardware queue depth to one.
#[derive(Debug, Default)]
pub struct FlipGate {
    in_flight: Mutex<bool>,
    cond: Condvar,
}

impl FlipGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until the previous flip has completed, then marks one in
    /// flight.
    pub fn acquire(&self) {
        let mut in_flight = self.in_flight.lock().unwrap();
        while *in_flight {
            in_flight = self.cond.wait(in_flight).unwrap();
        }
        *in_flight = true;
    }

    /// Marks the in-flight flip complete and wakes the presentation thread.
    pub fn release(&self) {
        let mut in_flight = self.in_flight.lock().unwrap();
        *in_flight = false;
        drop(in_flight);
        self.cond.notify_one();
    }

    pub fn is_idle(&self) -> bool {
        !*self.in_flight.lock().unwrap()
    }
}

/// State shared between the presentation thread and the flip thread.
#[derive(Debug)]
pub struct FlipState {
    pub gate: FlipGate,
    /// Commits submitted with a completion event requested.
    pub submitted: AtomicU64,
    /// Completion events processed.
    pub completed: AtomicU64,
    /// Set from hotplug and session paths; consumed at the top of the next
    /// frame.
    pub needs_repoll: AtomicBool,
    /// Session paused (VT switched away); presentation becomes a no-op.
    pub paused: AtomicBool,
    stop: AtomicBool,
    sets: Arc<Mutex<FrameSets>>,
}

impl FlipState {
    pub fn new(sets: Arc<Mutex<FrameSets>>) -> Arc<Self> {
        Arc::new(Self {
            gate: FlipGate::new(),
            submitted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            needs_repoll: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            sets,
        })
    }

    /// Swaps queued into visible and releases the gate. Called from the flip
    /// thread for every page-flip completion.
    pub fn complete_flip(&self) {
        let previous = {
            let mut sets = self.sets.lock().unwrap();
            let finished = mem::take(&mut sets.queued);
            mem::replace(&mut sets.visible, finished)
        };
        // The last references drop outside the lock; this hands buffers
        // back to their producers.
        drop(previous);

        self.completed.fetch_add(1, Ordering::AcqRel);
        self.gate.release();
    }

    /// Consumes the repoll flag and runs `repoll`. A failed re-poll re-arms
    /// the flag: the next frame retries rather than presenting against
    /// stale resources.
    pub fn take_repoll<E>(&self, repoll: impl FnOnce() -> Result<(), E>) -> Result<(), E> {
        if self.needs_repoll.swap(false, Ordering::AcqRel) {
            if let Err(err) = repoll() {
                self.needs_repoll.store(true, Ordering::Release);
                return Err(err);
            }
        }
        Ok(())
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn in_flight(&self) -> u64 {
        self.submitted.load(Ordering::Acquire) - self.completed.load(Ordering::Acquire)
    }
}

/// Spawns the thread that blocks on the DRM event fd.
pub fn spawn_flip_thread(
    device: Arc<Device>,
    state: Arc<FlipState>,
) -> io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("helios-flip".to_owned())
        .spawn(move || flip_thread(&device, &state))
}

fn flip_thread(device: &Device, state: &FlipState) {
    debug!("flip thread running");

    while !state.stop.load(Ordering::Acquire) {
        let mut pfd = libc::pollfd {
            fd: device.as_fd().as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        // Finite timeout so a stop request is noticed even with no events
        // coming in.
        let ret = unsafe { libc::poll(&mut pfd, 1, 500) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            warn!("error polling DRM fd: {err:?}");
            break;
        }
        if ret == 0 {
            continue;
        }

        match device.receive_events() {
            Ok(events) => {
                for event in events {
                    if let Event::PageFlip(flip) = event {
                        trace!(sequence = flip.frame, "page flip completed");
                        state.complete_flip();
                    }
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
            Err(err) => {
                warn!("error receiving DRM events: {err:?}");
            }
        }
    }

    debug!("flip thread exiting");
}
