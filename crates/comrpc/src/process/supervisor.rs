//! Forced process destruction
//!
//! Processes that should go away are parked here with two deadlines. A
//! dedicated thread sleeps until the nearest one, asks politely (SIGTERM)
//! past the soft deadline and kills (SIGKILL) past the hard one. Entries
//! disappear as soon as their process is gone, whichever way it exited.

use super::{ProcessControl, Termination};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How often parked processes are checked for a natural exit
const POLL_INTERVAL: Duration = Duration::from_millis(50);

struct Entry {
    process: Box<dyn ProcessControl>,
    soft: Instant,
    hard: Instant,
    soft_sent: bool,
}

impl Entry {
    /// Advance the entry; false once it can be dropped
    fn step(&mut self, now: Instant) -> bool {
        let pid = self.process.remote_id();
        if !self.process.is_active() {
            debug!("Process {:?} is gone", pid);
            return false;
        }
        if now >= self.hard {
            warn!("Process {:?} outlived its grace period, killing it", pid);
            self.process.post_mortem();
            if let Err(e) = self.process.terminate(Termination::Hard) {
                warn!("Killing process {:?} failed: {}", pid, e);
            }
            return false;
        }
        if now >= self.soft && !self.soft_sent {
            info!("Asking process {:?} to terminate", pid);
            if let Err(e) = self.process.terminate(Termination::Soft) {
                warn!("Terminating process {:?} failed: {}", pid, e);
            }
            self.soft_sent = true;
        }
        true
    }

    fn deadline(&self) -> Instant {
        if self.soft_sent {
            self.hard
        } else {
            self.soft
        }
    }
}

struct State {
    entries: Vec<Entry>,
    running: bool,
}

struct Shared {
    state: Mutex<State>,
    wake: Condvar,
}

/// Handle to the destruction thread; clones share the thread
#[derive(Clone)]
pub struct DestructionSupervisor {
    shared: Arc<Shared>,
}

impl DestructionSupervisor {
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                entries: Vec::new(),
                running: true,
            }),
            wake: Condvar::new(),
        });

        let worker = shared.clone();
        let spawned = thread::Builder::new()
            .name("comrpc-destructor".to_string())
            .spawn(move || Self::run(&worker));
        if let Err(e) = spawned {
            warn!("Cannot start destruction thread: {}", e);
            shared.state.lock().running = false;
        }
        Self { shared }
    }

    /// Park `process`, terminating it after `soft` and killing it after `hard`
    pub fn schedule(&self, process: Box<dyn ProcessControl>, soft: Duration, hard: Duration) {
        let now = Instant::now();
        let entry = Entry {
            process,
            soft: now + soft,
            hard: now + hard.max(soft),
            soft_sent: false,
        };

        let mut state = self.shared.state.lock();
        if !state.running {
            drop(state);
            Self::kill_now(entry);
            return;
        }
        debug!(
            "Scheduled destruction of {:?} in {:?}/{:?}",
            entry.process.remote_id(),
            soft,
            hard
        );
        state.entries.push(entry);
        self.shared.wake.notify_one();
    }

    /// Processes not yet gone
    pub fn pending(&self) -> usize {
        self.shared.state.lock().entries.len()
    }

    /// Stop the thread, killing whatever is still parked
    pub fn shutdown(&self) {
        let entries = {
            let mut state = self.shared.state.lock();
            state.running = false;
            std::mem::take(&mut state.entries)
        };
        self.shared.wake.notify_all();
        for entry in entries {
            Self::kill_now(entry);
        }
    }

    fn kill_now(mut entry: Entry) {
        if entry.process.is_active() {
            entry.process.post_mortem();
            if let Err(e) = entry.process.terminate(Termination::Hard) {
                warn!("Killing process {:?} failed: {}", entry.process.remote_id(), e);
            }
        }
    }

    fn run(shared: &Shared) {
        let mut state = shared.state.lock();
        while state.running {
            let now = Instant::now();
            state.entries.retain_mut(|entry| entry.step(now));

            match state.entries.iter().map(Entry::deadline).min() {
                Some(deadline) => {
                    let wake_at = deadline.min(Instant::now() + POLL_INTERVAL);
                    shared.wake.wait_until(&mut state, wake_at);
                }
                None => shared.wake.wait(&mut state),
            }
        }
        debug!("Destruction thread stopped");
    }
}

impl Default for DestructionSupervisor {
    fn default() -> Self {
        Self::new()
    }
}
