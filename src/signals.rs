//! Turns termination signals into supervisor events.
//!
//! The signals are blocked before any other thread exists, so every thread the
//! orchestrator later spawns inherits the mask and the only place they are ever
//! observed is the dedicated `sigwait` thread. Child processes start with an empty
//! mask, so services still receive signals normally.
use std::{sync::mpsc::Sender, thread};

use nix::{
    errno::Errno,
    sys::signal::{SigSet, Signal},
};
use tracing::{debug, info, warn};

use crate::supervisor::Event;

/// Signals that request a shutdown of the whole stack.
pub const SHUTDOWN_SIGNALS: [Signal; 3] = [Signal::SIGINT, Signal::SIGTERM, Signal::SIGHUP];

/// Blocked set of termination signals, waiting to be forwarded.
#[derive(Debug)]
pub struct SignalHandler {
    set: SigSet,
}

impl SignalHandler {
    /// Blocks [`SHUTDOWN_SIGNALS`] for the calling thread and every thread it spawns
    /// afterwards. Call this first thing in `main`.
    pub fn block() -> Result<Self, Errno> {
        let mut set = SigSet::empty();
        for signal in SHUTDOWN_SIGNALS {
            set.add(signal);
        }
        set.thread_block()?;
        debug!("Blocked shutdown signals {:?}", SHUTDOWN_SIGNALS);
        Ok(Self { set })
    }

    /// Forwards every received signal to `events` for the rest of the run.
    pub fn forward_to(self, events: Sender<Event>) {
        let set = self.set;
        thread::spawn(move || {
            loop {
                match set.wait() {
                    Ok(signal) => {
                        info!("Received {signal}");
                        if events.send(Event::Signal(signal as i32)).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!("Waiting for signals failed: {err}");
                        break;
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_signals_cover_interrupt_and_terminate() {
        assert!(SHUTDOWN_SIGNALS.contains(&Signal::SIGINT));
        assert!(SHUTDOWN_SIGNALS.contains(&Signal::SIGTERM));
    }

    #[test]
    fn block_masks_signals_for_the_calling_thread() {
        thread::spawn(|| {
            let _handler = SignalHandler::block().unwrap();
            let current = SigSet::thread_get_mask().unwrap();
            for signal in SHUTDOWN_SIGNALS {
                assert!(current.contains(signal));
            }
        })
        .join()
        .unwrap();
    }
}
