/// Recurring timer for the timing loop
///
/// One thread, one callback in flight at a time. Ticks that arrive while the
/// callback is still running are coalesced, never queued up.
use crossbeam_channel::{bounded, select, tick, Sender};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use crate::error::Result;

pub struct IntervalTimer {
    cancel_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
    thread_id: ThreadId,
}

impl IntervalTimer {
    pub fn spawn<F>(name: &str, period: Duration, mut callback: F) -> Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let (cancel_tx, cancel_rx) = bounded::<()>(0);
        let ticker = tick(period);

        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                loop {
                    select! {
                        recv(cancel_rx) -> _ => break,
                        recv(ticker) -> _ => callback(),
                    }
                }
                log::trace!(target: "timer", "timer thread exiting");
            })?;

        let thread_id = handle.thread().id();
        Ok(Self {
            cancel_tx: Some(cancel_tx),
            handle: Some(handle),
            thread_id,
        })
    }

    /// Stop the timer. When called from any thread other than the timer's
    /// own, this blocks until the running callback (if any) has returned.
    pub fn cancel(&mut self) {
        // Dropping the sender disconnects the cancel channel.
        self.cancel_tx.take();

        if let Some(handle) = self.handle.take() {
            if thread::current().id() == self.thread_id {
                return;
            }
            if handle.join().is_err() {
                log::error!(target: "timer", "timer callback panicked");
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.handle.is_some()
    }
}

impl Drop for IntervalTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}
