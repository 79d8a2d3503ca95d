//! Worker control flags and unix signal wiring.
//!
//! Signal handlers never touch the store or the child directly. They flip a
//! flag on [`WorkerControl`] and wake the worker loop, which acts on the flag
//! at its next safe point.
//!
//! | Signal            | Effect                                   |
//! |-------------------|------------------------------------------|
//! | `SIGQUIT`         | stop after the current job               |
//! | `SIGTERM`/`SIGINT`| stop now, killing the running child       |
//! | `SIGUSR1`         | cancel the running job                   |
//! | `SIGUSR2`         | pause polling                            |
//! | `SIGCONT`         | resume polling                           |

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::process::Signal;
use crate::error::Result;
use crate::telemetry::WorkerMetrics;

const STOP_NONE: u8 = 0;
const STOP_GRACEFUL: u8 = 1;
const STOP_FORCE: u8 = 2;

/// How a stop was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// Finish the running job, then exit.
    Graceful,
    /// Kill the running job and exit.
    Force,
}

#[derive(Debug, Default)]
struct ControlState {
    paused: AtomicBool,
    stop: AtomicU8,
    cancel: AtomicBool,
    changed: Notify,
    closed: CancellationToken,
}

/// Shared control flags for one worker.
#[derive(Debug, Clone, Default)]
pub struct WorkerControl {
    inner: Arc<ControlState>,
}

impl WorkerControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pause(&self) {
        self.inner.paused.store(true, Ordering::SeqCst);
        self.inner.changed.notify_one();
    }

    pub fn resume(&self) {
        self.inner.paused.store(false, Ordering::SeqCst);
        self.inner.changed.notify_one();
    }

    /// Request cancellation of the running job.
    pub fn cancel_job(&self) {
        self.inner.cancel.store(true, Ordering::SeqCst);
        self.inner.changed.notify_one();
    }

    /// Request a stop. A forced stop is never downgraded to graceful.
    pub fn stop(&self, mode: StopMode) {
        let level = match mode {
            StopMode::Graceful => STOP_GRACEFUL,
            StopMode::Force => STOP_FORCE,
        };
        self.inner.stop.fetch_max(level, Ordering::SeqCst);
        self.inner.changed.notify_one();
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    pub fn stop_mode(&self) -> Option<StopMode> {
        match self.inner.stop.load(Ordering::SeqCst) {
            STOP_NONE => None,
            STOP_GRACEFUL => Some(StopMode::Graceful),
            _ => Some(StopMode::Force),
        }
    }

    /// Consume a pending cancel request.
    pub fn take_cancel(&self) -> bool {
        self.inner.cancel.swap(false, Ordering::SeqCst)
    }

    /// Wait until any flag changes.
    ///
    /// A change made while nobody was waiting is remembered, so the next call
    /// returns immediately.
    pub async fn changed(&self) {
        self.inner.changed.notified().await;
    }

    /// Stop the signal listener.
    pub fn close(&self) {
        self.inner.closed.cancel();
    }

    pub fn closed(&self) -> CancellationToken {
        self.inner.closed.clone()
    }

    /// Apply the effect of `signal`. Unknown signals are ignored.
    pub fn apply(&self, signal: Signal) {
        WorkerMetrics::record_signal(signal.name());
        match signal {
            Signal::Quit => self.stop(StopMode::Graceful),
            Signal::Term | Signal::Int => self.stop(StopMode::Force),
            Signal::Usr1 => self.cancel_job(),
            Signal::Usr2 => self.pause(),
            Signal::Cont => self.resume(),
            Signal::Kill => {}
        }
    }
}

/// Route process signals into `control` until it is closed.
pub fn listen_for_signals(control: WorkerControl) -> Result<JoinHandle<()>> {
    let mut quit = signal(SignalKind::quit())?;
    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;
    let mut usr1 = signal(SignalKind::user_defined1())?;
    let mut usr2 = signal(SignalKind::user_defined2())?;
    let mut cont = signal(SignalKind::from_raw(libc::SIGCONT))?;
    let closed = control.closed();

    Ok(tokio::spawn(async move {
        loop {
            let received = tokio::select! {
                _ = closed.cancelled() => break,
                Some(_) = quit.recv() => Signal::Quit,
                Some(_) = term.recv() => Signal::Term,
                Some(_) = int.recv() => Signal::Int,
                Some(_) = usr1.recv() => Signal::Usr1,
                Some(_) = usr2.recv() => Signal::Usr2,
                Some(_) = cont.recv() => Signal::Cont,
                else => break,
            };

            info!(signal = received.name(), "Received signal");
            control.apply(received);
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_force_not_downgraded() {
        let control = WorkerControl::new();
        assert_eq!(control.stop_mode(), None);
        control.stop(StopMode::Force);
        control.stop(StopMode::Graceful);
        assert_eq!(control.stop_mode(), Some(StopMode::Force));
    }

    #[test]
    fn test_signal_mapping() {
        let control = WorkerControl::new();
        control.apply(Signal::Usr2);
        assert!(control.is_paused());
        control.apply(Signal::Cont);
        assert!(!control.is_paused());

        control.apply(Signal::Usr1);
        assert!(control.take_cancel());
        assert!(!control.take_cancel());

        control.apply(Signal::Quit);
        assert_eq!(control.stop_mode(), Some(StopMode::Graceful));
    }

    #[tokio::test]
    async fn test_change_remembered() {
        let control = WorkerControl::new();
        control.pause();
        tokio::time::timeout(Duration::from_millis(100), control.changed())
            .await
            .expect("stored notification");
    }

    #[tokio::test]
    async fn test_listener_handles_real_signal() {
        let control = WorkerControl::new();
        let handle = listen_for_signals(control.clone()).unwrap();

        // SAFETY: signalling our own process with a handled signal.
        unsafe {
            libc::kill(std::process::id() as libc::pid_t, libc::SIGUSR2);
        }
        tokio::time::timeout(Duration::from_secs(2), async {
            while !control.is_paused() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("pause observed");

        control.close();
        handle.await.unwrap();
    }
}
