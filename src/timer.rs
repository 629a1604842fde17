//! Monotonically-tightening deadline timer.
//!
//! A single actor task owns the current duration. Callers may only ever
//! shorten it; a duration of zero fires the deadline immediately. The
//! deadline only actually starts counting down once `start()` has been
//! called, mirroring the renderer-executor's "arm on process spawn"
//! lifecycle: `set_duration` may be called before the process exists, but
//! the clock itself should not.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::stopper::Stopper;

#[derive(Clone)]
pub struct Timer {
    durations: mpsc::Sender<f64>,
    start: mpsc::Sender<()>,
    end: CancellationToken,
    duration_bits: Arc<AtomicU64>,
}

impl Timer {
    /// `stopper` only shuts the actor's own task down when the owning task
    /// stops, so it doesn't outlive its task; it does not, by itself, fire
    /// `end()` — `end()` fires only from the deadline or an explicit zero
    /// duration, so callers can tell "timed out" apart from "stopped".
    pub fn new(stopper: Stopper) -> Self {
        let (dur_tx, dur_rx) = mpsc::channel(4);
        let (start_tx, start_rx) = mpsc::channel(1);
        let end = CancellationToken::new();
        let duration_bits = Arc::new(AtomicU64::new(f64::NAN.to_bits()));

        tokio::spawn(run(dur_rx, start_rx, end.clone(), stopper, duration_bits.clone()));

        Self {
            durations: dur_tx,
            start: start_tx,
            end,
            duration_bits,
        }
    }

    /// Shorten the deadline to `secs`, ignored if a shorter duration is
    /// already set. `secs == 0.0` fires the deadline immediately. A no-op,
    /// rather than a panic, once the timer has already ended — the caller
    /// may race a late shortening against completion.
    pub async fn set_duration(&self, secs: f64) {
        let _ = self.durations.send(secs).await;
    }

    /// Arm the countdown. Calling more than once is harmless.
    pub async fn start(&self) {
        let _ = self.start.send(()).await;
    }

    /// Resolves when the deadline elapses or a zero duration is submitted.
    /// Does not resolve on external stop — races against the task's
    /// Stopper separately to distinguish "timed out" from "stopped".
    pub fn end(&self) -> CancellationToken {
        self.end.clone()
    }

    /// The duration currently in force, if any has been set yet. Used to
    /// pick the kill-reason text ("time limit" vs. "stopped") independent
    /// of whichever of `end()`/the task Stopper actually fired first.
    pub fn current_duration(&self) -> Option<f64> {
        let bits = self.duration_bits.load(Ordering::Acquire);
        let v = f64::from_bits(bits);
        if v.is_nan() { None } else { Some(v) }
    }
}

async fn run(
    mut durations: mpsc::Receiver<f64>,
    mut start: mpsc::Receiver<()>,
    end: CancellationToken,
    stopper: Stopper,
    duration_bits: Arc<AtomicU64>,
) {
    let mut duration: Option<f64> = None;
    let mut started = false;
    let mut deadline: Option<Instant> = None;

    loop {
        let sleep = async {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            _ = stopper.stopped() => return,
            _ = end.cancelled() => return,
            _ = sleep => {
                end.cancel();
                return;
            }
            recv = durations.recv() => {
                let Some(secs) = recv else { return };
                if secs == 0.0 {
                    end.cancel();
                    return;
                }
                let tighter = match duration {
                    None => true,
                    Some(cur) => secs < cur,
                };
                if tighter {
                    duration = Some(secs);
                    duration_bits.store(secs.to_bits(), Ordering::Release);
                    if started {
                        deadline = Some(Instant::now() + Duration::from_secs_f64(secs));
                    }
                }
            }
            recv = start.recv() => {
                if recv.is_none() {
                    return;
                }
                started = true;
                if let Some(secs) = duration {
                    deadline = Some(Instant::now() + Duration::from_secs_f64(secs));
                }
            }
        }
    }
}
