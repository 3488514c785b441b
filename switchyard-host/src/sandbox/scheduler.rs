//! Per-script interval timers.
//!
//! Each script id owns at most one timer task. Scheduling an id that already
//! has a timer aborts the old task before the new one starts, so the phase
//! always restarts from the moment of the latest `schedule` call.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

pub type TickFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
pub type Tick = Arc<dyn Fn() -> TickFuture + Send + Sync>;

/// What to do when a tick fires while the previous tick's run is in flight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverlapPolicy {
    /// Start another run regardless.
    Allow,
    /// Drop the tick.
    #[default]
    Skip,
    /// Run ticks one after another on the timer task.
    Serialize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleState {
    Unscheduled,
    Scheduled { period: Duration },
}

struct ScheduleHandle {
    period: Duration,
    task: JoinHandle<()>,
}

impl Drop for ScheduleHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub struct Scheduler {
    overlap: OverlapPolicy,
    timers: Mutex<HashMap<String, ScheduleHandle>>,
    /// In-flight markers for `Skip`, keyed by script id so they outlive a
    /// replaced timer whose last run is still going.
    busy: Mutex<HashMap<String, Arc<AtomicBool>>>,
}

impl Scheduler {
    pub fn new(overlap: OverlapPolicy) -> Self {
        Self {
            overlap,
            timers: Mutex::new(HashMap::new()),
            busy: Mutex::new(HashMap::new()),
        }
    }

    /// Cancel any existing timer for `id`, then start a new one whose first
    /// tick fires one `period` from now.
    pub fn schedule(&self, id: &str, period: Duration, tick: Tick) {
        let mut timers = self.timers.lock();
        if timers.remove(id).is_some() {
            debug!(script = %id, "Previous timer cancelled");
        }
        let busy = self.busy.lock().entry(id.to_string()).or_default().clone();
        let task = tokio::spawn(run_timer(id.to_string(), period, self.overlap, tick, busy));
        timers.insert(id.to_string(), ScheduleHandle { period, task });
        info!(script = %id, period_ms = period.as_millis() as u64, "Script scheduled");
    }

    /// Returns whether a timer existed.
    pub fn cancel(&self, id: &str) -> bool {
        let cancelled = self.timers.lock().remove(id).is_some();
        let mut busy = self.busy.lock();
        if busy.get(id).is_some_and(|flag| !flag.load(Ordering::SeqCst)) {
            busy.remove(id);
        }
        if cancelled {
            info!(script = %id, "Script unscheduled");
        }
        cancelled
    }

    pub fn cancel_all(&self) {
        let drained: Vec<_> = self.timers.lock().drain().collect();
        self.busy.lock().retain(|_, flag| flag.load(Ordering::SeqCst));
        if !drained.is_empty() {
            info!(count = drained.len(), "All script timers cancelled");
        }
    }

    pub fn state(&self, id: &str) -> ScheduleState {
        match self.timers.lock().get(id) {
            Some(handle) => ScheduleState::Scheduled {
                period: handle.period,
            },
            None => ScheduleState::Unscheduled,
        }
    }

    pub fn scheduled_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.timers.lock().keys().cloned().collect();
        ids.sort();
        ids
    }
}

async fn run_timer(
    id: String,
    period: Duration,
    overlap: OverlapPolicy,
    tick: Tick,
    busy: Arc<AtomicBool>,
) {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(match overlap {
        OverlapPolicy::Serialize => MissedTickBehavior::Delay,
        _ => MissedTickBehavior::Skip,
    });
    loop {
        interval.tick().await;
        match overlap {
            OverlapPolicy::Allow => {
                tokio::spawn(tick());
            }
            OverlapPolicy::Skip => {
                if busy.swap(true, Ordering::SeqCst) {
                    debug!(script = %id, "Previous run still in flight; tick skipped");
                    continue;
                }
                let run = tick();
                let busy = busy.clone();
                tokio::spawn(async move {
                    run.await;
                    busy.store(false, Ordering::SeqCst);
                });
            }
            OverlapPolicy::Serialize => tick().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn recorder(start: Instant, fired: Arc<Mutex<Vec<u64>>>) -> Tick {
        Arc::new(move || -> TickFuture {
            let fired = fired.clone();
            Box::pin(async move {
                fired.lock().push(start.elapsed().as_millis() as u64);
            })
        })
    }

    fn slow_counter(started: Arc<AtomicUsize>, run_for: Duration) -> Tick {
        Arc::new(move || -> TickFuture {
            let started = started.clone();
            Box::pin(async move {
                started.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(run_for).await;
            })
        })
    }

    #[tokio::test(start_paused = true)]
    async fn reschedule_resets_phase() {
        let scheduler = Scheduler::new(OverlapPolicy::Allow);
        let start = Instant::now();
        let fired = Arc::new(Mutex::new(Vec::new()));

        scheduler.schedule("s", Duration::from_millis(100), recorder(start, fired.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        scheduler.schedule("s", Duration::from_millis(100), recorder(start, fired.clone()));

        tokio::time::sleep(Duration::from_millis(60)).await; // t = 110
        assert!(fired.lock().is_empty(), "old timer must not fire at t=100");

        tokio::time::sleep(Duration::from_millis(50)).await; // t = 160
        assert_eq!(*fired.lock(), vec![150]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_future_ticks() {
        let scheduler = Scheduler::new(OverlapPolicy::Allow);
        let start = Instant::now();
        let fired = Arc::new(Mutex::new(Vec::new()));

        scheduler.schedule("s", Duration::from_millis(100), recorder(start, fired.clone()));
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(fired.lock().len(), 2);

        assert!(scheduler.cancel("s"));
        assert!(!scheduler.cancel("s"));
        assert_eq!(scheduler.state("s"), ScheduleState::Unscheduled);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(fired.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn allow_policy_overlaps_slow_runs() {
        let scheduler = Scheduler::new(OverlapPolicy::Allow);
        let started = Arc::new(AtomicUsize::new(0));
        scheduler.schedule(
            "s",
            Duration::from_millis(100),
            slow_counter(started.clone(), Duration::from_millis(250)),
        );
        tokio::time::sleep(Duration::from_millis(550)).await;
        assert_eq!(started.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn skip_policy_drops_ticks_while_busy() {
        let scheduler = Scheduler::new(OverlapPolicy::Skip);
        let started = Arc::new(AtomicUsize::new(0));
        scheduler.schedule(
            "s",
            Duration::from_millis(100),
            slow_counter(started.clone(), Duration::from_millis(250)),
        );
        // Ticks at 100 (runs to 350), 200 and 300 skipped, 400 runs, 500 skipped.
        tokio::time::sleep(Duration::from_millis(550)).await;
        assert_eq!(started.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn skip_policy_survives_reschedule_during_run() {
        let scheduler = Scheduler::new(OverlapPolicy::Skip);
        let started = Arc::new(AtomicUsize::new(0));
        let period = Duration::from_millis(100);
        let run_for = Duration::from_millis(250);

        scheduler.schedule("s", period, slow_counter(started.clone(), run_for));
        // First run starts at t=100 and lasts until t=350.
        tokio::time::sleep(Duration::from_millis(150)).await;
        scheduler.schedule("s", period, slow_counter(started.clone(), run_for));

        // The replacement timer ticks at t=250 while the old run is in flight.
        tokio::time::sleep(Duration::from_millis(170)).await; // t = 320
        assert_eq!(started.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn state_reports_period() {
        let scheduler = Scheduler::new(OverlapPolicy::default());
        let started = Arc::new(AtomicUsize::new(0));
        scheduler.schedule(
            "b",
            Duration::from_millis(30),
            slow_counter(started.clone(), Duration::ZERO),
        );
        scheduler.schedule(
            "a",
            Duration::from_millis(40),
            slow_counter(started, Duration::ZERO),
        );
        assert_eq!(
            scheduler.state("a"),
            ScheduleState::Scheduled {
                period: Duration::from_millis(40)
            }
        );
        assert_eq!(scheduler.scheduled_ids(), vec!["a", "b"]);
        scheduler.cancel_all();
        assert!(scheduler.scheduled_ids().is_empty());
    }
}
