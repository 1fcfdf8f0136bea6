use chrono::{DateTime, Utc};
use serde::Serialize;
use std::thread;
use std::time::{Duration, Instant};

/// Extra attempts after the first, spaced `retry_delay` apart. `retries: 3`
/// allows four attempts in total.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub retries: u32,
    pub retry_delay: Duration,
}

impl RetryPolicy {
    pub fn new(retries: u32, retry_delay: Duration) -> Self {
        Self {
            retries,
            retry_delay,
        }
    }

    pub fn none() -> Self {
        Self {
            retries: 0,
            retry_delay: Duration::ZERO,
        }
    }
}

pub fn run_task<T>(
    task_id: &str,
    policy: &RetryPolicy,
    mut task: impl FnMut() -> Result<T, String>,
) -> Result<T, String> {
    let start = Instant::now();
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match task() {
            Ok(value) => {
                metrics::counter!("siphon.runner.attempts_total", "task" => task_id.to_string(), "result" => "ok")
                    .increment(1);
                metrics::histogram!("siphon.runner.task_ms", "task" => task_id.to_string())
                    .record(start.elapsed().as_millis() as f64);
                tracing::info!(task = task_id, attempts, "task succeeded");
                return Ok(value);
            }
            Err(err) if attempts <= policy.retries => {
                metrics::counter!("siphon.runner.attempts_total", "task" => task_id.to_string(), "result" => "retry")
                    .increment(1);
                tracing::warn!(task = task_id, attempt = attempts, error = %err, "task failed, will retry");
                thread::sleep(policy.retry_delay);
            }
            Err(err) => {
                metrics::counter!("siphon.runner.attempts_total", "task" => task_id.to_string(), "result" => "err")
                    .increment(1);
                tracing::error!(task = task_id, attempts, error = %err, "task failed");
                return Err(format!("task {task_id} failed after {attempts} attempts: {err}"));
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct IntervalSchedule {
    pub every: Duration,
    pub catchup: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScheduleSummary {
    pub runs_started: u64,
    pub runs_failed: u64,
    pub ticks_skipped: u64,
}

/// First due tick strictly after `now`, and how many scheduled ticks between
/// `previous` and `now` were missed.
pub fn next_tick(
    previous: DateTime<Utc>,
    now: DateTime<Utc>,
    every: chrono::Duration,
) -> (DateTime<Utc>, u64) {
    let mut next = previous + every;
    let mut skipped = 0u64;
    while next <= now {
        next += every;
        skipped += 1;
    }
    (next, skipped)
}

/// Runs the closure once per interval, starting immediately. A failed run is
/// logged and counted; the schedule keeps going. With catchup disabled, ticks
/// missed while a run overran its interval are dropped instead of replayed.
pub fn run_on_schedule(
    schedule: &IntervalSchedule,
    max_runs: Option<u64>,
    mut run: impl FnMut(u64) -> Result<(), String>,
) -> Result<ScheduleSummary, String> {
    if schedule.every.is_zero() {
        return Err("schedule interval must be positive".to_string());
    }
    let every = chrono::Duration::from_std(schedule.every)
        .map_err(|err| format!("invalid schedule interval: {err}"))?;

    let mut summary = ScheduleSummary {
        runs_started: 0,
        runs_failed: 0,
        ticks_skipped: 0,
    };
    let mut tick = Utc::now();
    loop {
        let run_index = summary.runs_started;
        summary.runs_started += 1;
        let start = Instant::now();
        match run(run_index) {
            Ok(()) => {
                metrics::counter!("siphon.schedule.runs_total", "result" => "ok").increment(1);
                tracing::info!(
                    run = run_index,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "scheduled run finished"
                );
            }
            Err(err) => {
                summary.runs_failed += 1;
                metrics::counter!("siphon.schedule.runs_total", "result" => "err").increment(1);
                tracing::error!(run = run_index, error = %err, "scheduled run failed");
            }
        }

        if let Some(max) = max_runs {
            if summary.runs_started >= max {
                break;
            }
        }

        let now = Utc::now();
        let (next, skipped) = if schedule.catchup {
            (tick + every, 0)
        } else {
            next_tick(tick, now, every)
        };
        if skipped > 0 {
            metrics::counter!("siphon.schedule.ticks_skipped_total").increment(skipped);
            tracing::warn!(skipped, "run overran its interval, dropping missed ticks");
        }
        summary.ticks_skipped += skipped;
        tick = next;
        if let Ok(wait) = (next - Utc::now()).to_std() {
            thread::sleep(wait);
        }
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::{next_tick, run_on_schedule, run_task, IntervalSchedule, RetryPolicy};
    use chrono::{TimeZone, Utc};
    use std::cell::Cell;
    use std::time::Duration;

    #[test]
    fn task_succeeds_first_try_without_retrying() {
        let calls = Cell::new(0u32);
        let result = run_task("fetch_prices", &RetryPolicy::new(3, Duration::ZERO), || {
            calls.set(calls.get() + 1);
            Ok(42)
        });
        assert_eq!(result, Ok(42));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn task_recovers_within_retry_budget() {
        let calls = Cell::new(0u32);
        let result = run_task("load_raw", &RetryPolicy::new(3, Duration::ZERO), || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err("transient".to_string())
            } else {
                Ok("done")
            }
        });
        assert_eq!(result, Ok("done"));
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn task_fails_after_budget_exhausted() {
        let calls = Cell::new(0u32);
        let err = run_task("load_raw", &RetryPolicy::new(2, Duration::ZERO), || -> Result<(), String> {
            calls.set(calls.get() + 1);
            Err("down".to_string())
        })
        .unwrap_err();
        assert_eq!(calls.get(), 3);
        assert!(err.contains("failed after 3 attempts"), "{err}");
        assert!(err.contains("down"), "{err}");
    }

    #[test]
    fn zero_retries_means_single_attempt() {
        let calls = Cell::new(0u32);
        let err = run_task("transform_clean", &RetryPolicy::none(), || -> Result<(), String> {
            calls.set(calls.get() + 1);
            Err("boom".to_string())
        })
        .unwrap_err();
        assert_eq!(calls.get(), 1);
        assert!(err.contains("after 1 attempts"), "{err}");
    }

    #[test]
    fn next_tick_stays_on_cadence_when_on_time() {
        let every = chrono::Duration::seconds(300);
        let previous = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let now = previous + chrono::Duration::seconds(30);
        let (next, skipped) = next_tick(previous, now, every);
        assert_eq!(next, previous + every);
        assert_eq!(skipped, 0);
    }

    #[test]
    fn next_tick_drops_missed_intervals() {
        let every = chrono::Duration::seconds(300);
        let previous = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let now = previous + chrono::Duration::seconds(750);
        let (next, skipped) = next_tick(previous, now, every);
        assert_eq!(next, previous + chrono::Duration::seconds(900));
        assert_eq!(skipped, 2);
        assert!(next > now);
    }

    #[test]
    fn schedule_continues_past_failed_runs() {
        let schedule = IntervalSchedule {
            every: Duration::from_millis(1),
            catchup: false,
        };
        let summary = run_on_schedule(&schedule, Some(3), |run| {
            if run == 1 {
                Err("flaky".to_string())
            } else {
                Ok(())
            }
        })
        .expect("schedule");
        assert_eq!(summary.runs_started, 3);
        assert_eq!(summary.runs_failed, 1);
    }

    #[test]
    fn schedule_rejects_zero_interval() {
        let schedule = IntervalSchedule {
            every: Duration::ZERO,
            catchup: false,
        };
        assert!(run_on_schedule(&schedule, Some(1), |_| Ok(())).is_err());
    }
}
