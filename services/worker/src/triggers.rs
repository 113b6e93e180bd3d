//! Background trigger loops for the forced reconciliation cadences.
//!
//! Two cadences run inside the worker process: the nightly failsafe (a
//! backstop against missed home-arrival detection) and the weekly
//! emergency test (proves the pipeline is alive absent real triggers).
//! Both fire at a local wall-clock time in an injected IANA time zone,
//! so they survive daylight-saving transitions. An external scheduler
//! can drive the same cycles through the HTTP surface instead.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, Days, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::reconciler::{Reconciler, TriggerRun};

/// Retry policy for one trigger cadence.
///
/// The rare forced triggers get more retries and longer windows than a
/// routine poll would: a missed failsafe is not cheap to recover from.
#[derive(Debug, Clone)]
pub struct TriggerPolicy {
    pub max_retries: u32,
    pub backoff_base: Duration,
}

impl TriggerPolicy {
    /// Default policy for the nightly failsafe.
    pub fn failsafe() -> Self {
        Self {
            max_retries: 5,
            backoff_base: Duration::from_secs(60),
        }
    }

    /// Default policy for the weekly emergency test.
    pub fn emergency() -> Self {
        Self {
            max_retries: 3,
            backoff_base: Duration::from_secs(120),
        }
    }
}

/// Timing configuration for the trigger worker.
#[derive(Debug, Clone)]
pub struct TriggerSchedule {
    pub time_zone: Tz,
    pub failsafe_time: NaiveTime,
    pub emergency_weekday: Weekday,
    pub emergency_time: NaiveTime,
}

/// Background worker driving the forced cadences.
pub struct TriggerWorker {
    reconciler: Arc<Reconciler>,
    schedule: TriggerSchedule,
    failsafe_policy: TriggerPolicy,
    emergency_policy: TriggerPolicy,
}

impl TriggerWorker {
    /// Create a trigger worker with the default retry policies.
    pub fn new(reconciler: Arc<Reconciler>, schedule: TriggerSchedule) -> Self {
        Self {
            reconciler,
            schedule,
            failsafe_policy: TriggerPolicy::failsafe(),
            emergency_policy: TriggerPolicy::emergency(),
        }
    }

    /// Run both cadences until shutdown is signaled.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            time_zone = %self.schedule.time_zone,
            failsafe_time = %self.schedule.failsafe_time,
            emergency_weekday = ?self.schedule.emergency_weekday,
            "Starting trigger worker"
        );

        loop {
            let now = Utc::now();
            let next_failsafe = next_daily_occurrence(
                now,
                self.schedule.time_zone,
                self.schedule.failsafe_time,
            );
            let next_emergency = next_weekly_occurrence(
                now,
                self.schedule.time_zone,
                self.schedule.emergency_weekday,
                self.schedule.emergency_time,
            );

            tokio::select! {
                _ = sleep_until_utc(now, next_failsafe) => {
                    self.fire(TriggerRun::failsafe(), &self.failsafe_policy).await;
                }
                _ = sleep_until_utc(now, next_emergency) => {
                    self.fire(TriggerRun::emergency(), &self.emergency_policy).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Trigger worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Fire one trigger with bounded retries and exponential backoff.
    async fn fire(&self, run: TriggerRun, policy: &TriggerPolicy) {
        for attempt in 0..=policy.max_retries {
            match self.reconciler.run_cycle(run).await {
                Ok(outcome) => {
                    info!(
                        source = %run.source,
                        status = ?outcome.status,
                        attempt,
                        "Trigger cycle finished"
                    );
                    return;
                }
                Err(e) if attempt < policy.max_retries => {
                    let backoff = policy.backoff_base * 2u32.saturating_pow(attempt);
                    warn!(
                        source = %run.source,
                        error = %e,
                        attempt,
                        backoff_secs = backoff.as_secs(),
                        "Trigger cycle failed, backing off"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    error!(
                        source = %run.source,
                        error = %e,
                        attempts = policy.max_retries + 1,
                        "Trigger cycle failed, retries exhausted"
                    );
                }
            }
        }
    }
}

async fn sleep_until_utc(now: DateTime<Utc>, target: DateTime<Utc>) {
    let wait = (target - now).to_std().unwrap_or(Duration::ZERO);
    tokio::time::sleep(wait).await;
}

/// Next occurrence of a local wall-clock time, strictly after `now`.
///
/// Local times skipped by a spring-forward transition resolve to the
/// earliest valid instant after the target; ambiguous times during
/// fall-back resolve to the earlier of the two instants.
pub fn next_daily_occurrence(now: DateTime<Utc>, tz: Tz, at: NaiveTime) -> DateTime<Utc> {
    let local_now = now.with_timezone(&tz);
    let date = local_now.date_naive();
    let candidate = resolve_local_or_after(tz, date, at);
    if candidate > now {
        return candidate;
    }
    resolve_local_or_after(tz, date + Days::new(1), at)
}

/// Next occurrence of a local weekday + wall-clock time after `now`.
pub fn next_weekly_occurrence(
    now: DateTime<Utc>,
    tz: Tz,
    weekday: Weekday,
    at: NaiveTime,
) -> DateTime<Utc> {
    let local_now = now.with_timezone(&tz);
    let today = local_now.date_naive();

    let days_ahead = (weekday.num_days_from_monday() + 7
        - today.weekday().num_days_from_monday())
        % 7;
    let date = today + Days::new(u64::from(days_ahead));

    let candidate = resolve_local_or_after(tz, date, at);
    if candidate > now {
        return candidate;
    }
    resolve_local_or_after(tz, date + Days::new(7), at)
}

/// Resolve a local date+time to UTC, if it exists unambiguously enough.
fn resolve_local(tz: Tz, date: chrono::NaiveDate, time: NaiveTime) -> Option<DateTime<Utc>> {
    use chrono::offset::LocalResult;

    match tz.from_local_datetime(&date.and_time(time)) {
        LocalResult::Single(dt) => Some(dt.with_timezone(&Utc)),
        // Fall-back repeats the hour; take the earlier instant.
        LocalResult::Ambiguous(earlier, _) => Some(earlier.with_timezone(&Utc)),
        // Spring-forward skipped the time entirely.
        LocalResult::None => None,
    }
}

/// Like [`resolve_local`], sliding forward through a skipped hour.
fn resolve_local_or_after(tz: Tz, date: chrono::NaiveDate, time: NaiveTime) -> DateTime<Utc> {
    let mut naive = date.and_time(time);
    // DST gaps are at most a few hours; step forward 15 minutes at a time.
    for _ in 0..16 {
        if let Some(resolved) = resolve_local(tz, naive.date(), naive.time()) {
            return resolved;
        }
        naive += chrono::Duration::minutes(15);
    }
    // Unreachable for real tz data; fall back to interpreting as UTC.
    DateTime::from_naive_utc_and_offset(naive, Utc)
}
