//! Timers for scheduled sync configurations and the manual trigger path.
//!
//! Each scheduled configuration owns one tokio task that sleeps until the
//! next firing of its cron recurrence. A firing asks the
//! [`ConcurrencyGuard`] for admission; when the previous run of the same
//! configuration is still in flight the firing is skipped, otherwise the run
//! is spawned holding the admission permit.
//!
//! Recurrences are standard five-field cron expressions (minute, hour,
//! day-of-month, month, day-of-week) or six-field expressions with a leading
//! seconds field.

use crate::executor::SyncExecutor;
use crate::guard::{AdmissionPermit, ConcurrencyGuard};
use crate::models::{Actor, Schedule, SyncConfig, SyncJob, TriggerSource};
use crate::store::ConfigStore;
use crate::{Result, SentinelError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;

const DAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

fn day_number(token: &str) -> Option<usize> {
    token.parse::<usize>().ok().filter(|n| *n <= 7)
}

fn day_name(token: &str) -> Option<&'static str> {
    day_number(token).map(|n| DAY_NAMES[n % 7])
}

/// Rewrites numeric day-of-week values (0-7, Sunday = 0 or 7) as day names.
fn normalize_day_of_week(field: &str) -> String {
    field
        .split(',')
        .map(normalize_day_item)
        .collect::<Vec<_>>()
        .join(",")
}

fn normalize_day_item(item: &str) -> String {
    let (range, step) = match item.split_once('/') {
        Some((range, step)) => (range, Some(step)),
        None => (item, None),
    };
    let with_step = |range: String| match step {
        Some(step) => format!("{range}/{step}"),
        None => range,
    };

    let Some((start, end)) = range.split_once('-') else {
        return with_step(day_name(range).map_or_else(|| range.to_string(), str::to_string));
    };
    let (Some(first), Some(last)) = (day_number(start), day_number(end)) else {
        return item.to_string();
    };
    if last != 7 {
        return with_step(format!("{}-{}", DAY_NAMES[first % 7], DAY_NAMES[last]));
    }

    // Sunday as 7 sits past SAT, so the range wraps.
    match step {
        None if first == 0 => "SUN-SAT".to_string(),
        None if first == 7 => "SUN".to_string(),
        None => format!("{}-SAT,SUN", DAY_NAMES[first]),
        Some(step) => match step.parse::<usize>() {
            Ok(step) if step > 0 => {
                let mut days: Vec<&str> = Vec::new();
                for n in (first..=7).step_by(step) {
                    let day = DAY_NAMES[n % 7];
                    if !days.contains(&day) {
                        days.push(day);
                    }
                }
                days.join(",")
            }
            _ => item.to_string(),
        },
    }
}

/// Normalizes a cron expression into the six- or seven-field form the
/// `cron` crate parses.
fn normalize_expression(expression: &str) -> String {
    let expression = expression.trim();
    if expression.starts_with('@') {
        return expression.to_string();
    }
    let mut fields: Vec<String> = expression.split_whitespace().map(str::to_string).collect();
    if fields.len() == 5 {
        fields.insert(0, "0".to_string());
    }
    if let Some(dow) = fields.get_mut(5) {
        *dow = normalize_day_of_week(dow);
    }
    fields.join(" ")
}

/// Resolves a schedule into its cron expression and parsed recurrence.
/// Manual schedules have no recurrence.
///
/// # Example
/// ```rust
/// use sentinel_core::models::Schedule;
/// use sentinel_core::scheduler::resolve_recurrence;
///
/// let (expression, _) = resolve_recurrence(&Schedule::Daily)?.unwrap();
/// assert_eq!(expression, "0 0 * * *");
/// assert!(resolve_recurrence(&Schedule::Manual)?.is_none());
/// # Ok::<(), sentinel_core::SentinelError>(())
/// ```
///
/// # Errors
/// Returns `InvalidSchedule` when the expression does not parse.
pub fn resolve_recurrence(schedule: &Schedule) -> Result<Option<(String, cron::Schedule)>> {
    let Some(expression) = schedule.cron_expression() else {
        return Ok(None);
    };
    let field_count = expression.split_whitespace().count();
    if !expression.trim().starts_with('@') && !(5..=7).contains(&field_count) {
        return Err(SentinelError::invalid_schedule(
            expression,
            format!("expected 5 or 6 fields, found {field_count}"),
        ));
    }
    let parsed = cron::Schedule::from_str(&normalize_expression(expression))
        .map_err(|e| SentinelError::invalid_schedule(expression, e.to_string()))?;
    Ok(Some((expression.to_string(), parsed)))
}

/// Next firing of a recurrence after now.
pub fn next_run(schedule: &cron::Schedule) -> Option<DateTime<Utc>> {
    schedule.upcoming(Utc).next()
}

struct ScheduledTimer {
    expression: String,
    recurrence: cron::Schedule,
    handle: JoinHandle<()>,
}

/// One entry of [`SchedulerStatus`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduleInfo {
    pub config_id: String,
    pub cron_expression: String,
    pub running: bool,
    pub next_run: Option<DateTime<Utc>>,
}

/// Snapshot of the scheduler's timers and running jobs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStatus {
    pub total_scheduled: usize,
    /// Configurations with a run in flight, scheduled or not
    pub running_jobs: Vec<String>,
    pub schedules: Vec<ScheduleInfo>,
}

/// Owns the timers of every scheduled configuration.
pub struct Scheduler {
    executor: Arc<SyncExecutor>,
    guard: Arc<ConcurrencyGuard>,
    timers: Mutex<HashMap<String, ScheduledTimer>>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("scheduled", &self.timers().len())
            .field("running", &self.guard.running())
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Creates a scheduler with no timers.
    pub fn new(executor: Arc<SyncExecutor>) -> Self {
        Self {
            executor,
            guard: Arc::new(ConcurrencyGuard::new()),
            timers: Mutex::new(HashMap::new()),
        }
    }

    /// Executor that runs admitted jobs.
    pub const fn executor(&self) -> &Arc<SyncExecutor> {
        &self.executor
    }

    /// Admission guard shared by timers and manual triggers.
    pub const fn guard(&self) -> &Arc<ConcurrencyGuard> {
        &self.guard
    }

    fn timers(&self) -> MutexGuard<'_, HashMap<String, ScheduledTimer>> {
        self.timers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Installs (or replaces) the timer for a configuration. Returns whether
    /// a timer is now installed.
    ///
    /// Inactive and manual configurations are not scheduled. An invalid cron
    /// expression is logged and leaves the configuration unscheduled.
    ///
    /// # Errors
    /// Returns a configuration error when called outside a tokio runtime.
    pub fn schedule(&self, config: &SyncConfig) -> Result<bool> {
        let resolved = if config.wants_timer() {
            match resolve_recurrence(&config.schedule) {
                Ok(resolved) => resolved,
                Err(e) => {
                    tracing::error!("Not scheduling '{}': {}", config.name, e);
                    None
                }
            }
        } else {
            tracing::debug!(
                "Not scheduling '{}': {}",
                config.name,
                if config.is_active { "manual schedule" } else { "inactive" }
            );
            None
        };
        let Some((expression, recurrence)) = resolved else {
            self.unschedule(&config.id);
            return Ok(false);
        };

        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            SentinelError::configuration(format!("Scheduler requires a tokio runtime: {e}"))
        })?;
        let next = next_run(&recurrence);

        // Replace under one lock so concurrent reschedules leave a single timer.
        let mut timers = self.timers();
        let handle = runtime.spawn(run_timer(
            Arc::clone(&self.executor),
            Arc::clone(&self.guard),
            config.id.clone(),
            recurrence.clone(),
        ));
        let replaced = timers.insert(
            config.id.clone(),
            ScheduledTimer {
                expression: expression.clone(),
                recurrence,
                handle,
            },
        );
        drop(timers);
        if let Some(old) = replaced {
            old.handle.abort();
            tracing::debug!("Replaced existing timer for {}", config.id);
        }

        tracing::info!(
            "Scheduled '{}' ({}) with '{}', next run {}",
            config.name,
            config.id,
            expression,
            next.map_or_else(|| "never".to_string(), |t| t.to_rfc3339())
        );
        Ok(true)
    }

    /// Removes the timer for a configuration, if any. Runs already in flight
    /// continue.
    pub fn unschedule(&self, config_id: &str) {
        if let Some(timer) = self.timers().remove(config_id) {
            timer.handle.abort();
            tracing::info!("Unscheduled configuration {}", config_id);
        }
    }

    /// Schedules every active, non-manual configuration in the store.
    /// Failures are logged; returns how many timers were installed.
    pub async fn initialize(&self) -> usize {
        let configs = match self.executor.store().scheduled_configs().await {
            Ok(configs) => configs,
            Err(e) => {
                tracing::error!("Failed to load scheduled configurations: {}", e);
                return 0;
            }
        };

        let mut scheduled = 0usize;
        for config in &configs {
            match self.schedule(config) {
                Ok(true) => scheduled = scheduled.saturating_add(1),
                Ok(false) => {}
                Err(e) => tracing::error!("Failed to schedule '{}': {}", config.name, e),
            }
        }
        tracing::info!(
            "Scheduler initialized: {} of {} configurations scheduled",
            scheduled,
            configs.len()
        );
        scheduled
    }

    /// Cancels every timer. Runs already in flight continue.
    pub fn stop(&self) {
        let mut timers = self.timers();
        for (_, timer) in timers.drain() {
            timer.handle.abort();
        }
        tracing::info!("Scheduler stopped");
    }

    /// Current timers and running configurations.
    pub fn status(&self) -> SchedulerStatus {
        let timers = self.timers();
        let mut schedules: Vec<ScheduleInfo> = timers
            .iter()
            .map(|(config_id, timer)| ScheduleInfo {
                config_id: config_id.clone(),
                cron_expression: timer.expression.clone(),
                running: self.guard.is_running(config_id),
                next_run: next_run(&timer.recurrence),
            })
            .collect();
        schedules.sort_by(|a, b| a.config_id.cmp(&b.config_id));

        SchedulerStatus {
            total_scheduled: schedules.len(),
            running_jobs: self.guard.running(),
            schedules,
        }
    }

    fn admit(&self, config_id: &str) -> Result<AdmissionPermit> {
        self.guard
            .admit(config_id)
            .ok_or_else(|| SentinelError::JobAlreadyRunning {
                config_id: config_id.to_string(),
            })
    }

    /// Starts a manual run in the background and returns its job id.
    ///
    /// # Errors
    /// Returns `JobAlreadyRunning` when a run of the configuration is in
    /// flight, and the [`SyncExecutor::prepare`] errors.
    pub async fn trigger_immediate(&self, config_id: &str, actor: Option<&Actor>) -> Result<String> {
        let permit = self.admit(config_id)?;
        let (plan, job) = self
            .executor
            .prepare(config_id, TriggerSource::Manual, actor)
            .await?;
        let job_id = job.id.clone();

        let executor = Arc::clone(&self.executor);
        tokio::spawn(async move {
            let _permit = permit;
            if let Err(e) = executor.run(plan, job).await {
                tracing::error!("Manual sync run failed: {}", e);
            }
        });
        Ok(job_id)
    }

    /// Runs a manual job to completion and returns its final record.
    ///
    /// # Errors
    /// As [`Scheduler::trigger_immediate`], plus connector construction
    /// errors.
    pub async fn trigger_and_wait(&self, config_id: &str, actor: Option<&Actor>) -> Result<SyncJob> {
        let _permit = self.admit(config_id)?;
        let (plan, job) = self
            .executor
            .prepare(config_id, TriggerSource::Manual, actor)
            .await?;
        self.executor.run(plan, job).await
    }

    /// Asks a running job to stop.
    pub fn request_cancel(&self, job_id: &str) -> bool {
        self.executor.request_cancel(job_id)
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        for (_, timer) in self.timers().drain() {
            timer.handle.abort();
        }
    }
}

async fn run_timer(
    executor: Arc<SyncExecutor>,
    guard: Arc<ConcurrencyGuard>,
    config_id: String,
    recurrence: cron::Schedule,
) {
    let mut after = Utc::now();
    loop {
        let Some(next) = recurrence.after(&after).next() else {
            tracing::info!("Schedule for {} has no further runs", config_id);
            return;
        };
        let wait = next
            .signed_duration_since(Utc::now())
            .to_std()
            .unwrap_or_default();
        tokio::time::sleep(wait).await;
        after = next;

        let Some(permit) = guard.admit(&config_id) else {
            tracing::warn!(
                "Skipping scheduled run of {}: previous run still in progress",
                config_id
            );
            continue;
        };
        let executor = Arc::clone(&executor);
        let config_id = config_id.clone();
        tokio::spawn(async move {
            let _permit = permit;
            match executor.execute(&config_id, TriggerSource::Schedule).await {
                Ok(job_id) => tracing::debug!("Scheduled job {} for {} finished", job_id, config_id),
                Err(e) => tracing::error!("Scheduled run of {} failed: {}", config_id, e),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineSettings;
    use crate::store::MemoryStore;

    fn scheduler() -> (Arc<MemoryStore>, Scheduler) {
        let store = Arc::new(MemoryStore::new());
        let executor = Arc::new(SyncExecutor::new(store.clone(), EngineSettings::default()));
        (store, Scheduler::new(executor))
    }

    fn cron(expression: &str) -> Schedule {
        Schedule::Cron {
            expression: expression.to_string(),
        }
    }

    #[test]
    fn test_normalize_expression() {
        assert_eq!(normalize_expression("*/15 * * * *"), "0 */15 * * * *");
        assert_eq!(normalize_expression("0 9 * * 1-5"), "0 0 9 * * MON-FRI");
        assert_eq!(normalize_expression("0 0 * * 0"), "0 0 0 * * SUN");
        assert_eq!(normalize_expression("0 0 * * 7"), "0 0 0 * * SUN");
        assert_eq!(normalize_expression("0 0 * * 5-7"), "0 0 0 * * FRI-SAT,SUN");
        assert_eq!(normalize_expression("0 0 * * 1,3"), "0 0 0 * * MON,WED");
        assert_eq!(normalize_expression("0 0 * * */2"), "0 0 0 * * */2");
        assert_eq!(normalize_expression("30 0 0 * * *"), "30 0 0 * * *");
        assert_eq!(normalize_expression("@hourly"), "@hourly");
    }

    #[test]
    fn test_normalize_day_ranges_ending_on_seven() {
        assert_eq!(normalize_day_of_week("0-7"), "SUN-SAT");
        assert_eq!(normalize_day_of_week("7-7"), "SUN");
        assert_eq!(normalize_day_of_week("1-7"), "MON-SAT,SUN");
        assert_eq!(normalize_day_of_week("5-7/2"), "FRI,SUN");
        assert_eq!(normalize_day_of_week("0-7/2"), "SUN,TUE,THU,SAT");
        assert_eq!(normalize_day_of_week("0-7/7"), "SUN");
        assert_eq!(normalize_day_of_week("1-5/2"), "MON-FRI/2");
        assert_eq!(normalize_day_of_week("MON-FRI"), "MON-FRI");
    }

    #[test]
    fn test_every_day_range_fires_daily() -> Result<()> {
        use chrono::{Datelike, Weekday};
        let (_, recurrence) = resolve_recurrence(&cron("0 0 * * 0-7"))?.unwrap();
        let days: Vec<_> = recurrence.upcoming(Utc).take(7).map(|t| t.weekday()).collect();
        for day in [Weekday::Sun, Weekday::Mon, Weekday::Sat] {
            assert!(days.contains(&day), "{day} missing from {days:?}");
        }

        let (_, recurrence) = resolve_recurrence(&cron("0 0 * * 5-7/2"))?.unwrap();
        let days: Vec<_> = recurrence.upcoming(Utc).take(4).map(|t| t.weekday()).collect();
        assert!(days.contains(&Weekday::Sun));
        assert!(days.iter().all(|d| matches!(d, Weekday::Fri | Weekday::Sun)));
        Ok(())
    }

    #[test]
    fn test_resolve_builtin_recurrences() -> Result<()> {
        for (schedule, expected) in [
            (Schedule::Hourly, "0 * * * *"),
            (Schedule::Daily, "0 0 * * *"),
            (Schedule::Weekly, "0 0 * * 0"),
        ] {
            let (expression, recurrence) = resolve_recurrence(&schedule)?.unwrap();
            assert_eq!(expression, expected);
            assert!(next_run(&recurrence).is_some());
        }
        Ok(())
    }

    #[test]
    fn test_weekly_fires_on_sunday() -> Result<()> {
        use chrono::{Datelike, Timelike, Weekday};
        let (_, recurrence) = resolve_recurrence(&Schedule::Weekly)?.unwrap();
        let next = next_run(&recurrence).unwrap();
        assert_eq!(next.weekday(), Weekday::Sun);
        assert_eq!((next.hour(), next.minute()), (0, 0));
        Ok(())
    }

    #[test]
    fn test_invalid_cron_rejected() {
        for bad in ["every tuesday", "61 * * * *", "* * *", ""] {
            let result = resolve_recurrence(&cron(bad));
            assert!(
                matches!(result, Err(SentinelError::InvalidSchedule { .. })),
                "accepted {bad:?}"
            );
        }
    }

    #[tokio::test]
    async fn test_scheduler_skips_manual_and_invalid() -> Result<()> {
        let (_store, scheduler) = scheduler();
        let manual = SyncConfig::new("m", "Manual", "ds", "out", "m.jsonl");
        assert!(!scheduler.schedule(&manual)?);

        let invalid =
            SyncConfig::new("bad", "Bad", "ds", "out", "b.jsonl").with_schedule(cron("nope"));
        assert!(!scheduler.schedule(&invalid)?);

        let mut inactive =
            SyncConfig::new("off", "Off", "ds", "out", "o.jsonl").with_schedule(Schedule::Daily);
        inactive.is_active = false;
        assert!(!scheduler.schedule(&inactive)?);

        assert_eq!(scheduler.status().total_scheduled, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_reschedule_replaces_timer() -> Result<()> {
        let (_store, scheduler) = scheduler();
        let config =
            SyncConfig::new("c", "C", "ds", "out", "c.jsonl").with_schedule(Schedule::Hourly);
        assert!(scheduler.schedule(&config)?);

        let config = config.with_schedule(cron("30 2 * * *"));
        assert!(scheduler.schedule(&config)?);

        let status = scheduler.status();
        assert_eq!(status.total_scheduled, 1);
        assert_eq!(status.schedules[0].cron_expression, "30 2 * * *");
        assert!(!status.schedules[0].running);
        assert!(status.schedules[0].next_run.is_some());

        // Switching to manual removes the timer.
        assert!(!scheduler.schedule(&config.with_schedule(Schedule::Manual))?);
        assert_eq!(scheduler.status().total_scheduled, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_reschedule_aborts_replaced_timer() -> Result<()> {
        let (_store, scheduler) = scheduler();
        let config =
            SyncConfig::new("c", "C", "ds", "out", "c.jsonl").with_schedule(Schedule::Hourly);
        assert!(scheduler.schedule(&config)?);
        let first = scheduler.timers()["c"].handle.abort_handle();

        assert!(scheduler.schedule(&config)?);
        for _ in 0..10 {
            if first.is_finished() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(first.is_finished());
        assert!(!scheduler.timers()["c"].handle.is_finished());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reschedule_keeps_one_timer() -> Result<()> {
        let (_store, scheduler) = scheduler();
        let scheduler = Arc::new(scheduler);

        let tasks: Vec<_> = (0..16)
            .map(|minute| {
                let scheduler = Arc::clone(&scheduler);
                tokio::spawn(async move {
                    let config = SyncConfig::new("c", "C", "ds", "out", "c.jsonl")
                        .with_schedule(cron(&format!("{minute} * * * *")));
                    scheduler.schedule(&config)
                })
            })
            .collect();
        for task in tasks {
            assert!(task.await.unwrap()?);
        }

        assert_eq!(scheduler.status().total_scheduled, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_trigger_rejected_while_running() {
        let (_store, scheduler) = scheduler();
        assert!(scheduler.guard().try_acquire("cfg"));
        let result = scheduler.trigger_immediate("cfg", None).await;
        assert!(matches!(
            result,
            Err(SentinelError::JobAlreadyRunning { ref config_id }) if config_id == "cfg"
        ));
        assert_eq!(scheduler.status().running_jobs, vec!["cfg".to_string()]);
    }

    #[tokio::test]
    async fn test_trigger_unknown_config_releases_slot() {
        let (_store, scheduler) = scheduler();
        let result = scheduler.trigger_immediate("missing", None).await;
        assert!(matches!(result, Err(SentinelError::NotFound { .. })));
        assert!(!scheduler.guard().is_running("missing"));
    }

    #[tokio::test]
    async fn test_stop_clears_timers() -> Result<()> {
        let (_store, scheduler) = scheduler();
        for id in ["a", "b"] {
            let config =
                SyncConfig::new(id, id, "ds", "out", "x.jsonl").with_schedule(Schedule::Daily);
            scheduler.schedule(&config)?;
        }
        assert_eq!(scheduler.status().total_scheduled, 2);
        scheduler.stop();
        assert_eq!(scheduler.status().total_scheduled, 0);
        scheduler.unschedule("a");
        Ok(())
    }
}
