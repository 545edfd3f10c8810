use std::collections::BTreeMap;

use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{TaskConfig, TaskId};
use crate::state::AppState;
use crate::tasks::run_scheduled;

/// Cron triggers currently registered for maintenance jobs.
pub struct TaskScheduler {
    inner: JobScheduler,
    registered: Vec<(TaskId, Uuid)>,
}

impl TaskScheduler {
    pub async fn start() -> Result<Self, JobSchedulerError> {
        let inner = JobScheduler::new().await?;
        inner.start().await?;
        Ok(Self {
            inner,
            registered: Vec::new(),
        })
    }

    pub fn registered(&self) -> Vec<TaskId> {
        self.registered.iter().map(|(id, _)| *id).collect()
    }

    /// Drops every trigger and registers one per enabled task with a usable cron line.
    pub async fn reconcile(
        &mut self,
        state: &AppState,
        tasks: &BTreeMap<String, TaskConfig>,
    ) -> Result<(), JobSchedulerError> {
        for (id, uuid) in self.registered.drain(..) {
            if let Err(err) = self.inner.remove(&uuid).await {
                warn!("Failed to remove trigger for {}: {}", id, err);
            }
        }

        for (id, schedule) in plan_registrations(tasks) {
            let job_state = state.clone();
            let job = match Job::new_async(schedule.as_str(), move |_uuid, _l| {
                let state = job_state.clone();
                Box::pin(async move {
                    run_scheduled(state, id).await;
                })
            }) {
                Ok(job) => job,
                Err(err) => {
                    warn!("Rejected schedule {:?} for {}: {}", schedule, id, err);
                    continue;
                }
            };
            let uuid = self.inner.add(job).await?;
            info!("Scheduled {} at {:?}", id, schedule);
            self.registered.push((id, uuid));
        }
        Ok(())
    }

    pub async fn shutdown(mut self) {
        if let Err(err) = self.inner.shutdown().await {
            warn!("Scheduler shutdown failed: {}", err);
        }
    }
}

/// Starts the cron engine and registers the configured tasks.
pub async fn start_scheduler(state: &AppState) -> Result<(), JobSchedulerError> {
    let scheduler = TaskScheduler::start().await?;
    *state.scheduler.lock().await = Some(scheduler);
    reconcile_state(state).await
}

pub async fn reconcile_state(state: &AppState) -> Result<(), JobSchedulerError> {
    let tasks = state.config.read().tasks_config.clone();
    let mut guard = state.scheduler.lock().await;
    match guard.as_mut() {
        Some(scheduler) => scheduler.reconcile(state, &tasks).await,
        None => Ok(()),
    }
}

pub async fn stop_scheduler(state: &AppState) {
    let scheduler = state.scheduler.lock().await.take();
    if let Some(scheduler) = scheduler {
        scheduler.shutdown().await;
    }
}

/// Enabled tasks with a five-field cron line, converted for the cron engine.
pub fn plan_registrations(tasks: &BTreeMap<String, TaskConfig>) -> Vec<(TaskId, String)> {
    let mut out = Vec::new();
    for (key, task) in tasks {
        if !task.enabled {
            continue;
        }
        let Some(id) = TaskId::parse(key) else {
            continue;
        };
        match to_engine_cron(&task.cron) {
            Some(schedule) => out.push((id, schedule)),
            None => warn!("Task {} has an invalid cron line {:?}", id, task.cron),
        }
    }
    out
}

/// `m h dom mon dow` to the engine's `s m h dom mon dow`. Both use 0-6 = Sunday-Saturday (7 = Sunday).
pub fn to_engine_cron(cron: &str) -> Option<String> {
    let fields: Vec<&str> = cron.split_whitespace().collect();
    if fields.len() != 5 || !valid_day_of_week(fields[4]) {
        return None;
    }
    Some(format!(
        "0 {} {} {} {} {}",
        fields[0], fields[1], fields[2], fields[3], fields[4]
    ))
}

fn valid_day_of_week(field: &str) -> bool {
    field.split(',').all(|item| {
        let base = item.split_once('/').map_or(item, |(base, _)| base);
        base.split('-').all(valid_day)
    })
}

fn valid_day(value: &str) -> bool {
    if value.is_empty() {
        return false;
    }
    if !value.chars().all(|c| c.is_ascii_digit()) {
        return true;
    }
    matches!(value.parse::<u8>(), Ok(0..=7))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_tasks;
    use chrono::{Datelike, Timelike, Weekday};

    #[test]
    fn converts_to_seconds_first_form() {
        assert_eq!(to_engine_cron("0 2 * * *").as_deref(), Some("0 0 2 * * *"));
        assert_eq!(to_engine_cron("*/15 3 1 * 0").as_deref(), Some("0 */15 3 1 * 0"));
        assert_eq!(to_engine_cron("30 4 * * 1-5").as_deref(), Some("0 30 4 * * 1-5"));
        assert_eq!(to_engine_cron("0 5 * * 0,6").as_deref(), Some("0 0 5 * * 0,6"));
        assert_eq!(to_engine_cron("0 5 * * MON").as_deref(), Some("0 0 5 * * MON"));
        assert_eq!(to_engine_cron("0 5 * * */2").as_deref(), Some("0 0 5 * * */2"));
    }

    #[test]
    fn rejects_malformed_lines() {
        assert_eq!(to_engine_cron("0 2 * *"), None);
        assert_eq!(to_engine_cron("0 0 2 * * *"), None);
        assert_eq!(to_engine_cron("0 2 * * 9"), None);
        assert_eq!(to_engine_cron(""), None);
    }

    #[test]
    fn only_enabled_valid_tasks_register() {
        let mut tasks = default_tasks();
        assert!(plan_registrations(&tasks).is_empty());

        if let Some(task) = tasks.get_mut("clean_junk") {
            task.enabled = true;
        }
        if let Some(task) = tasks.get_mut("clean_short") {
            task.enabled = true;
            task.cron = "every night".to_string();
        }
        let planned = plan_registrations(&tasks);
        assert_eq!(planned, vec![(TaskId::CleanJunk, "0 0 5 * * *".to_string())]);
    }

    #[tokio::test]
    async fn numeric_weekdays_fire_on_the_named_day() {
        let mut sched = JobScheduler::new().await.unwrap();
        for (cron, weekday) in [
            ("0 5 * * 1", Weekday::Mon),
            ("0 5 * * 6", Weekday::Sat),
            ("0 5 * * 0", Weekday::Sun),
        ] {
            let schedule = to_engine_cron(cron).unwrap();
            let job = Job::new_async(schedule.as_str(), |_uuid, _l| Box::pin(async {})).unwrap();
            let uuid = sched.add(job).await.unwrap();
            let next = sched.next_tick_for_job(uuid).await.unwrap().unwrap();
            assert_eq!(next.weekday(), weekday, "{}", cron);
            assert_eq!(next.hour(), 5);
        }
    }
}
