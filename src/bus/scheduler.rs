//! Persistent timers that emit events through the dispatcher
//!
//! Tasks store an absolute next-fire time, so a node that was down simply
//! finds them overdue on the next tick. A recurring task that missed several
//! intervals fires once and is rescheduled from the time it actually fired.

use std::sync::Arc;
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::db::{epoch_now, open_connection, StoreError};

use super::dispatcher::EventDispatcher;
use super::event::Event;

/// A persisted timer.
#[derive(Clone, Debug, PartialEq)]
pub struct ScheduledTask {
    pub id: String,
    pub event_name: String,
    pub payload: serde_json::Value,
    /// Next fire time, fractional Unix seconds.
    pub scheduled_at: f64,
    /// `None` for one-off tasks.
    pub interval_seconds: Option<f64>,
}

impl ScheduledTask {
    pub fn is_recurring(&self) -> bool {
        self.interval_seconds.is_some()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub total: usize,
    pub recurring: usize,
    pub one_off: usize,
    pub overdue: usize,
}

struct TaskRow {
    id: String,
    event_name: String,
    payload: String,
    scheduled_at: f64,
    interval_seconds: Option<f64>,
}

impl TaskRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            event_name: row.get(1)?,
            payload: row.get(2)?,
            scheduled_at: row.get(3)?,
            interval_seconds: row.get(4)?,
        })
    }

    fn into_task(self) -> Result<ScheduledTask, StoreError> {
        Ok(ScheduledTask {
            payload: serde_json::from_str(&self.payload)?,
            id: self.id,
            event_name: self.event_name,
            scheduled_at: self.scheduled_at,
            interval_seconds: self.interval_seconds,
        })
    }
}

const TASK_COLUMNS: &str = "id, event_name, payload, scheduled_at, interval_seconds";

pub struct EventScheduler {
    conn: Mutex<Connection>,
    dispatcher: Arc<EventDispatcher>,
    poll_interval: Duration,
    shutdown_tx: broadcast::Sender<()>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl EventScheduler {
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

    /// Open the scheduler's table in the database at `path`.
    pub fn open(
        path: &std::path::Path,
        dispatcher: Arc<EventDispatcher>,
        poll_interval: Duration,
    ) -> Result<Self, StoreError> {
        let conn = open_connection(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS scheduled_tasks (
                id TEXT PRIMARY KEY,
                event_name TEXT NOT NULL,
                payload TEXT NOT NULL,
                scheduled_at REAL NOT NULL,
                interval_seconds REAL,
                status TEXT NOT NULL DEFAULT 'pending'
            );
            CREATE INDEX IF NOT EXISTS idx_status_time
                ON scheduled_tasks(status, scheduled_at);",
        )?;

        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            conn: Mutex::new(conn),
            dispatcher,
            poll_interval,
            shutdown_tx,
            loop_handle: Mutex::new(None),
        })
    }

    /// Fire `event` once, `delay` from now. Returns the task id.
    pub async fn schedule_after(&self, delay: Duration, event: &Event) -> Result<String, StoreError> {
        self.store_task(event, epoch_now() + delay.as_secs_f64(), None)
            .await
    }

    /// Fire `event` every `interval`, first firing one interval from now.
    pub async fn schedule_recurring(
        &self,
        interval: Duration,
        event: &Event,
    ) -> Result<String, StoreError> {
        let interval = interval.as_secs_f64();
        self.store_task(event, epoch_now() + interval, Some(interval))
            .await
    }

    async fn store_task(
        &self,
        event: &Event,
        scheduled_at: f64,
        interval_seconds: Option<f64>,
    ) -> Result<String, StoreError> {
        let task_id = Uuid::new_v4().to_string();
        let payload = serde_json::to_string(event.payload())?;

        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO scheduled_tasks (id, event_name, payload, scheduled_at, interval_seconds)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![task_id, event.name(), payload, scheduled_at, interval_seconds],
        )?;

        log::debug!(
            "Scheduled {} ({}) at {:.3}",
            event.name(),
            task_id,
            scheduled_at
        );
        Ok(task_id)
    }

    /// Remove a task. Unknown ids are ignored.
    pub async fn cancel_task(&self, task_id: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM scheduled_tasks WHERE id = ?1", params![task_id])?;
        Ok(())
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Option<ScheduledTask>, StoreError> {
        let row = {
            let conn = self.conn.lock().await;
            conn.query_row(
                &format!("SELECT {TASK_COLUMNS} FROM scheduled_tasks WHERE id = ?1"),
                params![task_id],
                TaskRow::read,
            )
            .optional()?
        };
        row.map(TaskRow::into_task).transpose()
    }

    /// Whether any task (one-off or recurring) emits `event_name`.
    pub async fn has_task_for(&self, event_name: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM scheduled_tasks WHERE event_name = ?1",
            params![event_name],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub async fn get_stats(&self) -> Result<SchedulerStats, StoreError> {
        let now = epoch_now();
        let conn = self.conn.lock().await;
        let (total, recurring, overdue): (i64, i64, i64) = conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(CASE WHEN interval_seconds IS NOT NULL THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN scheduled_at <= ?1 THEN 1 ELSE 0 END), 0)
             FROM scheduled_tasks",
            params![now],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        Ok(SchedulerStats {
            total: total as usize,
            recurring: recurring as usize,
            one_off: (total - recurring) as usize,
            overdue: overdue as usize,
        })
    }

    /// Dispatch every task due at `now`, in insertion order.
    ///
    /// One-off tasks are deleted and recurring tasks move to `now + interval`.
    /// A task whose dispatch fails is left untouched and fires again on the
    /// next tick. Returns the number of tasks fired.
    pub async fn process_ready_tasks(&self, now: f64) -> Result<usize, StoreError> {
        let due = {
            let conn = self.conn.lock().await;
            let mut stmt = conn.prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM scheduled_tasks
                 WHERE status = 'pending' AND scheduled_at <= ?1
                 ORDER BY rowid ASC"
            ))?;
            let rows = stmt
                .query_map(params![now], TaskRow::read)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        let mut fired = 0;
        for row in due {
            let task = match row.into_task() {
                Ok(task) => task,
                Err(e) => {
                    log::error!("Skipping unreadable scheduled task: {}", e);
                    continue;
                }
            };

            let event = Event::new(task.event_name.clone(), task.payload.clone());
            if let Err(e) = self.dispatcher.dispatch(event).await {
                log::error!(
                    "Failed to dispatch scheduled {} ({}): {}",
                    task.event_name,
                    task.id,
                    e
                );
                continue;
            }

            let conn = self.conn.lock().await;
            match task.interval_seconds {
                Some(interval) => {
                    conn.execute(
                        "UPDATE scheduled_tasks SET scheduled_at = ?1 WHERE id = ?2",
                        params![now + interval, task.id],
                    )?;
                }
                None => {
                    conn.execute("DELETE FROM scheduled_tasks WHERE id = ?1", params![task.id])?;
                }
            }
            fired += 1;
        }

        Ok(fired)
    }

    /// Spawn the polling loop. Calling `start` on a running scheduler is a no-op.
    pub async fn start(self: &Arc<Self>) {
        let mut handle = self.loop_handle.lock().await;
        if handle.is_some() {
            return;
        }

        let scheduler = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        let poll_interval = self.poll_interval;

        *handle = Some(tokio::spawn(async move {
            log::info!("Scheduler loop started");
            loop {
                if let Err(e) = scheduler.process_ready_tasks(epoch_now()).await {
                    log::error!("Error in scheduler loop: {}", e);
                }

                tokio::select! {
                    _ = tokio::time::sleep(poll_interval) => {}
                    _ = shutdown.recv() => break,
                }
            }
            log::info!("Scheduler loop stopped");
        }));
    }

    /// Signal the loop to stop and wait for it. Safe if never started.
    pub async fn stop(&self) {
        let handle = self.loop_handle.lock().await.take();
        if let Some(handle) = handle {
            let _ = self.shutdown_tx.send(());
            if let Err(e) = handle.await {
                log::warn!("Scheduler loop ended abnormally: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::dispatcher::handler_fn;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn setup(dir: &tempfile::TempDir) -> (Arc<EventScheduler>, Arc<AtomicUsize>) {
        let dispatcher = Arc::new(EventDispatcher::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&counter);
        dispatcher.subscribe(
            "reminder",
            handler_fn(move |_| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );

        let scheduler = EventScheduler::open(
            &dir.path().join("scheduler.db"),
            dispatcher,
            Duration::from_millis(10),
        )
        .unwrap();
        (Arc::new(scheduler), counter)
    }

    #[tokio::test]
    async fn test_one_off_fires_once_and_is_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, _) = setup(&dir);

        let id = scheduler
            .schedule_after(Duration::from_secs(60), &Event::new("reminder", json!({})))
            .await
            .unwrap();
        let task = scheduler.get_task(&id).await.unwrap().unwrap();
        assert!(!task.is_recurring());

        assert_eq!(scheduler.process_ready_tasks(epoch_now()).await.unwrap(), 0);
        assert_eq!(
            scheduler
                .process_ready_tasks(task.scheduled_at + 1.0)
                .await
                .unwrap(),
            1
        );
        assert!(scheduler.get_task(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_recurring_fires_once_after_missed_ticks() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, _) = setup(&dir);

        let id = scheduler
            .schedule_recurring(Duration::from_secs(10), &Event::new("reminder", json!({})))
            .await
            .unwrap();
        let task = scheduler.get_task(&id).await.unwrap().unwrap();

        // Several intervals have been missed
        let now = task.scheduled_at + 95.0;
        assert_eq!(scheduler.process_ready_tasks(now).await.unwrap(), 1);

        let rescheduled = scheduler.get_task(&id).await.unwrap().unwrap();
        assert!((rescheduled.scheduled_at - (now + 10.0)).abs() < 1e-6);
        assert_eq!(scheduler.process_ready_tasks(now).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_recurring_fires_every_interval() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, counter) = setup(&dir);

        let id = scheduler
            .schedule_recurring(Duration::from_secs(10), &Event::new("reminder", json!({})))
            .await
            .unwrap();
        let first = scheduler.get_task(&id).await.unwrap().unwrap().scheduled_at;

        // Walk 100 seconds of clock, waking exactly when the task is due
        let end = first - 10.0 + 100.0;
        let mut fired = 0;
        loop {
            let at = scheduler.get_task(&id).await.unwrap().unwrap().scheduled_at;
            if at > end + 1e-6 {
                break;
            }
            fired += scheduler.process_ready_tasks(at).await.unwrap();
        }
        assert!(fired >= 10, "fired {} times", fired);

        for _ in 0..100 {
            if counter.load(Ordering::SeqCst) >= fired {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(counter.load(Ordering::SeqCst), fired);
    }

    #[tokio::test]
    async fn test_cancel_and_stats() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, _) = setup(&dir);

        let one_off = scheduler
            .schedule_after(Duration::ZERO, &Event::new("reminder", json!({})))
            .await
            .unwrap();
        scheduler
            .schedule_recurring(Duration::from_secs(3600), &Event::new("report", json!({})))
            .await
            .unwrap();

        let stats = scheduler.get_stats().await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.recurring, 1);
        assert_eq!(stats.one_off, 1);
        assert_eq!(stats.overdue, 1);
        assert!(scheduler.has_task_for("report").await.unwrap());

        scheduler.cancel_task(&one_off).await.unwrap();
        scheduler.cancel_task("no-such-task").await.unwrap();
        assert_eq!(scheduler.get_stats().await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn test_tasks_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let (scheduler, _) = setup(&dir);
            scheduler
                .schedule_recurring(Duration::from_secs(30), &Event::new("reminder", json!({"n": 1})))
                .await
                .unwrap()
        };

        let (reopened, _) = setup(&dir);
        let task = reopened.get_task(&id).await.unwrap().unwrap();
        assert_eq!(task.payload["n"], 1);
        assert_eq!(task.interval_seconds, Some(30.0));
    }

    #[tokio::test]
    async fn test_loop_emits_due_events() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, counter) = setup(&dir);

        scheduler
            .schedule_after(Duration::ZERO, &Event::new("reminder", json!({})))
            .await
            .unwrap();
        scheduler.start().await;

        for _ in 0..100 {
            if counter.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        scheduler.stop().await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_without_start() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, _) = setup(&dir);
        scheduler.stop().await;
    }
}
