//! Task selection policies.

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use spider_core::error::StorageErr;
use spider_core::task::ScheduleTaskMetadata;

use spider_storage::{MetadataStorage, StorageConnection, StorageFactory};

use crate::cache::ReadyTaskCache;

/// Picks the next task for a polling worker.
#[async_trait]
pub trait SchedulerPolicy: Send {
    async fn schedule_next(
        &mut self,
        worker_id: Uuid,
        worker_addr: &str,
    ) -> Result<Option<Uuid>, StorageErr>;
}

/// First-in-first-out selection with data-locality preferences.
///
/// Tasks whose hard localities exclude the worker are filtered out; among
/// the rest, tasks with a matching soft locality are preferred, and ties
/// break on the oldest job creation time. The candidate set is the leased
/// ready set plus timed-out running tasks eligible for speculative
/// re-dispatch.
pub struct FifoPolicy {
    scheduler_id: Uuid,
    factory: Arc<dyn StorageFactory>,
    metadata: Arc<dyn MetadataStorage>,
    conn: Option<Box<dyn StorageConnection>>,
    cache: ReadyTaskCache,
}

impl FifoPolicy {
    pub fn new(
        scheduler_id: Uuid,
        factory: Arc<dyn StorageFactory>,
        metadata: Arc<dyn MetadataStorage>,
    ) -> Self {
        Self {
            scheduler_id,
            factory,
            metadata,
            conn: None,
            cache: ReadyTaskCache::default(),
        }
    }

    async fn refresh(&mut self) -> Result<(), StorageErr> {
        if self.conn.is_none() {
            self.conn = Some(self.factory.provide_connection().await?);
        }
        let conn = match self.conn.as_mut() {
            Some(conn) => conn.as_mut(),
            None => return Err(StorageErr::Connection("no storage connection".to_string())),
        };
        let mut tasks = self
            .metadata
            .get_ready_tasks(conn, self.scheduler_id)
            .await?;
        tasks.extend(self.metadata.get_task_timeout(conn).await?);
        self.cache.replace(tasks);
        Ok(())
    }

    fn pop_next_task(&mut self, worker_addr: &str) -> Option<Uuid> {
        let selected = select_task(self.cache.tasks(), worker_addr)?;
        self.cache.remove(selected);
        Some(selected)
    }
}

/// The FIFO selection rule over an arbitrary candidate set.
fn select_task<'a>(
    tasks: impl Iterator<Item = &'a ScheduleTaskMetadata>,
    worker_addr: &str,
) -> Option<Uuid> {
    let eligible: Vec<&ScheduleTaskMetadata> = tasks
        .filter(|task| {
            task.hard_localities.is_empty()
                || task.hard_localities.iter().any(|addr| addr == worker_addr)
        })
        .collect();

    let preferred = eligible
        .iter()
        .filter(|task| task.soft_localities.iter().any(|addr| addr == worker_addr))
        .min_by_key(|task| task.job_creation_time)
        .map(|task| task.id);
    if preferred.is_some() {
        return preferred;
    }

    eligible
        .iter()
        .min_by_key(|task| task.job_creation_time)
        .map(|task| task.id)
}

#[async_trait]
impl SchedulerPolicy for FifoPolicy {
    async fn schedule_next(
        &mut self,
        _worker_id: Uuid,
        worker_addr: &str,
    ) -> Result<Option<Uuid>, StorageErr> {
        let refreshed = self.cache.should_refresh();
        if refreshed {
            self.refresh().await?;
        }
        if let Some(task_id) = self.pop_next_task(worker_addr) {
            self.cache.note_use();
            return Ok(Some(task_id));
        }
        if refreshed {
            self.cache.note_use();
            return Ok(None);
        }
        // The cached view may be stale; fall through to a fresh fetch
        // before reporting none.
        self.refresh().await?;
        let task_id = self.pop_next_task(worker_addr);
        self.cache.note_use();
        Ok(task_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn meta(
        creation_secs: i64,
        hard: Vec<&str>,
        soft: Vec<&str>,
    ) -> ScheduleTaskMetadata {
        let mut meta = ScheduleTaskMetadata::new(Uuid::new_v4(), "f", Uuid::new_v4());
        meta.job_creation_time = Utc.timestamp_opt(creation_secs, 0).unwrap();
        meta.hard_localities = hard.into_iter().map(str::to_string).collect();
        meta.soft_localities = soft.into_iter().map(str::to_string).collect();
        meta
    }

    #[test]
    fn hard_locality_excludes_other_workers() {
        let pinned = meta(1, vec!["10.0.0.1"], vec![]);
        let tasks = vec![pinned];
        assert_eq!(select_task(tasks.iter(), "10.0.0.2"), None);
        assert_eq!(select_task(tasks.iter(), "10.0.0.1"), Some(tasks[0].id));
    }

    #[test]
    fn soft_locality_beats_fifo_order() {
        let older = meta(1, vec![], vec![]);
        let newer_local = meta(5, vec![], vec!["10.0.0.1"]);
        let tasks = vec![older.clone(), newer_local.clone()];
        assert_eq!(select_task(tasks.iter(), "10.0.0.1"), Some(newer_local.id));
        assert_eq!(select_task(tasks.iter(), "10.0.0.9"), Some(older.id));
    }

    #[test]
    fn fifo_picks_oldest_job() {
        let older = meta(1, vec![], vec![]);
        let newer = meta(2, vec![], vec![]);
        let tasks = vec![newer, older.clone()];
        assert_eq!(select_task(tasks.iter(), "w"), Some(older.id));
    }
}
