//! Short-lived cache of the fetched ready set.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use uuid::Uuid;

use spider_core::task::ScheduleTaskMetadata;

/// A cached ready set goes stale after this long.
const REFRESH_INTERVAL: Duration = Duration::from_millis(10);

/// A cached ready set is discarded after this many selections.
const MAX_USES: u32 = 100;

/// Holds the most recently fetched dispatchable tasks so a burst of worker
/// polls does not hit the store once per poll.
#[derive(Debug, Default)]
pub(crate) struct ReadyTaskCache {
    tasks: HashMap<Uuid, ScheduleTaskMetadata>,
    last_update: Option<Instant>,
    use_count: u32,
}

impl ReadyTaskCache {
    pub(crate) fn should_refresh(&self) -> bool {
        match self.last_update {
            None => true,
            Some(at) => at.elapsed() > REFRESH_INTERVAL || self.use_count > MAX_USES,
        }
    }

    pub(crate) fn replace(&mut self, tasks: Vec<ScheduleTaskMetadata>) {
        self.tasks = tasks.into_iter().map(|task| (task.id, task)).collect();
        self.last_update = Some(Instant::now());
        self.use_count = 0;
    }

    pub(crate) fn note_use(&mut self) {
        self.use_count += 1;
    }

    pub(crate) fn remove(&mut self, id: Uuid) -> Option<ScheduleTaskMetadata> {
        self.tasks.remove(&id)
    }

    pub(crate) fn tasks(&self) -> impl Iterator<Item = &ScheduleTaskMetadata> {
        self.tasks.values()
    }
}
