//! Buffered job submissions.

use uuid::Uuid;

use spider_core::graph::TaskGraph;

/// Groups the inserts of one or more job submissions so the backend can
/// apply them in a single round trip.
#[derive(Debug, Default)]
pub struct JobSubmissionBatch {
    entries: Vec<BatchEntry>,
}

#[derive(Debug)]
pub(crate) struct BatchEntry {
    pub(crate) job_id: Uuid,
    pub(crate) client_id: Uuid,
    pub(crate) graph: TaskGraph,
}

impl JobSubmissionBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn push(&mut self, job_id: Uuid, client_id: Uuid, graph: TaskGraph) {
        self.entries.push(BatchEntry {
            job_id,
            client_id,
            graph,
        });
    }

    pub(crate) fn drain(&mut self) -> Vec<BatchEntry> {
        std::mem::take(&mut self.entries)
    }
}
