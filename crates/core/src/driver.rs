//! Registered participants: drivers (clients and workers) and schedulers.

use uuid::Uuid;

/// A registered client or worker process, kept alive by heartbeats.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Driver {
    pub id: Uuid,
    pub addr: String,
}

impl Driver {
    pub fn new(id: Uuid, addr: impl Into<String>) -> Self {
        Self {
            id,
            addr: addr.into(),
        }
    }
}

/// A registered scheduler endpoint workers poll for leases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scheduler {
    pub id: Uuid,
    pub addr: String,
    pub port: u16,
}

impl Scheduler {
    pub fn new(id: Uuid, addr: impl Into<String>, port: u16) -> Self {
        Self {
            id,
            addr: addr.into(),
            port,
        }
    }
}
