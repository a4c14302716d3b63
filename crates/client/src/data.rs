//! Client-held data handles.
//!
//! A handle implies a driver reference in the store. Dropping the handle
//! schedules the reference removal exactly once; a drop that happens while
//! unwinding from a panic leaves the reference in place so a crashed
//! client cannot half-delete state it may not own anymore.

use tokio::sync::mpsc;
use uuid::Uuid;

use spider_core::data::Data;
use spider_core::envelope::{pack_value, unpack_value};

use crate::driver::{CleanupAction, Driver};
use crate::error::ClientError;
use crate::registry::{DataRef, TaskValue};

/// Builder for driver-owned data.
pub struct DataBuilder<'a> {
    driver: &'a Driver,
    localities: Vec<String>,
    hard_locality: bool,
}

impl<'a> DataBuilder<'a> {
    pub(crate) fn new(driver: &'a Driver) -> Self {
        Self {
            driver,
            localities: Vec::new(),
            hard_locality: false,
        }
    }

    /// Worker addresses where this datum is available.
    pub fn locality(mut self, addrs: Vec<String>) -> Self {
        self.localities = addrs;
        self
    }

    /// When set, only workers at one of the locality addresses may run
    /// tasks consuming this datum.
    pub fn hard_locality(mut self, hard: bool) -> Self {
        self.hard_locality = hard;
        self
    }

    /// Encodes and stores the value, returning a reference-holding handle.
    pub async fn build<T: TaskValue>(self, value: &T) -> Result<DataHandle, ClientError> {
        self.build_bytes(pack_value(value)?).await
    }

    /// Stores an already-encoded value.
    pub async fn build_bytes(self, bytes: Vec<u8>) -> Result<DataHandle, ClientError> {
        let mut data = Data::new(bytes.clone());
        data.localities = self.localities;
        data.hard_locality = self.hard_locality;
        let id = data.id;

        let handles = self.driver.storage_handles();
        let mut conn = handles.factory.provide_connection().await?;
        handles
            .data
            .add_driver_data(conn.as_mut(), self.driver.id(), &data)
            .await?;

        Ok(DataHandle {
            id,
            value: bytes,
            guard: RefGuard {
                tx: self.driver.cleanup_sender(),
                data_id: id,
                driver_id: self.driver.id(),
                armed: true,
            },
        })
    }
}

/// A driver-held reference to a stored datum.
pub struct DataHandle {
    id: Uuid,
    value: Vec<u8>,
    guard: RefGuard,
}

impl DataHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Reference to pass into task graphs.
    pub fn data_ref(&self) -> DataRef {
        DataRef(self.id)
    }

    pub fn value_bytes(&self) -> &[u8] {
        &self.value
    }

    pub fn decode<T: TaskValue>(&self) -> Result<T, ClientError> {
        Ok(unpack_value(&self.value)?)
    }

    /// Keeps the datum alive past this handle: the reference removal is
    /// disarmed and the caller takes over the reference's lifetime.
    pub fn persist(mut self) -> DataRef {
        self.guard.armed = false;
        DataRef(self.id)
    }
}

/// One-shot removal action, activated on normal drop only.
struct RefGuard {
    tx: mpsc::UnboundedSender<CleanupAction>,
    data_id: Uuid,
    driver_id: Uuid,
    armed: bool,
}

impl Drop for RefGuard {
    fn drop(&mut self) {
        if self.armed && !std::thread::panicking() {
            let _ = self.tx.send(CleanupAction::RemoveDriverReference {
                data_id: self.data_id,
                driver_id: self.driver_id,
            });
        }
    }
}
