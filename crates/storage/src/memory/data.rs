//! Data-store semantics of the in-memory backend.

use async_trait::async_trait;
use uuid::Uuid;

use spider_core::data::{Data, KeyValueData};
use spider_core::error::StorageErr;

use crate::connection::StorageConnection;
use crate::data::DataStorage;
use crate::memory::lock;

/// Data store over [`super::db::MemoryDb`].
#[derive(Debug, Default, Clone, Copy)]
pub struct MemoryDataStorage;

fn no_data(id: Uuid) -> StorageErr {
    StorageErr::KeyNotFound(format!("no data with id {id}"))
}

#[async_trait]
impl DataStorage for MemoryDataStorage {
    async fn initialize(&self, conn: &mut dyn StorageConnection) -> Result<(), StorageErr> {
        lock(conn).map(|_| ())
    }

    async fn add_driver_data(
        &self,
        conn: &mut dyn StorageConnection,
        driver_id: Uuid,
        data: &Data,
    ) -> Result<(), StorageErr> {
        let mut db = lock(conn)?;
        if db.data.contains_key(&data.id) {
            return Err(StorageErr::DuplicateKey(format!(
                "data {} already exists",
                data.id
            )));
        }
        db.data.insert(data.id, data.clone());
        db.driver_refs.insert((data.id, driver_id));
        Ok(())
    }

    async fn add_task_data(
        &self,
        conn: &mut dyn StorageConnection,
        task_id: Uuid,
        data: &Data,
    ) -> Result<(), StorageErr> {
        let mut db = lock(conn)?;
        if db.data.contains_key(&data.id) {
            return Err(StorageErr::DuplicateKey(format!(
                "data {} already exists",
                data.id
            )));
        }
        db.data.insert(data.id, data.clone());
        db.task_refs.insert((data.id, task_id));
        Ok(())
    }

    async fn get_data(
        &self,
        conn: &mut dyn StorageConnection,
        id: Uuid,
    ) -> Result<Data, StorageErr> {
        let db = lock(conn)?;
        db.data.get(&id).cloned().ok_or_else(|| no_data(id))
    }

    async fn get_driver_data(
        &self,
        conn: &mut dyn StorageConnection,
        driver_id: Uuid,
        id: Uuid,
    ) -> Result<Data, StorageErr> {
        let db = lock(conn)?;
        if !db.driver_refs.contains(&(id, driver_id)) {
            return Err(no_data(id));
        }
        db.data.get(&id).cloned().ok_or_else(|| no_data(id))
    }

    async fn get_task_data(
        &self,
        conn: &mut dyn StorageConnection,
        task_id: Uuid,
        id: Uuid,
    ) -> Result<Data, StorageErr> {
        let db = lock(conn)?;
        if !db.task_refs.contains(&(id, task_id)) {
            return Err(no_data(id));
        }
        db.data.get(&id).cloned().ok_or_else(|| no_data(id))
    }

    async fn set_data_locality(
        &self,
        conn: &mut dyn StorageConnection,
        data: &Data,
    ) -> Result<(), StorageErr> {
        let mut db = lock(conn)?;
        let row = db.data.get_mut(&data.id).ok_or_else(|| no_data(data.id))?;
        row.localities = data.localities.clone();
        row.hard_locality = data.hard_locality;
        Ok(())
    }

    async fn remove_data(
        &self,
        conn: &mut dyn StorageConnection,
        id: Uuid,
    ) -> Result<(), StorageErr> {
        let mut db = lock(conn)?;
        db.data.remove(&id).ok_or_else(|| no_data(id))?;
        db.driver_refs.retain(|(data_id, _)| *data_id != id);
        db.task_refs.retain(|(data_id, _)| *data_id != id);
        Ok(())
    }

    async fn add_task_reference(
        &self,
        conn: &mut dyn StorageConnection,
        id: Uuid,
        task_id: Uuid,
    ) -> Result<(), StorageErr> {
        let mut db = lock(conn)?;
        if !db.data.contains_key(&id) {
            return Err(no_data(id));
        }
        db.task_refs.insert((id, task_id));
        Ok(())
    }

    async fn remove_task_reference(
        &self,
        conn: &mut dyn StorageConnection,
        id: Uuid,
        task_id: Uuid,
    ) -> Result<(), StorageErr> {
        let mut db = lock(conn)?;
        db.task_refs.remove(&(id, task_id));
        Ok(())
    }

    async fn add_driver_reference(
        &self,
        conn: &mut dyn StorageConnection,
        id: Uuid,
        driver_id: Uuid,
    ) -> Result<(), StorageErr> {
        let mut db = lock(conn)?;
        if !db.data.contains_key(&id) {
            return Err(no_data(id));
        }
        db.driver_refs.insert((id, driver_id));
        Ok(())
    }

    async fn remove_driver_reference(
        &self,
        conn: &mut dyn StorageConnection,
        id: Uuid,
        driver_id: Uuid,
    ) -> Result<(), StorageErr> {
        let mut db = lock(conn)?;
        db.driver_refs.remove(&(id, driver_id));
        Ok(())
    }

    async fn remove_dangling_data(
        &self,
        conn: &mut dyn StorageConnection,
    ) -> Result<(), StorageErr> {
        let mut db = lock(conn)?;
        let referenced: std::collections::HashSet<Uuid> = db
            .driver_refs
            .iter()
            .map(|(data_id, _)| *data_id)
            .chain(db.task_refs.iter().map(|(data_id, _)| *data_id))
            .collect();
        db.data.retain(|id, _| referenced.contains(id));
        Ok(())
    }

    async fn add_client_kv_data(
        &self,
        conn: &mut dyn StorageConnection,
        data: &KeyValueData,
    ) -> Result<(), StorageErr> {
        let mut db = lock(conn)?;
        db.client_kv
            .insert((data.owner_id, data.key.clone()), data.value.clone());
        Ok(())
    }

    async fn add_task_kv_data(
        &self,
        conn: &mut dyn StorageConnection,
        data: &KeyValueData,
    ) -> Result<(), StorageErr> {
        let mut db = lock(conn)?;
        db.task_kv
            .insert((data.owner_id, data.key.clone()), data.value.clone());
        Ok(())
    }

    async fn get_client_kv_data(
        &self,
        conn: &mut dyn StorageConnection,
        client_id: Uuid,
        key: &str,
    ) -> Result<String, StorageErr> {
        let db = lock(conn)?;
        db.client_kv
            .get(&(client_id, key.to_string()))
            .cloned()
            .ok_or_else(|| StorageErr::KeyNotFound(format!("no value for key {key}")))
    }

    async fn get_task_kv_data(
        &self,
        conn: &mut dyn StorageConnection,
        task_id: Uuid,
        key: &str,
    ) -> Result<String, StorageErr> {
        let db = lock(conn)?;
        db.task_kv
            .get(&(task_id, key.to_string()))
            .cloned()
            .ok_or_else(|| StorageErr::KeyNotFound(format!("no value for key {key}")))
    }
}
