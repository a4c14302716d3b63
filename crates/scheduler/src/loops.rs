//! Background loops the scheduler binary runs alongside the server.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use spider_core::stop::StopToken;

use spider_storage::{DataStorage, MetadataStorage, StorageFactory};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);
const CLEANUP_INTERVAL: Duration = Duration::from_secs(1000);

/// Consecutive failures before a loop asks the process to stop.
const FAIL_LIMIT: u32 = 5;

/// Refreshes the scheduler's own driver heartbeat every second. Repeated
/// failures request a process-wide stop.
pub async fn heartbeat_loop(
    factory: Arc<dyn StorageFactory>,
    metadata: Arc<dyn MetadataStorage>,
    scheduler_id: Uuid,
    stop: Arc<StopToken>,
) {
    let mut fail_count = 0u32;
    while !stop.stop_requested() {
        tokio::select! {
            _ = stop.wait() => break,
            _ = tokio::time::sleep(HEARTBEAT_INTERVAL) => {}
        }
        tracing::trace!("updating scheduler heartbeat");
        let result = match factory.provide_connection().await {
            Ok(mut conn) => metadata.update_heartbeat(conn.as_mut(), scheduler_id).await,
            Err(err) => Err(err),
        };
        match result {
            Ok(()) => fail_count = 0,
            Err(err) => {
                tracing::error!(%err, "failed to update scheduler heartbeat");
                fail_count += 1;
                if fail_count >= FAIL_LIMIT {
                    stop.request_stop();
                    break;
                }
            }
        }
    }
}

/// Sweeps away drivers whose heartbeat expired. Cascading constraints
/// drop their schedulers, leases, and data references.
pub async fn sweep_loop(
    factory: Arc<dyn StorageFactory>,
    metadata: Arc<dyn MetadataStorage>,
    driver_timeout: Duration,
    stop: Arc<StopToken>,
) {
    while !stop.stop_requested() {
        tokio::select! {
            _ = stop.wait() => break,
            _ = tokio::time::sleep(SWEEP_INTERVAL) => {}
        }
        let mut conn = match factory.provide_connection().await {
            Ok(conn) => conn,
            Err(err) => {
                tracing::error!(%err, "failed to connect to storage for heartbeat sweep");
                continue;
            }
        };
        match metadata.heartbeat_timeout(conn.as_mut(), driver_timeout).await {
            Ok(removed) => {
                for id in removed {
                    tracing::info!(driver_id = %id, "removed driver with expired heartbeat");
                }
            }
            Err(err) => {
                tracing::error!(%err, "heartbeat sweep failed");
            }
        }
    }
}

/// Deletes data rows nothing references anymore.
pub async fn cleanup_loop(
    factory: Arc<dyn StorageFactory>,
    data: Arc<dyn DataStorage>,
    stop: Arc<StopToken>,
) {
    while !stop.stop_requested() {
        tokio::select! {
            _ = stop.wait() => break,
            _ = tokio::time::sleep(CLEANUP_INTERVAL) => {}
        }
        tracing::debug!("starting dangling data cleanup");
        let mut conn = match factory.provide_connection().await {
            Ok(conn) => conn,
            Err(err) => {
                tracing::error!(%err, "failed to connect to storage for cleanup");
                continue;
            }
        };
        if let Err(err) = data.remove_dangling_data(conn.as_mut()).await {
            tracing::error!(%err, "dangling data cleanup failed");
        }
        tracing::debug!("finished dangling data cleanup");
    }
}
