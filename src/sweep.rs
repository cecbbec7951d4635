//! Reclamation sweep: return items whose lease expired to the pool.
//!
//! There is no background timer. The sweep runs inline at the start of every
//! claim, and on demand from the operator CLI. Races with a late renewal are
//! settled by the store's per-item compare-and-swap: whichever lands first
//! wins and the other sees its precondition fail.

use std::time::Instant;

use opentelemetry::KeyValue;
use tracing::{debug, info};

use crate::error::Result;
use crate::store::Store;
use crate::telemetry::metrics;

/// Run one sweep over `store`. Returns how many items were reclaimed.
///
/// Storage faults propagate; an item that could not be examined keeps its
/// previous state.
pub async fn reclaim_expired<S: Store + ?Sized>(store: &S) -> Result<u64> {
    let started = Instant::now();
    let reclaimed = store.reclaim_expired().await?;

    metrics::operation_duration_ms().record(
        started.elapsed().as_secs_f64() * 1000.0,
        &[KeyValue::new("operation", "lease.sweep")],
    );
    if reclaimed > 0 {
        metrics::leases_reclaimed().add(reclaimed, &[KeyValue::new("backend", store.backend())]);
        info!(backend = store.backend(), reclaimed, "reclaimed expired leases");
    } else {
        debug!(backend = store.backend(), "nothing to reclaim");
    }
    Ok(reclaimed)
}
