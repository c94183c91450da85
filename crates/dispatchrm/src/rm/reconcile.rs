//! Dispatches that outlived their allocation, e.g. because the resource manager was
//! not running when the allocation finished, are terminated at startup.

use std::sync::Arc;

use futures::future::join_all;

use crate::rm::cleanup::DispatchCleanup;
use crate::store::{Dispatch, DispatchStore};

/// Stored dispatches whose allocation has finished or is no longer known.
/// A dispatch whose allocation cannot be looked up is left alone.
pub async fn find_orphaned_dispatches(
    store: &Arc<dyn DispatchStore>,
) -> crate::Result<Vec<Dispatch>> {
    let dispatches = store.list_all_dispatches().await?;
    let mut orphaned = Vec::new();
    for dispatch in dispatches {
        match store.allocation_by_id(&dispatch.allocation_id).await {
            Ok(Some(allocation)) if allocation.is_active() => {
                log::debug!(
                    "Dispatch {} belongs to active allocation {}",
                    dispatch.dispatch_id,
                    dispatch.allocation_id
                );
            }
            Ok(_) => orphaned.push(dispatch),
            Err(error) => {
                log::warn!(
                    "Could not look up allocation {} of dispatch {}: {error}",
                    dispatch.allocation_id,
                    dispatch.dispatch_id
                );
            }
        }
    }
    Ok(orphaned)
}

pub async fn terminate_orphaned_dispatches(cleanup: DispatchCleanup, dispatches: Vec<Dispatch>) {
    join_all(dispatches.iter().map(|dispatch| {
        log::info!(
            "Terminating dispatch {} of inactive allocation {}",
            dispatch.dispatch_id,
            dispatch.allocation_id
        );
        cleanup.terminate_and_delete(&dispatch.impersonated_user, &dispatch.dispatch_id)
    }))
    .await;
}
