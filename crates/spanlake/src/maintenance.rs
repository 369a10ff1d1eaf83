//! Bucket maintenance for ephemeral test buckets.

use std::sync::Arc;

use futures::{StreamExt, TryStreamExt};
use object_store::ObjectStore;

use crate::SpanlakeError;

/// Delete every object in the bucket.
///
/// Intended for ephemeral test buckets only; any listing or delete error is
/// fatal to startup.
pub async fn empty_bucket(store: Arc<dyn ObjectStore>) -> Result<(), SpanlakeError> {
    let locations = store.list(None).map_ok(|meta| meta.location).boxed();
    let deleted = store
        .delete_stream(locations)
        .try_collect::<Vec<_>>()
        .await?;
    tracing::info!(objects = deleted.len(), "emptied bucket");
    Ok(())
}
