//! Feature resource initialization and release.

use relay_core::{RelayError, Result};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::feature::FeatureResource;

/// Initialize every resource with at most `concurrency` initializations in flight.
///
/// Returns once all have finished. The first failure aborts the initializations
/// still pending and is returned.
pub async fn initialize_resources(
    resources: Vec<Arc<dyn FeatureResource>>,
    concurrency: usize,
) -> Result<()> {
    if resources.is_empty() {
        return Ok(());
    }
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut join_set = JoinSet::new();

    for resource in resources {
        let sem = Arc::clone(&semaphore);
        join_set.spawn(async move {
            let _permit = sem
                .acquire_owned()
                .await
                .map_err(|e| RelayError::Resource {
                    resource: resource.name().to_string(),
                    reason: e.to_string(),
                })?;
            debug!(resource = resource.name(), "initializing feature resource");
            resource.initialize().await
        });
    }

    while let Some(joined) = join_set.join_next().await {
        let outcome = joined.map_err(|e| RelayError::Resource {
            resource: "<task>".into(),
            reason: e.to_string(),
        });
        if let Err(e) = outcome.and_then(|r| r) {
            join_set.abort_all();
            while join_set.join_next().await.is_some() {}
            return Err(e);
        }
    }
    Ok(())
}

/// Close resources one by one in the given order.
///
/// Every resource is attempted; failures are logged and the first one is returned.
pub async fn close_resources(resources: &[Arc<dyn FeatureResource>]) -> Result<()> {
    let mut first_error = None;
    for resource in resources {
        debug!(resource = resource.name(), "closing feature resource");
        if let Err(e) = resource.close().await {
            warn!(resource = resource.name(), error = %e, "failed to close feature resource");
            first_error.get_or_insert(e);
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
