//! Estimated document count comparison.

use tracing::{info, warn};

use super::{Ctx, NamespacePair};
use crate::error::Result;

impl Ctx {
    /// Compare the estimated counts of both sides. Drift is reported but
    /// never fatal; estimated counts come from collection metadata and can
    /// be stale after unclean shutdowns.
    pub(crate) async fn compare_estimated_counts(&self, pair: &NamespacePair) -> Result<()> {
        let (source, target) = self.estimates(pair).await?;
        info!(source, target, "estimated document counts");

        if self.config.dry_run {
            return Ok(());
        }

        if source != target {
            self.reports
                .mismatch_count(&pair.name(), source as i64, target as i64)
                .await;
            warn!(
                "estimated document counts don't match (NOTE: this can be the result of \
                 metadata differences from unclean shutdowns, consider running a more exact \
                 countDocuments if all other checks pass)"
            );
        } else {
            info!("estimated document counts match");
        }
        Ok(())
    }

    pub(crate) async fn estimates(&self, pair: &NamespacePair) -> Result<(u64, u64)> {
        let source = self
            .source_collection(&pair.db, &pair.collection)
            .estimated_document_count(None)
            .await?;
        let target = self
            .target_collection(&pair.db, &pair.collection)
            .estimated_document_count(None)
            .await?;
        Ok((source, target))
    }
}
