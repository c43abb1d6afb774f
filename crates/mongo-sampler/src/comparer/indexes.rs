//! Index specification comparison.

use bson::{doc, Document};
use futures::TryStreamExt;
use mongodb::Collection;
use tracing::{error, info, trace};

use super::wrappers::IndexSpec;
use super::{Ctx, NamespacePair};
use crate::diff::{self, NamedComparable};
use crate::error::Result;
use crate::reporter::Location;

impl Ctx {
    /// Fetch the ordered index specifications from both sides, diff them,
    /// and emit one report per missing or different index.
    pub(crate) async fn compare_indexes(&self, pair: &NamespacePair) -> Result<()> {
        let ns_name = pair.name();
        let (source, target) = self.fetch_indexes(pair).await?;

        let comparison = diff::diff(&source, &target);
        trace!(comparison = %comparison, "index catalogs walked");
        if comparison.has_mismatches() {
            error!("indexes are not the same");
        } else {
            info!("indexes match");
        }

        for each in &comparison.missing_on_src {
            error!(index = each.name(), "index missing on the source");
            self.reports
                .missing_index(&ns_name, each.spec.clone(), Location::Source)
                .await;
        }
        for each in &comparison.missing_on_tgt {
            error!(index = each.name(), "index missing on the target");
            self.reports
                .missing_index(&ns_name, each.spec.clone(), Location::Target)
                .await;
        }
        for diff_pair in &comparison.different {
            error!(
                index = diff_pair.source.name(),
                "index differs between the source and target"
            );
            self.reports
                .mismatch_index(
                    &ns_name,
                    diff_pair.source.spec.clone(),
                    diff_pair.target.spec.clone(),
                )
                .await;
        }
        Ok(())
    }

    async fn fetch_indexes(&self, pair: &NamespacePair) -> Result<(Vec<IndexSpec>, Vec<IndexSpec>)> {
        // $indexStats carries the full raw spec; sorting server-side keeps
        // the fetch deterministic, the name sort below is what the walker
        // requires
        let pipeline = vec![
            doc! { "$indexStats": {} },
            doc! { "$sort": { "spec": 1 } },
            doc! { "$replaceRoot": { "newRoot": "$spec" } },
        ];
        let source = self
            .collect_indexes(self.source_collection(&pair.db, &pair.collection), &pipeline)
            .await?;
        let target = self
            .collect_indexes(self.target_collection(&pair.db, &pair.collection), &pipeline)
            .await?;
        Ok((diff::sort_by_name(source), diff::sort_by_name(target)))
    }

    async fn collect_indexes(
        &self,
        collection: Collection<Document>,
        pipeline: &[Document],
    ) -> Result<Vec<IndexSpec>> {
        let mut cursor = collection.aggregate(pipeline.to_vec(), None).await?;
        let mut specs = Vec::new();
        while let Some(spec) = cursor.try_next().await? {
            specs.push(IndexSpec::new(spec)?);
        }
        Ok(specs)
    }
}
