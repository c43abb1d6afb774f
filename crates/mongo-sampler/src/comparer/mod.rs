//! Comparison orchestrator.
//!
//! Conducts comparison between one or more namespace pairs. Comparison of a
//! pair includes:
//!
//! 1. estimated document count
//! 2. metadata & index comparison
//! 3. random sampling of documents (unordered field comparison)
//!
//! Namespace pairs flow through an unbuffered channel to a fixed pool of
//! namespace workers; every check emits typed records to the reporter. After
//! the workers join, the report channel is closed exactly once and the
//! reporter drains.

mod count;
mod indexes;
mod sample_docs;
mod wrappers;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bson::Document;
use chrono::{DateTime, Utc};
use mongodb::{Client, Collection};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn, Instrument};

use crate::config::Config;
use crate::diff;
use crate::error::{Result, SamplerError};
use crate::ns::{self, Namespace};
use crate::reporter::{Location, ReportHandle, Reporter};
use crate::util::{self, Pair};
use crate::worker::Pool;

pub(crate) const BATCH_SIZE: usize = 100;
const NUM_WORKERS: usize = 4;

/// A namespace that exists (in some form) on both sides, with its partition
/// layout queried independently per side.
#[derive(Debug, Clone)]
pub struct NamespacePair {
    pub db: String,
    pub collection: String,
    pub partitioned: Pair<bool>,
    pub partition_key: Pair<Option<Document>>,
    pub spec: ns::CollectionSpec,
}

impl NamespacePair {
    pub fn name(&self) -> String {
        format!("{}.{}", self.db, self.collection)
    }
}

impl fmt::Display for NamespacePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.collection)
    }
}

struct NamespaceMap {
    source: Vec<Namespace>,
    target: Vec<Namespace>,
}

/// Entry point for a verification run.
pub struct Comparer {
    ctx: Ctx,
    reporter: Reporter,
}

/// Everything a namespace worker needs; cheap to clone.
#[derive(Clone)]
pub(crate) struct Ctx {
    pub(crate) config: Arc<Config>,
    pub(crate) source: Client,
    pub(crate) target: Client,
    pub(crate) reports: ReportHandle,
    pub(crate) filters: Arc<HashMap<String, Document>>,
}

impl Comparer {
    /// Build the comparer and its reporter. Reads the filter file and, when
    /// `clean` is configured, drops the metadata database.
    pub async fn new(
        config: Config,
        source: Client,
        target: Client,
        meta: Client,
        start_time: DateTime<Utc>,
    ) -> Result<Self> {
        config.validate()?;
        let filters = config.load_filters()?;
        let reporter = Reporter::new(
            meta,
            config.meta_db_name.clone(),
            config.clean_meta,
            start_time,
            config.report_full_doc,
        )
        .await?;
        let ctx = Ctx {
            reports: reporter.handle(),
            config: Arc::new(config),
            source,
            target,
            filters: Arc::new(filters),
        };
        Ok(Self { ctx, reporter })
    }

    /// Compare all user namespaces, drive the per-namespace checks, then
    /// drain the reporter.
    pub async fn compare(self, cancel: CancellationToken) -> Result<()> {
        let Comparer { ctx, reporter } = self;

        // workers drain this channel; dropping the sender is their only
        // shutdown signal
        let (pairs_tx, pairs_rx) = async_channel::bounded::<NamespacePair>(1);

        let mut pool = Pool::new(NUM_WORKERS, "namespaceWorkers");
        pool.start(|_idx| {
            let ctx = ctx.clone();
            let rx = pairs_rx.clone();
            let cancel = cancel.clone();
            async move {
                while let Ok(pair) = rx.recv().await {
                    if cancel.is_cancelled() {
                        break;
                    }
                    ctx.check_namespace(&cancel, &pair).await;
                }
            }
        });
        drop(pairs_rx);

        let stream_result = ctx.stream_namespaces(&cancel, &pairs_tx).await;
        drop(pairs_tx);
        pool.done().await;

        // every emitter is gone; close the report channel and let the
        // reporter drain
        drop(ctx);
        reporter.done().await;
        stream_result
    }
}

impl Ctx {
    pub(crate) fn source_collection(&self, db: &str, coll: &str) -> Collection<Document> {
        self.source.database(db).collection(coll)
    }

    pub(crate) fn target_collection(&self, db: &str, coll: &str) -> Collection<Document> {
        self.target.database(db).collection(coll)
    }

    pub(crate) fn filter_for(&self, ns: &str) -> Option<&Document> {
        self.filters.get(ns)
    }

    /// Run all checks for one pair. Each step is independent; a failure in
    /// one is logged and does not abort the others.
    async fn check_namespace(&self, cancel: &CancellationToken, pair: &NamespacePair) {
        let span = tracing::info_span!("ns", ns = %pair);
        async {
            info!("beginning validation");
            if let Err(err) = self.compare_estimated_counts(pair).await {
                error!(error = %err, "estimated count check failed");
            }
            if !self.config.dry_run {
                if let Err(err) = self.compare_indexes(pair).await {
                    error!(error = %err, "index check failed");
                }
                if let Err(err) = self.compare_sample_docs(cancel, pair).await {
                    error!(error = %err, "sample document check failed");
                }
            }
            info!("finished validation");
        }
        .instrument(span)
        .await
    }

    /// Diff the two catalogs, report missing/different namespaces, and queue
    /// a pair for every namespace present on both sides.
    async fn stream_namespaces(
        &self,
        cancel: &CancellationToken,
        pairs: &async_channel::Sender<NamespacePair>,
    ) -> Result<()> {
        let ns_map = self.resolve_namespaces().await?;
        let source = diff::sort_by_name(wrappers::wrap_namespaces(ns_map.source));
        let target = diff::sort_by_name(wrappers::wrap_namespaces(ns_map.target));

        let comparison = diff::diff(&source, &target);
        trace!(comparison = %comparison, "namespace catalogs walked");
        if comparison.has_mismatches() {
            warn!("there are namespace mismatches between source and target");
            debug!(comparison = %comparison, "namespace mismatch details");
        }

        for entry in &comparison.equal {
            self.push_pair(cancel, &entry.ns, pairs).await?;
        }
        if self.config.dry_run {
            return Ok(());
        }
        for entry in &comparison.missing_on_src {
            let name = entry.ns.to_string();
            error!(ns = %name, "namespace missing on the source");
            self.reports.missing_namespace(&name, Location::Source).await;
        }
        for entry in &comparison.missing_on_tgt {
            let name = entry.ns.to_string();
            error!(ns = %name, "namespace missing on the target");
            self.reports.missing_namespace(&name, Location::Target).await;
        }
        for diff_pair in &comparison.different {
            let name = diff_pair.source.ns.to_string();
            error!(ns = %name, "namespace differs between the source and target");
            self.reports
                .mismatch_namespace(
                    &name,
                    diff_pair.source.ns.spec.to_document(),
                    diff_pair.target.ns.spec.to_document(),
                )
                .await;
            // still worth checking contents
            self.push_pair(cancel, &diff_pair.source.ns, pairs).await?;
        }
        Ok(())
    }

    /// Query partition info for both sides and queue the pair. A catalog
    /// error here skips the namespace; the rest of the run continues.
    async fn push_pair(
        &self,
        cancel: &CancellationToken,
        namespace: &Namespace,
        pairs: &async_channel::Sender<NamespacePair>,
    ) -> Result<()> {
        let name = namespace.to_string();
        let source_info =
            match ns::partition_info(&self.source, &namespace.db, &namespace.collection).await {
                Ok(info) => info,
                Err(err) => {
                    error!(ns = %name, error = %err, "source partition lookup failed, skipping namespace");
                    return Ok(());
                }
            };
        let target_info =
            match ns::partition_info(&self.target, &namespace.db, &namespace.collection).await {
                Ok(info) => info,
                Err(err) => {
                    error!(ns = %name, error = %err, "target partition lookup failed, skipping namespace");
                    return Ok(());
                }
            };

        // asymmetric partitioning alone is not a mismatch
        if source_info.0 != target_info.0 {
            warn!(
                ns = %name,
                source = source_info.0,
                target = target_info.0,
                "partitioning differs between source and target"
            );
        }

        let pair = NamespacePair {
            db: namespace.db.clone(),
            collection: namespace.collection.clone(),
            partitioned: Pair::new(source_info.0, target_info.0),
            partition_key: Pair::new(source_info.1, target_info.1),
            spec: namespace.spec.clone(),
        };
        trace!(ns = %pair, "queueing namespace pair");
        tokio::select! {
            _ = cancel.cancelled() => Err(SamplerError::Cancelled),
            sent = pairs.send(pair) => {
                // workers only disappear once this sender is dropped
                let _ = sent;
                Ok(())
            }
        }
    }

    async fn resolve_namespaces(&self) -> Result<NamespaceMap> {
        if !self.config.include_ns.is_empty() {
            info!(include = ?self.config.include_ns, "looking for included namespaces");
            return self.included_user_namespaces(&self.config.include_ns).await;
        }
        info!("looking for all user namespaces");
        let excluded = vec![self.config.meta_db_name.clone()];
        let source = ns::all_user_namespaces(&self.source, false, &excluded).await?;
        let target = ns::all_user_namespaces(&self.target, false, &excluded).await?;
        Ok(NamespaceMap { source, target })
    }

    /// Each include token is fetched independently from each side; a side
    /// that lacks it simply contributes nothing, and the diff reports it.
    async fn included_user_namespaces(&self, included: &[String]) -> Result<NamespaceMap> {
        let mut source = Vec::new();
        let mut target = Vec::new();
        for token in included {
            let (db, coll) = match util::split_namespace(token) {
                Ok(parts) => parts,
                Err(err) => {
                    error!(error = %err, "skipping malformed namespace token");
                    continue;
                }
            };
            match ns::one_user_namespace(&self.source, db, coll).await {
                Ok(namespace) => source.push(namespace),
                Err(err) => debug!(ns = %token, error = %err, "not found on source"),
            }
            match ns::one_user_namespace(&self.target, db, coll).await {
                Ok(namespace) => target.push(namespace),
                Err(err) => debug!(ns = %token, error = %err, "not found on target"),
            }
        }
        Ok(NamespaceMap { source, target })
    }
}
