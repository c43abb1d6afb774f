//! Background reporter: a single-writer task draining a typed channel and
//! upserting findings into the metadata database.
//!
//! Dispatch per reason:
//! - `docMismatch` / `docMissing` land in the `docs` collection, keyed by
//!   `{reason, run, ns, key}` with `$set` semantics, so the last observation
//!   for a given `_id` wins.
//! - `collSampleSummary` lands in the `report` collection, keyed by
//!   `{reason, run, ns}` with `$inc` semantics, so per-batch deltas
//!   accumulate into per-namespace totals.
//! - everything else lands in `report` keyed with a fresh object id,
//!   effectively an insert.
//!
//! `run` is the process start time; querying `{run: <ts>}` returns one run's
//! results. The channel is small on purpose: slow metadata writes propagate
//! backpressure to every emitter.

mod types;

pub use types::{DocSummary, Direction, Location, Reason};

use bson::oid::ObjectId;
use bson::{doc, DateTime as BsonDateTime, Document};
use chrono::{DateTime, Utc};
use mongodb::options::UpdateOptions;
use mongodb::Client;
use tracing::{debug, error, info};

use crate::error::Result;
use crate::worker::Pool;

const NUM_REPORTERS: usize = 1;
// senders block as soon as the writer falls behind
const CHANNEL_CAPACITY: usize = 1;

const REPORT_COLLECTION: &str = "report";
const DOCS_COLLECTION: &str = "docs";

/// One finding, tagged by reason. The writer pattern-matches to choose the
/// destination collection, filter key, and update operator.
#[derive(Debug, Clone)]
pub enum Report {
    NamespaceMissing {
        ns: String,
        missing_from: Location,
    },
    NamespaceMismatch {
        ns: String,
        source: Document,
        target: Document,
    },
    CountMismatch {
        ns: String,
        source: i64,
        target: i64,
    },
    IndexMissing {
        ns: String,
        index: Document,
        missing_from: Location,
    },
    IndexMismatch {
        ns: String,
        source: Document,
        target: Document,
    },
    DocMissing {
        ns: String,
        direction: Direction,
        key: String,
        document: Document,
    },
    DocMismatch {
        ns: String,
        direction: Direction,
        key: String,
        source: Document,
        target: Document,
    },
    SampleSummary {
        ns: String,
        direction: Direction,
        summary: DocSummary,
    },
}

impl Report {
    pub fn reason(&self) -> Reason {
        match self {
            Report::NamespaceMissing { .. } => Reason::NamespaceMissing,
            Report::NamespaceMismatch { .. } => Reason::NamespaceMismatch,
            Report::CountMismatch { .. } => Reason::CountMismatch,
            Report::IndexMissing { .. } => Reason::IndexMissing,
            Report::IndexMismatch { .. } => Reason::IndexMismatch,
            Report::DocMissing { .. } => Reason::DocMissing,
            Report::DocMismatch { .. } => Reason::DocMismatch,
            Report::SampleSummary { .. } => Reason::CollSampleSummary,
        }
    }

    pub fn ns(&self) -> &str {
        match self {
            Report::NamespaceMissing { ns, .. }
            | Report::NamespaceMismatch { ns, .. }
            | Report::CountMismatch { ns, .. }
            | Report::IndexMissing { ns, .. }
            | Report::IndexMismatch { ns, .. }
            | Report::DocMissing { ns, .. }
            | Report::DocMismatch { ns, .. }
            | Report::SampleSummary { ns, .. } => ns,
        }
    }

    /// The upsert this report turns into. Pure, so the coalescing contract is
    /// testable without a live metadata store.
    fn plan(&self, run: BsonDateTime, report_full_doc: bool) -> WritePlan {
        let reason = self.reason().as_str();
        match self {
            Report::NamespaceMissing { ns, missing_from } => WritePlan {
                collection: REPORT_COLLECTION,
                filter: doc! { "reason": reason, "run": run, "ns": ns, "_id": ObjectId::new() },
                update: doc! { "$set": { "missingFrom": missing_from.as_str() } },
            },
            Report::NamespaceMismatch { ns, source, target } => WritePlan {
                collection: REPORT_COLLECTION,
                filter: doc! { "reason": reason, "run": run, "ns": ns, "_id": ObjectId::new() },
                update: doc! { "$set": { "source": source, "target": target } },
            },
            Report::CountMismatch { ns, source, target } => WritePlan {
                collection: REPORT_COLLECTION,
                filter: doc! { "reason": reason, "run": run, "ns": ns, "_id": ObjectId::new() },
                update: doc! { "$set": { "source": source, "target": target } },
            },
            Report::IndexMissing { ns, index, missing_from } => WritePlan {
                collection: REPORT_COLLECTION,
                filter: doc! { "reason": reason, "run": run, "ns": ns, "_id": ObjectId::new() },
                update: doc! { "$set": { "missingFrom": missing_from.as_str(), "index": index } },
            },
            Report::IndexMismatch { ns, source, target } => WritePlan {
                collection: REPORT_COLLECTION,
                filter: doc! { "reason": reason, "run": run, "ns": ns, "_id": ObjectId::new() },
                update: doc! { "$set": { "source": source, "target": target } },
            },
            Report::DocMissing { ns, direction, key, document } => {
                let mut set = doc! {
                    "direction": direction.as_str(),
                    "missingFrom": direction.missing_from().as_str(),
                };
                if report_full_doc {
                    set.insert("doc", document);
                }
                WritePlan {
                    collection: DOCS_COLLECTION,
                    filter: doc! { "reason": reason, "run": run, "ns": ns, "key": key },
                    update: doc! { "$set": set },
                }
            }
            Report::DocMismatch { ns, direction, key, source, target } => {
                let mut set = doc! { "direction": direction.as_str() };
                if report_full_doc {
                    set.insert("source", source);
                    set.insert("target", target);
                }
                WritePlan {
                    collection: DOCS_COLLECTION,
                    filter: doc! { "reason": reason, "run": run, "ns": ns, "key": key },
                    update: doc! { "$set": set },
                }
            }
            Report::SampleSummary { ns, direction, summary } => {
                let dir = direction.key();
                let mut inc = Document::new();
                inc.insert(format!("{}.equal", dir), summary.equal);
                inc.insert(format!("{}.different", dir), summary.different);
                inc.insert(format!("{}.missing", dir), summary.missing);
                WritePlan {
                    collection: REPORT_COLLECTION,
                    filter: doc! { "reason": reason, "run": run, "ns": ns },
                    update: doc! { "$inc": inc },
                }
            }
        }
    }
}

struct WritePlan {
    collection: &'static str,
    filter: Document,
    update: Document,
}

/// Cheap-to-clone sending side of the report channel.
#[derive(Debug, Clone)]
pub struct ReportHandle {
    tx: async_channel::Sender<Report>,
}

impl ReportHandle {
    async fn send(&self, report: Report) {
        // a closed channel means the writer is gone; the finding is lost but
        // the run continues
        if let Err(err) = self.tx.send(report).await {
            error!(report = ?err.0, "reporter channel closed, dropping report");
        }
    }

    pub async fn missing_namespace(&self, ns: &str, missing_from: Location) {
        self.send(Report::NamespaceMissing { ns: ns.to_string(), missing_from })
            .await;
    }

    pub async fn mismatch_namespace(&self, ns: &str, source: Document, target: Document) {
        self.send(Report::NamespaceMismatch { ns: ns.to_string(), source, target })
            .await;
    }

    pub async fn mismatch_count(&self, ns: &str, source: i64, target: i64) {
        self.send(Report::CountMismatch { ns: ns.to_string(), source, target })
            .await;
    }

    pub async fn missing_index(&self, ns: &str, index: Document, missing_from: Location) {
        self.send(Report::IndexMissing { ns: ns.to_string(), index, missing_from })
            .await;
    }

    pub async fn mismatch_index(&self, ns: &str, source: Document, target: Document) {
        self.send(Report::IndexMismatch { ns: ns.to_string(), source, target })
            .await;
    }

    pub async fn missing_doc(&self, ns: &str, direction: Direction, key: &str, document: Document) {
        self.send(Report::DocMissing {
            ns: ns.to_string(),
            direction,
            key: key.to_string(),
            document,
        })
        .await;
    }

    pub async fn mismatch_doc(
        &self,
        ns: &str,
        direction: Direction,
        key: &str,
        source: Document,
        target: Document,
    ) {
        self.send(Report::DocMismatch {
            ns: ns.to_string(),
            direction,
            key: key.to_string(),
            source,
            target,
        })
        .await;
    }

    pub async fn sample_summary(&self, ns: &str, direction: Direction, summary: DocSummary) {
        self.send(Report::SampleSummary { ns: ns.to_string(), direction, summary })
            .await;
    }
}

#[cfg(test)]
pub(crate) fn test_channel(capacity: usize) -> (ReportHandle, async_channel::Receiver<Report>) {
    let (tx, rx) = async_channel::bounded(capacity);
    (ReportHandle { tx }, rx)
}

#[derive(Clone)]
struct Writer {
    meta: Client,
    db_name: String,
    run: BsonDateTime,
    report_full_doc: bool,
}

impl Writer {
    async fn write(&self, report: Report) {
        let ns = report.ns().to_string();
        let reason = report.reason();
        let plan = report.plan(self.run, self.report_full_doc);
        debug!(c = %reason, ns = %ns, "upserting report");

        let result = self
            .meta
            .database(&self.db_name)
            .collection::<Document>(plan.collection)
            .update_one(
                plan.filter,
                plan.update,
                UpdateOptions::builder().upsert(true).build(),
            )
            .await;
        if let Err(err) = result {
            // never re-raised: a lost report must not fail the run
            error!(c = %reason, ns = %ns, error = %err, "unable to upsert report");
        }
    }
}

/// Owns the report channel and its single background writer.
pub struct Reporter {
    handle: ReportHandle,
    pool: Pool,
}

impl Reporter {
    /// Construct the reporter and start its writer. When `clean`, the
    /// metadata database is dropped first.
    pub async fn new(
        meta: Client,
        db_name: impl Into<String>,
        clean: bool,
        start_time: DateTime<Utc>,
        report_full_doc: bool,
    ) -> Result<Self> {
        let db_name = db_name.into();
        if clean {
            info!(db = %db_name, "dropping metadata database before run");
            meta.database(&db_name).drop(None).await?;
        }

        let (tx, rx) = async_channel::bounded::<Report>(CHANNEL_CAPACITY);
        let writer = Writer {
            meta,
            db_name,
            run: BsonDateTime::from_chrono(start_time),
            report_full_doc,
        };

        let mut pool = Pool::new(NUM_REPORTERS, "reporter");
        pool.start(move |_idx| {
            let rx = rx.clone();
            let writer = writer.clone();
            async move {
                // recv drains queued reports after the channel closes
                while let Ok(report) = rx.recv().await {
                    writer.write(report).await;
                }
            }
        });

        Ok(Self {
            handle: ReportHandle { tx },
            pool,
        })
    }

    /// A cloneable sender for emitters.
    pub fn handle(&self) -> ReportHandle {
        self.handle.clone()
    }

    /// Close the channel and wait for the writer to drain and exit. Call
    /// only after every other handle has been dropped.
    pub async fn done(self) {
        drop(self.handle);
        self.pool.done().await;
    }
}
