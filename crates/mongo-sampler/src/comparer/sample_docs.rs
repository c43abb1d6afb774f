//! Random-sample document comparison.
//!
//! For each namespace pair: compute a sample size from the estimated counts,
//! open `$sample` cursors on both sides, stream id-keyed batches to a worker
//! pool, look each batch up on the opposite side (routing through the
//! partition key where one exists), and compare the documents field-wise.
//! Per-batch summaries and per-document findings flow to the reporter;
//! per-namespace totals feed the final result line.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bson::{doc, Bson, Document};
use futures::TryStreamExt;
use mongodb::options::AggregateOptions;
use mongodb::{Collection, Cursor};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::{Ctx, NamespacePair, BATCH_SIZE, NUM_WORKERS};
use crate::doc as document;
use crate::error::{Result, SamplerError};
use crate::reporter::{Direction, DocSummary};
use crate::util;
use crate::worker::Pool;

/// Backoff between attempts to open a flaky `$sample` cursor.
const RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// Capacity of the batch job channel.
const JOB_CHANNEL_CAPACITY: usize = 100;

/// Sample no more than this fraction of the collection once it is large
/// enough for the ceiling to matter.
const SAMPLE_CEILING_FRACTION: f64 = 0.04;

/// A batch of sampled documents, keyed by the canonical string form of each
/// document's `_id`.
#[derive(Debug)]
struct DocumentBatch {
    direction: Direction,
    docs: HashMap<String, Document>,
}

/// Canonical extended-JSON rendering of a document's `_id`, if it has one.
fn doc_key(doc: &Document) -> Option<String> {
    doc.get("_id")
        .map(|id| id.clone().into_canonical_extjson().to_string())
}

/// Insert a sampled document under its id key. Documents without an `_id`
/// cannot be looked up on the other side; they are skipped, not counted
/// missing.
fn insert_doc(docs: &mut HashMap<String, Document>, doc: Document) {
    match doc_key(&doc) {
        Some(key) => {
            docs.insert(key, doc);
        }
        None => trace!("skipping sampled document without _id"),
    }
}

/// The query that fetches one batch's documents from the opposite side.
///
/// When that side is partitioned, each predicate carries the document's
/// partition-key values so the lookup routes to the owning partition.
/// A configured namespace filter constrains the lookup symmetrically with
/// the sample pipelines.
fn build_lookup_query(
    docs: &HashMap<String, Document>,
    partition_key: Option<&Document>,
    predicate: Option<&Document>,
) -> Document {
    let mut query = match partition_key {
        Some(key) => {
            let mut clauses = Vec::with_capacity(docs.len());
            for doc in docs.values() {
                let mut clause = Document::new();
                for field in key.keys() {
                    clause.insert(field.clone(), doc.get(field).cloned().unwrap_or(Bson::Null));
                }
                clause.insert("_id", doc.get("_id").cloned().unwrap_or(Bson::Null));
                clauses.push(Bson::Document(clause));
            }
            doc! { "$or": clauses }
        }
        None => {
            let ids: Vec<Bson> = docs.values().filter_map(|d| d.get("_id").cloned()).collect();
            doc! { "_id": { "$in": ids } }
        }
    };
    if let Some(predicate) = predicate {
        query = doc! { "$and": [query, predicate.clone()] };
    }
    query
}

/// Cochran's size over the population, capped by the 4% ceiling once that
/// exceeds 100 documents.
fn bounded_sample_size(population: u64, zscore: f64, error_rate: f64) -> u64 {
    let size = util::sample_size(population, zscore, error_rate);
    let ceiling = (population as f64 * SAMPLE_CEILING_FRACTION).round() as u64;
    if ceiling > 100 && size > ceiling {
        warn!(size, ceiling, "sample size too large, using ceiling");
        return ceiling;
    }
    size
}

/// Per-namespace totals. Only this namespace's own workers mutate them; the
/// critical section is a handful of integer additions.
#[derive(Debug, Default)]
struct TotalCounters {
    sampled_src: i64,
    sampled_tgt: i64,
    missing_src: i64,
    missing_tgt: i64,
    mismatch_src_to_tgt: i64,
    mismatch_tgt_to_src: i64,
}

#[derive(Debug, Default)]
struct Totals {
    counters: Mutex<TotalCounters>,
}

impl Totals {
    fn lock(&self) -> std::sync::MutexGuard<'_, TotalCounters> {
        match self.counters.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn apply(&self, direction: Direction, summary: DocSummary) {
        let mut counters = self.lock();
        match direction {
            Direction::SrcToTgt => {
                counters.mismatch_src_to_tgt += summary.different;
                counters.missing_tgt += summary.missing;
                counters.sampled_src += summary.total();
            }
            Direction::TgtToSrc => {
                counters.mismatch_tgt_to_src += summary.different;
                counters.missing_src += summary.missing;
                counters.sampled_tgt += summary.total();
            }
        }
    }

    fn log_result(&self) {
        let counters = self.lock();
        let failed = counters.mismatch_src_to_tgt > 0
            || counters.mismatch_tgt_to_src > 0
            || counters.missing_src > 0
            || counters.missing_tgt > 0;
        let line = format!(
            "sampling result - {} missing on source | {} missing on target | {} out of {} \
             sampled source documents mismatched | {} out of {} sampled target documents \
             mismatched",
            counters.missing_src,
            counters.missing_tgt,
            counters.mismatch_src_to_tgt,
            counters.sampled_src,
            counters.mismatch_tgt_to_src,
            counters.sampled_tgt,
        );
        if failed {
            error!("{} - failure", line);
        } else {
            info!("{} - success", line);
        }
    }
}

fn record_failure(slot: &Mutex<Option<SamplerError>>, err: SamplerError) {
    let mut slot = match slot.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    if slot.is_none() {
        *slot = Some(err);
    }
}

fn has_failure(slot: &Mutex<Option<SamplerError>>) -> bool {
    match slot.lock() {
        Ok(guard) => guard.is_some(),
        Err(poisoned) => poisoned.into_inner().is_some(),
    }
}

fn take_failure(slot: &Mutex<Option<SamplerError>>) -> Option<SamplerError> {
    match slot.lock() {
        Ok(mut guard) => guard.take(),
        Err(poisoned) => poisoned.into_inner().take(),
    }
}

impl Ctx {
    /// Sample documents from both sides and compare them in both directions.
    pub(crate) async fn compare_sample_docs(
        &self,
        cancel: &CancellationToken,
        pair: &NamespacePair,
    ) -> Result<()> {
        let sample_size = self.sample_size(pair).await?;
        if sample_size == 0 {
            info!("nothing to sample");
            return Ok(());
        }
        info!(sample_size, "using sample size");

        let (source_cursor, target_cursor) = self.sample_cursors(cancel, pair, sample_size).await?;

        let totals = Arc::new(Totals::default());
        let failure = Arc::new(Mutex::new(None::<SamplerError>));
        let (jobs_tx, jobs_rx) = async_channel::bounded::<DocumentBatch>(JOB_CHANNEL_CAPACITY);

        let mut pool = Pool::new(NUM_WORKERS, "sampleDocWorkers");
        pool.start(|_idx| {
            let ctx = self.clone();
            let pair = pair.clone();
            let rx = jobs_rx.clone();
            let cancel = cancel.clone();
            let totals = totals.clone();
            let failure = failure.clone();
            async move {
                while let Ok(batch) = rx.recv().await {
                    // after a failure the namespace is lost; keep draining so
                    // the streamer never blocks on a full channel
                    if cancel.is_cancelled() || has_failure(&failure) {
                        continue;
                    }
                    if let Err(err) = ctx.process_batch(&pair, batch, &totals).await {
                        error!(error = %err, "batch processing failed");
                        record_failure(&failure, err);
                    }
                }
            }
        });
        drop(jobs_rx);

        info!("beginning document sample");
        let mut stream_result =
            stream_batches(cancel, source_cursor, Direction::SrcToTgt, &jobs_tx).await;
        if stream_result.is_ok() {
            stream_result =
                stream_batches(cancel, target_cursor, Direction::TgtToSrc, &jobs_tx).await;
        }
        drop(jobs_tx);
        pool.done().await;
        info!("finished document sample");

        stream_result?;
        if let Some(err) = take_failure(&failure) {
            return Err(err);
        }
        totals.log_result();
        Ok(())
    }

    /// Sample size for this pair: the forced override when configured,
    /// otherwise Cochran over the larger estimated count, capped by the 4%
    /// ceiling once that exceeds 100.
    async fn sample_size(&self, pair: &NamespacePair) -> Result<u64> {
        let force = self.config.compare.force_sample_size;
        if force > 0 {
            return Ok(force);
        }
        let (source, target) = self.estimates(pair).await?;
        // estimated counts need not agree; sample from the larger side
        let population = source.max(target);
        Ok(bounded_sample_size(
            population,
            self.config.compare.zscore,
            self.config.compare.error_rate,
        ))
    }

    async fn sample_cursors(
        &self,
        cancel: &CancellationToken,
        pair: &NamespacePair,
        sample_size: u64,
    ) -> Result<(Cursor<Document>, Cursor<Document>)> {
        let mut pipeline = Vec::new();
        if let Some(predicate) = self.filter_for(&pair.name()) {
            pipeline.push(doc! { "$match": predicate.clone() });
        }
        pipeline.push(doc! { "$sample": { "size": sample_size as i64 } });
        pipeline.push(doc! { "$sort": { "_id": 1 } });
        let options = AggregateOptions::builder()
            .allow_disk_use(true)
            .batch_size(BATCH_SIZE as u32)
            .build();
        debug!(pipeline = ?pipeline, "aggregating");

        let source = self
            .open_sample_cursor(
                cancel,
                self.source_collection(&pair.db, &pair.collection),
                &pipeline,
                &options,
                "source",
            )
            .await?;
        let target = self
            .open_sample_cursor(
                cancel,
                self.target_collection(&pair.db, &pair.collection),
                &pipeline,
                &options,
                "target",
            )
            .await?;
        Ok((source, target))
    }

    /// `$sample` is known to fail transiently under metadata churn; opening
    /// the cursor retries until cancellation.
    async fn open_sample_cursor(
        &self,
        cancel: &CancellationToken,
        collection: Collection<Document>,
        pipeline: &[Document],
        options: &AggregateOptions,
        side: &str,
    ) -> Result<Cursor<Document>> {
        loop {
            match collection.aggregate(pipeline.to_vec(), options.clone()).await {
                Ok(cursor) => return Ok(cursor),
                Err(err) => {
                    debug!(side, error = %err, "error opening sample cursor, retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(SamplerError::Cancelled),
                        _ = tokio::time::sleep(RETRY_INTERVAL) => {}
                    }
                }
            }
        }
    }

    async fn process_batch(
        &self,
        pair: &NamespacePair,
        batch: DocumentBatch,
        totals: &Totals,
    ) -> Result<()> {
        let direction = batch.direction;
        let found = self.batch_find(pair, &batch).await?;
        let summary = self.batch_compare(pair, &batch, &found).await;
        if summary.has_mismatches() {
            self.reports
                .sample_summary(&pair.name(), direction, summary)
                .await;
        }
        totals.apply(direction, summary);
        Ok(())
    }

    /// Look a batch up on the opposite side, keyed back by `_id`.
    async fn batch_find(
        &self,
        pair: &NamespacePair,
        batch: &DocumentBatch,
    ) -> Result<HashMap<String, Document>> {
        let (collection, partition_key) = match batch.direction {
            Direction::SrcToTgt => (
                self.target_collection(&pair.db, &pair.collection),
                pair.partitioned
                    .target
                    .then_some(pair.partition_key.target.as_ref())
                    .flatten(),
            ),
            Direction::TgtToSrc => (
                self.source_collection(&pair.db, &pair.collection),
                pair.partitioned
                    .source
                    .then_some(pair.partition_key.source.as_ref())
                    .flatten(),
            ),
        };
        let query = build_lookup_query(&batch.docs, partition_key, self.filter_for(&pair.name()));
        debug!(query = ?query, "sending find");

        let mut cursor = collection.find(query, None).await?;
        let mut found = HashMap::with_capacity(batch.docs.len());
        while let Some(doc) = cursor.try_next().await? {
            insert_doc(&mut found, doc);
        }
        trace!(found = found.len(), "lookup returned");
        Ok(found)
    }

    /// Compare a sampled batch against its lookup. Walks the larger of the
    /// two mappings so ids the lookup failed to return are still classified.
    async fn batch_compare(
        &self,
        pair: &NamespacePair,
        sampled: &DocumentBatch,
        found: &HashMap<String, Document>,
    ) -> DocSummary {
        let ns_name = pair.name();
        let direction = sampled.direction;
        let outer_is_sampled = sampled.docs.len() >= found.len();
        let (outer, inner) = if outer_is_sampled {
            (&sampled.docs, found)
        } else {
            (found, &sampled.docs)
        };

        let mut summary = DocSummary::default();
        for (key, outer_doc) in outer {
            trace!(key = %key, "comparing");
            match inner.get(key) {
                Some(inner_doc) => {
                    // orient source/target by the batch direction, not by
                    // which mapping ended up outer
                    let (origin, other) = if outer_is_sampled {
                        (outer_doc, inner_doc)
                    } else {
                        (inner_doc, outer_doc)
                    };
                    let (src_doc, tgt_doc) = match direction {
                        Direction::SrcToTgt => (origin, other),
                        Direction::TgtToSrc => (other, origin),
                    };
                    match document::compare(src_doc, tgt_doc) {
                        None => summary.equal += 1,
                        Some(details) => {
                            if !details.missing_on_tgt.is_empty() {
                                debug!(key = %key, "missing fields on the target");
                            }
                            if !details.missing_on_src.is_empty() {
                                debug!(key = %key, "missing fields on the source");
                            }
                            if !details.different.is_empty() {
                                debug!(key = %key, "field values differ");
                            }
                            self.reports
                                .mismatch_doc(&ns_name, direction, key, src_doc.clone(), tgt_doc.clone())
                                .await;
                            summary.different += 1;
                        }
                    }
                }
                None => {
                    debug!(key = %key, missing_from = %direction.missing_from(), "document not found");
                    self.reports
                        .missing_doc(&ns_name, direction, key, outer_doc.clone())
                        .await;
                    summary.missing += 1;
                }
            }
        }
        summary
    }
}

/// Drain a sample cursor into id-keyed batches on the job channel, flushing
/// the partial tail when the cursor closes. Iteration errors are fatal to
/// the namespace.
async fn stream_batches(
    cancel: &CancellationToken,
    mut cursor: Cursor<Document>,
    direction: Direction,
    jobs: &async_channel::Sender<DocumentBatch>,
) -> Result<()> {
    let mut buffer: HashMap<String, Document> = HashMap::with_capacity(BATCH_SIZE);
    let mut doc_count = 0usize;
    let mut batch_count = 0usize;
    debug!(dir = %direction, "starting cursor walk");

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return Err(SamplerError::Cancelled),
            next = cursor.try_next() => next?,
        };
        let Some(doc) = next else {
            break;
        };
        insert_doc(&mut buffer, doc);
        doc_count += 1;

        if doc_count % BATCH_SIZE == 0 {
            batch_count += 1;
            trace!(dir = %direction, batch = batch_count, "queueing batch");
            let batch = DocumentBatch {
                direction,
                docs: std::mem::replace(&mut buffer, HashMap::with_capacity(BATCH_SIZE)),
            };
            if jobs.send(batch).await.is_err() {
                break;
            }
        }
    }

    if !buffer.is_empty() {
        batch_count += 1;
        trace!(dir = %direction, batch = batch_count, "queueing tail batch");
        let _ = jobs
            .send(DocumentBatch {
                direction,
                docs: buffer,
            })
            .await;
    }
    debug!(dir = %direction, batches = batch_count, docs = doc_count, "cursor drained");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::ns::CollectionSpec;
    use crate::reporter::{test_channel, Report};
    use crate::util::Pair;
    use mongodb::options::ClientOptions;
    use mongodb::Client;

    fn sample_pair(partition_key: Option<Document>) -> NamespacePair {
        let options = doc! {};
        NamespacePair {
            db: "app".to_string(),
            collection: "users".to_string(),
            partitioned: Pair::new(false, partition_key.is_some()),
            partition_key: Pair::new(None, partition_key),
            spec: CollectionSpec::for_tests("users", options),
        }
    }

    async fn test_ctx() -> (Ctx, async_channel::Receiver<Report>) {
        let options = ClientOptions::parse("mongodb://localhost:27017")
            .await
            .unwrap();
        let client = Client::with_options(options).unwrap();
        let (reports, rx) = test_channel(256);
        let ctx = Ctx {
            config: std::sync::Arc::new(Config::default_with_uris(
                "mongodb://src",
                "mongodb://tgt",
            )),
            source: client.clone(),
            target: client,
            reports,
            filters: std::sync::Arc::new(HashMap::new()),
        };
        (ctx, rx)
    }

    fn keyed(docs: Vec<Document>) -> HashMap<String, Document> {
        let mut map = HashMap::new();
        for doc in docs {
            insert_doc(&mut map, doc);
        }
        map
    }

    #[test]
    fn test_doc_key_is_canonical_and_type_sensitive() {
        let string_id = doc! { "_id": "u42" };
        let int32_id = doc! { "_id": 42_i32 };
        let int64_id = doc! { "_id": 42_i64 };
        assert_eq!(doc_key(&string_id).unwrap(), "\"u42\"");
        // canonical form distinguishes numeric types
        assert_ne!(doc_key(&int32_id), doc_key(&int64_id));
    }

    #[test]
    fn test_documents_without_id_are_skipped() {
        let mut docs = HashMap::new();
        insert_doc(&mut docs, doc! { "v": 1 });
        insert_doc(&mut docs, doc! { "_id": "u1", "v": 2 });
        assert_eq!(docs.len(), 1);
    }

    #[test]
    fn test_lookup_query_uses_in_when_unpartitioned() {
        let docs = keyed(vec![doc! { "_id": "u1" }, doc! { "_id": "u2" }]);
        let query = build_lookup_query(&docs, None, None);
        let ids = query.get_document("_id").unwrap().get_array("$in").unwrap();
        assert_eq!(ids.len(), 2);
    }

    #[test]
    fn test_lookup_query_routes_through_partition_key() {
        let docs = keyed(vec![
            doc! { "_id": "u1", "tenant": "acme", "email": "a@x" },
            doc! { "_id": "u2", "tenant": "globex", "email": "b@x" },
        ]);
        let key = doc! { "tenant": 1, "_id": 1 };
        let query = build_lookup_query(&docs, Some(&key), None);
        let clauses = query.get_array("$or").unwrap();
        assert_eq!(clauses.len(), 2);
        for clause in clauses {
            let clause = clause.as_document().unwrap();
            assert!(clause.contains_key("tenant"));
            assert!(clause.contains_key("_id"));
            // only routing fields, never the rest of the document
            assert!(!clause.contains_key("email"));
        }
    }

    #[test]
    fn test_lookup_query_ands_in_the_namespace_filter() {
        let docs = keyed(vec![doc! { "_id": "u1" }]);
        let predicate = doc! { "tombstone": { "$exists": false } };
        let query = build_lookup_query(&docs, None, Some(&predicate));
        let clauses = query.get_array("$and").unwrap();
        assert_eq!(clauses.len(), 2);
        assert_eq!(clauses[1].as_document().unwrap(), &predicate);
    }

    #[tokio::test]
    async fn test_batch_compare_classifies_every_outer_key() {
        let (ctx, reports) = test_ctx().await;
        let pair = sample_pair(None);
        let sampled = DocumentBatch {
            direction: Direction::SrcToTgt,
            docs: keyed(vec![
                doc! { "_id": "u1", "email": "a@x" },
                doc! { "_id": "u2", "email": "b@x" },
                doc! { "_id": "u3", "email": "c@x" },
            ]),
        };
        let found = keyed(vec![
            doc! { "_id": "u1", "email": "a@x" },
            doc! { "_id": "u2", "email": "changed@x" },
        ]);

        let summary = ctx.batch_compare(&pair, &sampled, &found).await;
        assert_eq!(summary.equal, 1);
        assert_eq!(summary.different, 1);
        assert_eq!(summary.missing, 1);
        assert_eq!(summary.total(), sampled.docs.len() as i64);

        let mut mismatches = 0;
        let mut missings = 0;
        while let Ok(report) = reports.try_recv() {
            match report {
                Report::DocMismatch { ns, direction, source, target, .. } => {
                    assert_eq!(ns, "app.users");
                    assert_eq!(direction, Direction::SrcToTgt);
                    assert_eq!(source.get_str("email").unwrap(), "b@x");
                    assert_eq!(target.get_str("email").unwrap(), "changed@x");
                    mismatches += 1;
                }
                Report::DocMissing { direction, key, .. } => {
                    assert_eq!(direction, Direction::SrcToTgt);
                    assert_eq!(key, "\"u3\"");
                    missings += 1;
                }
                other => panic!("unexpected report {:?}", other),
            }
        }
        assert_eq!(mismatches, 1);
        assert_eq!(missings, 1);
    }

    #[tokio::test]
    async fn test_batch_compare_walks_the_larger_side() {
        let (ctx, reports) = test_ctx().await;
        let pair = sample_pair(None);
        // lookup returned more documents than were sampled; the surplus id
        // must still be classified
        let sampled = DocumentBatch {
            direction: Direction::TgtToSrc,
            docs: keyed(vec![doc! { "_id": "u1", "v": 1 }]),
        };
        let found = keyed(vec![
            doc! { "_id": "u1", "v": 1 },
            doc! { "_id": "u2", "v": 2 },
        ]);

        let summary = ctx.batch_compare(&pair, &sampled, &found).await;
        assert_eq!(summary.equal, 1);
        assert_eq!(summary.missing, 1);
        assert_eq!(summary.total(), found.len() as i64);

        let report = reports.try_recv().unwrap();
        match report {
            Report::DocMissing { direction, key, .. } => {
                assert_eq!(direction, Direction::TgtToSrc);
                assert_eq!(key, "\"u2\"");
            }
            other => panic!("unexpected report {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_batch_compare_orients_documents_by_direction() {
        let (ctx, reports) = test_ctx().await;
        let pair = sample_pair(None);
        // a TgtToSrc batch was sampled on the target; the lookup result is
        // the source document
        let sampled = DocumentBatch {
            direction: Direction::TgtToSrc,
            docs: keyed(vec![doc! { "_id": "u1", "email": "tgt@x" }]),
        };
        let found = keyed(vec![doc! { "_id": "u1", "email": "src@x" }]);

        let summary = ctx.batch_compare(&pair, &sampled, &found).await;
        assert_eq!(summary.different, 1);
        match reports.try_recv().unwrap() {
            Report::DocMismatch { source, target, .. } => {
                assert_eq!(source.get_str("email").unwrap(), "src@x");
                assert_eq!(target.get_str("email").unwrap(), "tgt@x");
            }
            other => panic!("unexpected report {:?}", other),
        }
    }

    #[test]
    fn test_sample_size_ceiling_applies_to_large_collections() {
        // Cochran wants 6247 of 10k docs; the 4% ceiling caps that at 400
        assert_eq!(bounded_sample_size(10_000, 2.58, 0.01), 400);
        // at 1M docs Cochran's 16369 is under the 40k ceiling
        assert_eq!(bounded_sample_size(1_000_000, 2.58, 0.01), 16_369);
        // a ceiling of 4 is below the 100-doc threshold and never applies
        assert_eq!(bounded_sample_size(100, 2.58, 0.01), 99);
    }

    #[test]
    fn test_totals_split_along_the_direction_axis() {
        let totals = Totals::default();
        totals.apply(
            Direction::SrcToTgt,
            DocSummary { equal: 98, different: 1, missing: 1 },
        );
        totals.apply(
            Direction::TgtToSrc,
            DocSummary { equal: 100, different: 0, missing: 0 },
        );
        let counters = totals.lock();
        assert_eq!(counters.sampled_src, 100);
        assert_eq!(counters.sampled_tgt, 100);
        assert_eq!(counters.mismatch_src_to_tgt, 1);
        assert_eq!(counters.missing_tgt, 1);
        assert_eq!(counters.mismatch_tgt_to_src, 0);
        assert_eq!(counters.missing_src, 0);
    }
}
