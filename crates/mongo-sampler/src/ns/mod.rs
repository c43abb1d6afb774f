//! Namespace enumeration and partition-info lookup.
//!
//! Lists user collections with `listCollections` rather than the internal
//! `$listCatalog`, so old server versions keep working. This means listing
//! does not run with read concern majority.

use std::fmt;

use bson::{doc, Bson, Document, Regex};
use futures::TryStreamExt;
use mongodb::error::ErrorKind;
use mongodb::results::{CollectionSpecification, CollectionType};
use mongodb::Client;
use tracing::{debug, error, trace};

use crate::error::{Result, SamplerError};

/// System databases never considered user data. The two `mongosync` entries
/// are bookkeeping databases left behind by the migration tool itself.
pub const EXCLUDED_SYSTEM_DBS: [&str; 5] = [
    "admin",
    "config",
    "local",
    "mongosync_monitor",
    "mongosync_reserved_for_internal_use",
];

/// Collections whose name matches this prefix are server-internal.
const EXCLUDED_SYSTEM_COLL_PATTERN: &str = "^system\\.";

/// The catalog fields that participate in namespace equality.
#[derive(Debug, Clone)]
pub struct CollectionSpec {
    pub name: String,
    pub coll_type: String,
    pub read_only: bool,
    pub id_index_name: Option<String>,
    /// Collection options as listed by the catalog.
    pub options: Document,
    /// Encoded form of `options`, compared byte-for-byte.
    raw_options: Vec<u8>,
}

impl CollectionSpec {
    fn from_listing(spec: CollectionSpecification) -> Result<Self> {
        let options = bson::to_document(&spec.options)?;
        let raw_options = bson::to_vec(&options)?;
        let coll_type = match spec.collection_type {
            CollectionType::View => "view",
            CollectionType::Timeseries => "timeseries",
            _ => "collection",
        };
        let id_index_name = spec
            .id_index
            .as_ref()
            .and_then(|model| model.get_str("name").ok())
            .map(|name| name.to_string());
        Ok(Self {
            name: spec.name,
            coll_type: coll_type.to_string(),
            read_only: spec.info.read_only,
            id_index_name,
            options,
            raw_options,
        })
    }

    /// Equality over the listed specification fields; options are compared
    /// on their encoded bytes.
    pub fn matches(&self, other: &Self) -> bool {
        self.name == other.name
            && self.coll_type == other.coll_type
            && self.read_only == other.read_only
            && self.id_index_name == other.id_index_name
            && self.raw_options == other.raw_options
    }

    #[cfg(test)]
    pub(crate) fn for_tests(name: &str, options: Document) -> Self {
        let raw_options = bson::to_vec(&options).expect("encodable test options");
        Self {
            name: name.to_string(),
            coll_type: "collection".to_string(),
            read_only: false,
            id_index_name: Some("_id_".to_string()),
            options,
            raw_options,
        }
    }

    /// Render the fields that participate in equality, for reports.
    pub fn to_document(&self) -> Document {
        doc! {
            "name": &self.name,
            "type": &self.coll_type,
            "readOnly": self.read_only,
            "idIndex": self.id_index_name.as_deref().unwrap_or(""),
            "options": &self.options,
        }
    }
}

/// A qualified user namespace with its catalog specification. Immutable once
/// built by the resolver.
#[derive(Debug, Clone)]
pub struct Namespace {
    pub db: String,
    pub collection: String,
    pub spec: CollectionSpec,
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.collection)
    }
}

/// Fetch a single user namespace.
pub async fn one_user_namespace(client: &Client, db_name: &str, coll_name: &str) -> Result<Namespace> {
    let db = client.database(db_name);
    let mut cursor = db.list_collections(doc! { "name": coll_name }, None).await?;
    match cursor.try_next().await? {
        Some(spec) => Ok(Namespace {
            db: db_name.to_string(),
            collection: spec.name.clone(),
            spec: CollectionSpec::from_listing(spec)?,
        }),
        None => Err(SamplerError::namespace(
            format!("{}.{}", db_name, coll_name),
            "collection not found",
        )),
    }
}

/// List every user namespace on a cluster, honouring the exclusion policy:
/// system databases, any bookkeeping databases the caller names, collections
/// named `system.*`, and views unless requested.
pub async fn all_user_namespaces(
    client: &Client,
    include_views: bool,
    extra_excluded_dbs: &[String],
) -> Result<Vec<Namespace>> {
    let mut excluded: Vec<Bson> = EXCLUDED_SYSTEM_DBS.iter().map(|&db| db.into()).collect();
    excluded.extend(extra_excluded_dbs.iter().map(|db| Bson::from(db.as_str())));

    let db_names = client
        .list_database_names(doc! { "name": { "$nin": excluded } }, None)
        .await?;
    debug!(databases = ?db_names, "user databases");

    let mut filter = doc! {
        "name": { "$nin": [Bson::RegularExpression(Regex {
            pattern: EXCLUDED_SYSTEM_COLL_PATTERN.to_string(),
            options: String::new(),
        })] },
    };
    if !include_views {
        filter.insert("type", doc! { "$ne": "view" });
    }

    let mut namespaces = Vec::new();
    for db_name in db_names {
        let db = client.database(&db_name);
        let mut cursor = db.list_collections(filter.clone(), None).await?;
        while let Some(spec) = cursor.try_next().await? {
            trace!(ns = %format!("{}.{}", db_name, spec.name), "found collection specification");
            namespaces.push(Namespace {
                db: db_name.clone(),
                collection: spec.name.clone(),
                spec: CollectionSpec::from_listing(spec)?,
            });
        }
    }
    Ok(namespaces)
}

/// Query whether a collection is partitioned and with which key.
///
/// Routing metadata only exists behind a router; on plain replica sets this
/// reports unpartitioned.
pub async fn partition_info(
    client: &Client,
    db: &str,
    coll: &str,
) -> Result<(bool, Option<Document>)> {
    if !is_router(client).await {
        return Ok((false, None));
    }
    let filter = doc! { "_id": format!("{}.{}", db, coll) };
    let entry = client
        .database("config")
        .collection::<Document>("collections")
        .find_one(filter, None)
        .await?;
    match entry {
        Some(entry) => {
            let key = entry.get_document("key").ok().cloned();
            Ok((key.is_some(), key))
        }
        None => Ok((false, None)),
    }
}

/// Probe for `isdbgrid`; only routers answer it successfully.
pub async fn is_router(client: &Client) -> bool {
    match client
        .database("admin")
        .run_command(doc! { "isdbgrid": 1 }, None)
        .await
    {
        Ok(_) => true,
        Err(err) => {
            match err.kind.as_ref() {
                // CommandNotFound: a mongod, not a router
                ErrorKind::Command(cmd) if cmd.code == 59 => {}
                _ => error!(error = %err, "isdbgrid probe failed"),
            }
            false
        }
    }
}
