//! # mongo-sampler
//!
//! Statistical equivalence verification between two MongoDB deployments.
//!
//! After a migration or replication, proving that a multi-terabyte source and
//! target hold the same user data is prohibitively expensive. This library
//! instead combines cheap catalog checks with a bounded random sample:
//!
//! - **Namespace comparison** via a generic sorted-merge diff walker
//! - **Index comparison** over raw index specifications
//! - **Estimated document counts** (advisory; metadata counts can drift)
//! - **Random document sampling** sized by Cochran's formula, with unordered
//!   field-wise comparison in both directions
//! - **Durable findings** upserted into a metadata database by a background
//!   reporter
//!
//! ## Example
//!
//! ```rust,no_run
//! use mongo_sampler::{Comparer, Config};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> mongo_sampler::Result<()> {
//!     let config = Config::default_with_uris("mongodb://src", "mongodb://tgt");
//!     let source = mongo_sampler::connect(&config.source).await?;
//!     let target = mongo_sampler::connect(&config.target).await?;
//!     let meta = mongo_sampler::connect(&config.meta).await?;
//!     let start = chrono::Utc::now();
//!     let comparer = Comparer::new(config, source, target, meta, start).await?;
//!     comparer.compare(CancellationToken::new()).await
//! }
//! ```

pub mod comparer;
pub mod config;
pub mod diff;
pub mod doc;
pub mod error;
pub mod ns;
pub mod reporter;
pub mod util;
pub mod worker;

// Re-exports for convenient access
pub use comparer::Comparer;
pub use config::{connect, CompareOptions, Config, MongoOptions};
pub use diff::{diff, DiffResult, NamedComparable};
pub use error::{Result, SamplerError};
pub use ns::Namespace;
pub use reporter::{Direction, DocSummary, Location, Reason, Report, Reporter};
