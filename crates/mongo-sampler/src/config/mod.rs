//! Run configuration and validation.
//!
//! The tool is flag-driven; the CLI assembles a [`Config`] and hands it to
//! the comparer. The only file input is the optional namespace filter: a JSON
//! object mapping `db.coll` strings to extended-JSON predicates.

use std::collections::HashMap;
use std::path::PathBuf;

use bson::{Bson, Document};
use mongodb::options::ClientOptions;
use mongodb::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::{Result, SamplerError};

const APP_NAME: &str = "sampler";

/// Connection options for one cluster.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MongoOptions {
    pub uri: String,
}

impl MongoOptions {
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into() }
    }

    /// Driver options for this cluster, tagged with the tool's app name.
    pub async fn client_options(&self) -> Result<ClientOptions> {
        let mut options = ClientOptions::parse(&self.uri).await?;
        options.app_name = Some(APP_NAME.to_string());
        Ok(options)
    }
}

/// Connect a client for the given cluster.
pub async fn connect(options: &MongoOptions) -> Result<Client> {
    let client_options = options.client_options().await?;
    Ok(Client::with_options(client_options)?)
}

/// Knobs for the sampling math.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompareOptions {
    /// Cochran z-score; 2.58 is roughly a 99% confidence interval.
    pub zscore: f64,
    /// Cochran error rate.
    pub error_rate: f64,
    /// When positive, overrides the sampling math entirely.
    pub force_sample_size: u64,
}

impl Default for CompareOptions {
    fn default() -> Self {
        Self {
            zscore: 2.58,
            error_rate: 0.01,
            force_sample_size: 0,
        }
    }
}

/// Full run configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub source: MongoOptions,
    pub target: MongoOptions,
    /// Metadata cluster; the CLI defaults this to the target URI.
    pub meta: MongoOptions,
    pub compare: CompareOptions,
    /// Database the reporter writes into; also excluded from verification.
    pub meta_db_name: String,
    /// When non-empty, only these `db.coll` namespaces are considered.
    pub include_ns: Vec<String>,
    /// Path to the namespace filter file.
    pub filter: Option<PathBuf>,
    /// Log level: error, warn, info, debug, or trace.
    pub verbosity: String,
    /// Directory for the per-run log file; no file log when unset.
    pub log_dir: Option<PathBuf>,
    /// Drop the metadata database before the run.
    pub clean_meta: bool,
    /// Store full documents in doc-diff reports.
    pub report_full_doc: bool,
    /// Only report estimated counts; skip all comparisons.
    pub dry_run: bool,
}

impl Config {
    /// A config with defaults everywhere but the two required URIs.
    pub fn default_with_uris(src: impl Into<String>, tgt: impl Into<String>) -> Self {
        let target = MongoOptions::new(tgt);
        Self {
            source: MongoOptions::new(src),
            meta: target.clone(),
            target,
            compare: CompareOptions::default(),
            meta_db_name: "sampler".to_string(),
            include_ns: Vec::new(),
            filter: None,
            verbosity: "info".to_string(),
            log_dir: None,
            clean_meta: false,
            report_full_doc: false,
            dry_run: false,
        }
    }

    /// Validate the configuration. Called before any connection is made.
    pub fn validate(&self) -> Result<()> {
        if self.source.uri.is_empty() {
            return Err(SamplerError::Config("missing required parameter: --src".into()));
        }
        if self.target.uri.is_empty() {
            return Err(SamplerError::Config("missing required parameter: --tgt".into()));
        }
        if self.meta_db_name.is_empty() {
            return Err(SamplerError::Config("metadbname must not be empty".into()));
        }
        if self.compare.zscore <= 0.0 {
            return Err(SamplerError::Config("zscore must be positive".into()));
        }
        if self.compare.error_rate <= 0.0 || self.compare.error_rate >= 1.0 {
            return Err(SamplerError::Config(
                "errRate must be between 0 and 1 exclusive".into(),
            ));
        }
        Ok(())
    }

    /// Load the namespace filter file, if configured.
    ///
    /// The file is a JSON object whose keys are `db.coll` strings and whose
    /// values are extended-JSON predicates, e.g.
    /// `{ "test.test": { "ts": { "$gt": { "$date": ... } } } }`.
    pub fn load_filters(&self) -> Result<HashMap<String, Document>> {
        let mut filters = HashMap::new();
        let Some(path) = &self.filter else {
            return Ok(filters);
        };

        let raw = std::fs::read_to_string(path)?;
        trace!(path = %path.display(), "opened and read filter file");
        let parsed: serde_json::Map<String, serde_json::Value> = serde_json::from_str(&raw)?;

        for (namespace, value) in parsed {
            let predicate = Bson::try_from(value).map_err(|err| {
                SamplerError::Config(format!(
                    "filter for {} is not valid extended JSON: {}",
                    namespace, err
                ))
            })?;
            let Bson::Document(predicate) = predicate else {
                return Err(SamplerError::Config(format!(
                    "filter for {} must be a document",
                    namespace
                )));
            };
            filters.insert(namespace, predicate);
        }
        debug!(count = filters.len(), "using namespace filters");
        Ok(filters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = Config::default_with_uris("mongodb://src", "mongodb://tgt");
        assert_eq!(config.meta.uri, "mongodb://tgt");
        assert_eq!(config.meta_db_name, "sampler");
        assert_eq!(config.compare.zscore, 2.58);
        assert_eq!(config.compare.error_rate, 0.01);
        assert_eq!(config.compare.force_sample_size, 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_requires_uris() {
        let mut config = Config::default_with_uris("", "mongodb://tgt");
        assert!(config.validate().is_err());
        config.source.uri = "mongodb://src".to_string();
        config.target.uri = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_sampling_knobs() {
        let mut config = Config::default_with_uris("mongodb://src", "mongodb://tgt");
        config.compare.error_rate = 1.5;
        assert!(config.validate().is_err());
        config.compare.error_rate = 0.01;
        config.compare.zscore = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_filters_parses_extended_json() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "test.test": {{ "ts": {{ "$gt": {{ "$date": "2024-01-01T00:00:00Z" }} }} }} }}"#
        )
        .unwrap();
        file.flush().unwrap();

        let mut config = Config::default_with_uris("mongodb://src", "mongodb://tgt");
        config.filter = Some(file.path().to_path_buf());
        let filters = config.load_filters().unwrap();
        assert_eq!(filters.len(), 1);
        let predicate = &filters["test.test"];
        let ts = predicate.get_document("ts").unwrap();
        assert!(matches!(ts.get("$gt"), Some(Bson::DateTime(_))));
    }

    #[test]
    fn test_load_filters_rejects_non_document_predicate() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{ "test.test": 42 }}"#).unwrap();
        file.flush().unwrap();

        let mut config = Config::default_with_uris("mongodb://src", "mongodb://tgt");
        config.filter = Some(file.path().to_path_buf());
        assert!(config.load_filters().is_err());
    }

    #[test]
    fn test_load_filters_missing_file_is_an_error() {
        let mut config = Config::default_with_uris("mongodb://src", "mongodb://tgt");
        config.filter = Some(PathBuf::from("/nonexistent/filters.json"));
        assert!(config.load_filters().is_err());
    }

    #[test]
    fn test_no_filter_file_means_no_filters() {
        let config = Config::default_with_uris("mongodb://src", "mongodb://tgt");
        assert!(config.load_filters().unwrap().is_empty());
    }
}
