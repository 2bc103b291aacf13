//! Request orchestration.
//!
//! One call to [`Pipeline::process`] walks a document through
//!
//! ```text
//! Received → Extracting → {Classifying ∥ DuplicateChecking} → Merging → Completed
//!                  ↘ Failed                ↘ Failed
//! ```
//!
//! under a single request timeout. Classification and the duplicate lookup
//! are joined, so both finish (or both are dropped) before merging starts.
//!
//! The conditional insert into the duplicate index runs on its own spawned
//! task. If the request times out while the insert is in flight the task
//! still runs to completion, so the index never holds a half-written record;
//! the timed-out client simply doesn't learn the outcome.
//!
//! The duplicate key is the fingerprint plus the holder's identity number
//! when one was read, so two holders' cards from the same template are not
//! mistaken for each other.
//!
//! An unreachable index degrades the response (`is_duplicate: null`) and
//! never fails it.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use docsift_core::classifier::{Classifier, ClassifierModel, KeywordClassifier};
use docsift_core::error::{ExtractError, ProcessError};
use docsift_core::index::DuplicateIndex;
use docsift_core::models::{
    Document, DocumentType, DuplicateKey, DuplicateRecord, ExtractedFields, ProcessingResult,
};

use crate::config::{ClassifierConfig, Config};
use crate::extract::FeatureExtractor;
use crate::ocr::create_recognizer;
use crate::sqlite_index::SqliteIndex;
use crate::{db, migrate};

/// The three collaborators of the pipeline, constructed once and shared.
#[derive(Clone)]
pub struct Services {
    pub extractor: Arc<FeatureExtractor>,
    pub classifier: Arc<dyn Classifier>,
    pub index: Arc<dyn DuplicateIndex>,
}

impl Services {
    /// Production wiring: SQLite index, configured recognizer, and the
    /// classifier model from `[classifier]`.
    ///
    /// A classifier model that fails to load does not abort start-up; the
    /// service runs and answers `classification_unavailable` until fixed.
    /// An unusable recognizer or database does abort.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::apply(&pool)
            .await
            .context("Failed to apply migrations")?;
        let index = SqliteIndex::open(pool, config.index.similarity_threshold).await?;

        let recognizer = create_recognizer(&config.extraction).await?;
        let extractor = FeatureExtractor::new(&config.extraction, recognizer);

        Ok(Self {
            extractor: Arc::new(extractor),
            classifier: Arc::new(load_classifier(&config.classifier)),
            index: Arc::new(index),
        })
    }
}

/// Load the configured model, or the built-in one when no path is set.
pub fn load_classifier(config: &ClassifierConfig) -> KeywordClassifier {
    let loaded = match &config.model_path {
        None => Ok(ClassifierModel::builtin()),
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read classifier model: {}", path.display()))
            .and_then(|json| ClassifierModel::from_json(&json)),
    }
    .and_then(|model| KeywordClassifier::new(model, config.threshold));

    match loaded {
        Ok(classifier) => {
            tracing::info!(
                model_version = classifier.model_version().unwrap_or_default(),
                threshold = config.threshold,
                "classifier model loaded"
            );
            classifier
        }
        Err(e) => {
            tracing::error!(error = %format!("{:#}", e), "classifier model failed to load");
            KeywordClassifier::unavailable(format!("{:#}", e))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Received,
    Extracting,
    ClassifyingAndDuplicateChecking,
    Merging,
    Completed,
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Received => "received",
            Stage::Extracting => "extracting",
            Stage::ClassifyingAndDuplicateChecking => "classifying+duplicate_checking",
            Stage::Merging => "merging",
            Stage::Completed => "completed",
            Stage::Failed => "failed",
        };
        f.write_str(name)
    }
}

fn enter(document_id: &str, stage: Stage) {
    tracing::debug!(document_id, stage = %stage, "pipeline stage");
}

/// Outcome of the duplicate check for one document.
#[derive(Debug)]
enum DuplicateStatus {
    /// First of its cluster; a record with this document's id now exists.
    New,
    Seen(DuplicateRecord),
    /// The index could not be consulted.
    Unknown,
}

pub struct Pipeline {
    services: Services,
    timeout: Duration,
}

impl Pipeline {
    pub fn new(services: Services, timeout: Duration) -> Self {
        Self { services, timeout }
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Classify, check for duplicates, and record a first-seen document.
    pub async fn process(&self, document: Document) -> Result<ProcessingResult, ProcessError> {
        let started = Instant::now();
        enter(&document.id, Stage::Received);

        match tokio::time::timeout(self.timeout, self.run(&document)).await {
            Ok(Ok(result)) => {
                enter(&document.id, Stage::Completed);
                tracing::info!(
                    document_id = %result.document_id,
                    document_type = %result.document_type,
                    confidence = result.confidence,
                    is_duplicate = ?result.is_duplicate,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "document processed"
                );
                Ok(result)
            }
            Ok(Err(e)) => {
                enter(&document.id, Stage::Failed);
                tracing::debug!(document_id = %document.id, error = %e, "document rejected");
                Err(e)
            }
            Err(_) => {
                enter(&document.id, Stage::Failed);
                tracing::warn!(
                    document_id = %document.id,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "processing timed out"
                );
                Err(ProcessError::Timeout(self.timeout))
            }
        }
    }

    async fn run(&self, document: &Document) -> Result<ProcessingResult, ProcessError> {
        enter(&document.id, Stage::Extracting);
        let (fingerprint, fields) = self.services.extractor.extract(&document.bytes).await?;
        tracing::debug!(
            document_id = %document.id,
            fingerprint = %fingerprint,
            regions = fields.regions.len(),
            fields = fields.values.len(),
            "features extracted"
        );

        enter(&document.id, Stage::ClassifyingAndDuplicateChecking);
        let key = DuplicateKey::from_fields(fingerprint, &fields);
        let classify = async { self.services.classifier.classify(&fingerprint, &fields) };
        let (classification, lookup) = tokio::join!(classify, self.services.index.lookup(&key));
        let classification = classification?;

        enter(&document.id, Stage::Merging);
        let status = match lookup {
            Ok(Some(record)) => DuplicateStatus::Seen(record),
            Ok(None) => self.record_first_seen(document, key).await?,
            Err(e) => {
                tracing::warn!(document_id = %document.id, error = %e, "duplicate index unavailable; answering without duplicate status");
                DuplicateStatus::Unknown
            }
        };

        Ok(merge(
            document,
            classification.document_type,
            classification.confidence,
            &fields,
            status,
        ))
    }

    async fn record_first_seen(
        &self,
        document: &Document,
        key: DuplicateKey,
    ) -> Result<DuplicateStatus, ProcessError> {
        let index = Arc::clone(&self.services.index);
        let document_id = document.id.clone();
        let insert = tokio::spawn(async move { index.insert(&key, &document_id).await });

        match insert.await {
            Ok(Ok(record)) if record.document_id == document.id => Ok(DuplicateStatus::New),
            // A concurrent request for the same cluster committed first.
            Ok(Ok(record)) => Ok(DuplicateStatus::Seen(record)),
            Ok(Err(e)) => {
                tracing::warn!(document_id = %document.id, error = %e, "duplicate insert failed; answering without duplicate status");
                Ok(DuplicateStatus::Unknown)
            }
            Err(e) => Err(ProcessError::Internal(format!("index insert task failed: {}", e))),
        }
    }

    /// Run extraction only and return `doc_type`'s schema, with `None` for
    /// every field that could not be read. No classification, no index.
    pub async fn extract_only(
        &self,
        bytes: &[u8],
        doc_type: DocumentType,
    ) -> Result<Vec<(String, Option<String>)>, ProcessError> {
        let extraction = tokio::time::timeout(self.timeout, self.services.extractor.extract(bytes))
            .await
            .map_err(|_| ProcessError::Timeout(self.timeout))?;
        let (_, fields) = extraction.map_err(|e: ExtractError| ProcessError::from(e))?;

        Ok(doc_type
            .field_schema()
            .iter()
            .map(|name| (name.to_string(), fields.get(name).map(str::to_string)))
            .collect())
    }
}

fn merge(
    document: &Document,
    document_type: DocumentType,
    confidence: f64,
    fields: &ExtractedFields,
    status: DuplicateStatus,
) -> ProcessingResult {
    let (is_duplicate, matched_document_id) = match status {
        DuplicateStatus::New => (Some(false), None),
        DuplicateStatus::Seen(record) => (Some(true), Some(record.document_id)),
        DuplicateStatus::Unknown => (None, None),
    };

    ProcessingResult {
        document_id: document.id.clone(),
        document_type,
        confidence,
        is_duplicate,
        matched_document_id,
        is_successfully_parsed: document_type != DocumentType::Unknown,
        data: fields.for_type(document_type),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsift_core::fingerprint::Fingerprint;
    use std::collections::BTreeMap;

    fn doc() -> Document {
        Document::new(vec![1, 2, 3], "image/png")
    }

    fn fields() -> ExtractedFields {
        let mut values = BTreeMap::new();
        values.insert("pan_number".to_string(), "ABCDE1234F".to_string());
        values.insert("gender".to_string(), "Male".to_string());
        ExtractedFields {
            values,
            regions: Vec::new(),
        }
    }

    #[test]
    fn test_merge_new_document() {
        let d = doc();
        let r = merge(&d, DocumentType::PanCard, 0.9, &fields(), DuplicateStatus::New);
        assert_eq!(r.document_id, d.id);
        assert_eq!(r.is_duplicate, Some(false));
        assert!(r.matched_document_id.is_none());
        assert!(r.is_successfully_parsed);
        assert_eq!(r.data.len(), 1);
        assert_eq!(r.data["pan_number"], "ABCDE1234F");
    }

    #[test]
    fn test_merge_duplicate_reports_original_id() {
        let record = DuplicateRecord {
            fingerprint: Fingerprint::from_bits(9),
            identity: None,
            document_id: "original".to_string(),
            first_seen: chrono::Utc::now(),
        };
        let d = doc();
        let r = merge(&d, DocumentType::Unknown, 0.3, &fields(), DuplicateStatus::Seen(record));
        assert_eq!(r.document_id, d.id);
        assert_eq!(r.matched_document_id.as_deref(), Some("original"));
        assert_eq!(r.is_duplicate, Some(true));
        assert!(!r.is_successfully_parsed);
        assert!(r.data.is_empty());
    }

    #[test]
    fn test_merge_unknown_status_serializes_null() {
        let r = merge(&doc(), DocumentType::PanCard, 0.8, &fields(), DuplicateStatus::Unknown);
        let json = serde_json::to_value(&r).unwrap();
        assert!(json["is_duplicate"].is_null());
        assert!(json.get("matched_document_id").is_none());
    }

    #[test]
    fn test_missing_model_file_makes_classifier_unavailable() {
        let config = ClassifierConfig {
            model_path: Some("/nonexistent/model.json".into()),
            threshold: 0.6,
        };
        let classifier = load_classifier(&config);
        assert!(classifier.model_version().is_none());
        let err = classifier
            .classify(&Fingerprint::from_bits(0), &ExtractedFields::empty())
            .unwrap_err();
        assert!(err.to_string().contains("model"));
    }
}
