//! Core data types that flow through the processing pipeline.
//!
//! A [`Document`] enters, the extractor turns it into a
//! [`Fingerprint`](crate::fingerprint::Fingerprint) and
//! [`ExtractedFields`], the classifier produces a [`ClassificationResult`],
//! the duplicate index answers with an optional [`DuplicateRecord`], and the
//! orchestrator merges everything into one [`ProcessingResult`].

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::fingerprint::Fingerprint;

/// One uploaded image, alive for the duration of a single request.
#[derive(Debug, Clone)]
pub struct Document {
    /// UUID assigned on arrival. Becomes the `document_id` of a new
    /// [`DuplicateRecord`] if this document is the first of its cluster.
    pub id: String,
    pub bytes: Vec<u8>,
    /// SHA-256 of `bytes`, hex encoded.
    pub content_hash: String,
    /// MIME type declared by the client (may be empty).
    pub mime_type: String,
    pub uploaded_at: DateTime<Utc>,
}

impl Document {
    pub fn new(bytes: Vec<u8>, mime_type: impl Into<String>) -> Self {
        let content_hash = hex::encode(Sha256::digest(&bytes));
        Self {
            id: Uuid::new_v4().to_string(),
            bytes,
            content_hash,
            mime_type: mime_type.into(),
            uploaded_at: Utc::now(),
        }
    }
}

/// The closed set of document types the classifier can emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentType {
    PanCard,
    AadhaarCard,
    VoterIdCard,
    Unknown,
}

impl DocumentType {
    /// Every label except [`DocumentType::Unknown`], in declaration order.
    pub const KNOWN: [DocumentType; 3] = [
        DocumentType::PanCard,
        DocumentType::AadhaarCard,
        DocumentType::VoterIdCard,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentType::PanCard => "PAN_CARD",
            DocumentType::AadhaarCard => "AADHAAR_CARD",
            DocumentType::VoterIdCard => "VOTER_ID_CARD",
            DocumentType::Unknown => "UNKNOWN",
        }
    }

    /// Parse the lowercase path form used by the OCR endpoints
    /// (`pan_card`, `aadhaar_card`, `voter_id_card`).
    pub fn from_slug(slug: &str) -> Option<Self> {
        match slug {
            "pan_card" => Some(DocumentType::PanCard),
            "aadhaar_card" => Some(DocumentType::AadhaarCard),
            "voter_id_card" => Some(DocumentType::VoterIdCard),
            _ => None,
        }
    }

    /// Field names that make up this type's structured data.
    pub fn field_schema(&self) -> &'static [&'static str] {
        match self {
            DocumentType::PanCard => &["pan_number", "name", "date_of_birth"],
            DocumentType::AadhaarCard => &["aadhaar_number", "name", "date_of_birth", "gender"],
            DocumentType::VoterIdCard => &["voter_id", "name", "name_hindi"],
            DocumentType::Unknown => &[],
        }
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A line of text recognized in the image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextRegion {
    pub text: String,
    /// Recognition confidence in `[0, 1]`.
    pub confidence: f32,
}

impl TextRegion {
    pub fn new(text: impl Into<String>, confidence: f32) -> Self {
        Self {
            text: text.into(),
            confidence,
        }
    }
}

/// Structured fields pulled out of one document, plus the recognized text
/// they were parsed from.
///
/// Empty when recognition confidence was too low to trust; the extractor
/// never fills in a subset of guessed values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractedFields {
    pub values: BTreeMap<String, String>,
    pub regions: Vec<TextRegion>,
}

impl ExtractedFields {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty() && self.regions.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// All recognized lines joined with newlines.
    pub fn text(&self) -> String {
        self.regions
            .iter()
            .map(|r| r.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// The subset of values belonging to `doc_type`'s schema.
    pub fn for_type(&self, doc_type: DocumentType) -> BTreeMap<String, String> {
        doc_type
            .field_schema()
            .iter()
            .filter_map(|name| {
                self.values
                    .get(*name)
                    .map(|v| ((*name).to_string(), v.clone()))
            })
            .collect()
    }
}

/// Output of the classifier.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassificationResult {
    pub document_type: DocumentType,
    /// Probability of the top-ranked label under the loaded model.
    pub confidence: f64,
}

/// Fields that identify the card holder, in the order they are tried.
pub const IDENTITY_FIELDS: [&str; 3] = ["pan_number", "aadhaar_number", "voter_id"];

/// What the duplicate index compares.
///
/// Cards printed from one template hash close together, so the fingerprint
/// alone cannot tell two holders apart. When an identity number was read it
/// rides along as `field:value`, and two keys whose identities are both
/// known and differ never match, however near their fingerprints are.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateKey {
    pub fingerprint: Fingerprint,
    pub identity: Option<String>,
}

impl DuplicateKey {
    pub fn new(fingerprint: Fingerprint) -> Self {
        Self {
            fingerprint,
            identity: None,
        }
    }

    pub fn with_identity(fingerprint: Fingerprint, identity: impl Into<String>) -> Self {
        Self {
            fingerprint,
            identity: Some(identity.into()),
        }
    }

    /// Key for an extracted document: the first identity field present.
    pub fn from_fields(fingerprint: Fingerprint, fields: &ExtractedFields) -> Self {
        let identity = IDENTITY_FIELDS
            .iter()
            .find_map(|name| fields.get(name).map(|value| format!("{}:{}", name, value)));
        Self {
            fingerprint,
            identity,
        }
    }
}

/// A persisted entry of the duplicate index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateRecord {
    pub fingerprint: Fingerprint,
    /// Identity of the first sighting, when one was read.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
    pub document_id: String,
    pub first_seen: DateTime<Utc>,
}

impl DuplicateRecord {
    /// Whether the identities allow `key` to belong to this record. An
    /// unknown identity on either side defers to the fingerprint.
    pub fn admits(&self, key: &DuplicateKey) -> bool {
        match (&self.identity, &key.identity) {
            (Some(ours), Some(theirs)) => ours == theirs,
            _ => true,
        }
    }
}

/// The response unit returned to the client.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessingResult {
    pub document_id: String,
    pub document_type: DocumentType,
    pub confidence: f64,
    /// `None` when the duplicate index could not be consulted.
    pub is_duplicate: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_document_id: Option<String>,
    pub is_successfully_parsed: bool,
    pub data: BTreeMap<String, String>,
}
