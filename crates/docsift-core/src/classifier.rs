//! Document-type classification.
//!
//! The [`Classifier`] trait is the seam the orchestrator depends on. The
//! shipped implementation, [`KeywordClassifier`], scores each label of a
//! [`ClassifierModel`] as
//!
//! ```text
//! score(label) = ln(prior) + Σ keyword weights + Σ field weights + Σ prototype weights
//! p(label)     = softmax(score / temperature)
//! ```
//!
//! and reports the top label with its probability as the confidence. When
//! that probability is below the configured threshold the result is
//! [`DocumentType::Unknown`]. With no evidence at all the probabilities
//! collapse to the normalized priors, none of which clears a sensible
//! threshold, so an unreadable document is never given a specific label.
//!
//! # Determinism
//!
//! For a fixed model and input the result is always the same. Labels whose
//! probabilities tie are ordered by prior, then by declaration order.
//!
//! # Model files
//!
//! Models serialize to JSON:
//!
//! ```json
//! {
//!   "version": "custom-1",
//!   "temperature": 1.0,
//!   "labels": [
//!     {
//!       "label": "PAN_CARD",
//!       "prior": 0.5,
//!       "keywords": [{ "term": "income tax department", "weight": 2.5 }],
//!       "fields": [{ "field": "pan_number", "weight": 3.0 }],
//!       "prototypes": []
//!     }
//!   ]
//! }
//! ```

use std::collections::HashSet;

use anyhow::{bail, Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ClassifyError;
use crate::fingerprint::Fingerprint;
use crate::models::{ClassificationResult, DocumentType, ExtractedFields};

/// Width of the buckets probabilities are compared in; equal buckets tie.
const TIE_EPSILON: f64 = 1e-12;

/// Maps extracted features to a document type.
///
/// Implementations hold model state that is loaded once and shared
/// read-only across concurrent requests.
pub trait Classifier: Send + Sync {
    /// Classify one document. Fails only when the model is not loaded.
    fn classify(
        &self,
        fingerprint: &Fingerprint,
        fields: &ExtractedFields,
    ) -> Result<ClassificationResult, ClassifyError>;

    /// Version string of the loaded model, or `None` if loading failed.
    fn model_version(&self) -> Option<&str>;
}

// ============ Model ============

/// Serializable classifier model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifierModel {
    pub version: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    pub labels: Vec<LabelModel>,
}

fn default_temperature() -> f64 {
    1.0
}

/// Per-label evidence weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelModel {
    pub label: DocumentType,
    /// Historical frequency of this label among processed documents.
    pub prior: f64,
    #[serde(default)]
    pub keywords: Vec<KeywordSignal>,
    #[serde(default)]
    pub fields: Vec<FieldSignal>,
    #[serde(default)]
    pub prototypes: Vec<PrototypeSignal>,
}

/// A phrase matched case-insensitively on word boundaries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeywordSignal {
    pub term: String,
    pub weight: f64,
}

/// Presence of an extracted field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSignal {
    pub field: String,
    pub weight: f64,
}

/// Layout similarity to a reference fingerprint (e.g. a blank card
/// template).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrototypeSignal {
    pub fingerprint: Fingerprint,
    pub radius: u32,
    pub weight: f64,
}

fn kw(term: &str, weight: f64) -> KeywordSignal {
    KeywordSignal {
        term: term.to_string(),
        weight,
    }
}

fn field(name: &str, weight: f64) -> FieldSignal {
    FieldSignal {
        field: name.to_string(),
        weight,
    }
}

impl ClassifierModel {
    /// The model compiled into the binary, covering PAN, Aadhaar, and
    /// voter ID cards.
    pub fn builtin() -> Self {
        Self {
            version: "builtin-kyc-1".to_string(),
            temperature: 1.0,
            labels: vec![
                LabelModel {
                    label: DocumentType::PanCard,
                    prior: 0.45,
                    keywords: vec![
                        kw("INCOME TAX DEPARTMENT", 2.5),
                        kw("PERMANENT ACCOUNT NUMBER", 2.5),
                        kw("INCOME TAX", 1.5),
                        kw("INCOMETAX", 1.5),
                        kw("GOVT. OF INDIA", 0.5),
                        kw("आयकर विभाग", 2.5),
                    ],
                    fields: vec![field("pan_number", 3.0)],
                    prototypes: Vec::new(),
                },
                LabelModel {
                    label: DocumentType::AadhaarCard,
                    prior: 0.40,
                    keywords: vec![
                        kw("AADHAAR", 2.5),
                        kw("UNIQUE IDENTIFICATION AUTHORITY", 2.5),
                        kw("GOVERNMENT OF INDIA", 0.75),
                        kw("VID", 1.0),
                        kw("ENROLMENT", 1.0),
                        kw("ENROLLMENT", 1.0),
                        kw("आधार", 2.5),
                        kw("भारत सरकार", 0.75),
                    ],
                    fields: vec![field("aadhaar_number", 3.0), field("gender", 0.3)],
                    prototypes: Vec::new(),
                },
                LabelModel {
                    label: DocumentType::VoterIdCard,
                    prior: 0.15,
                    keywords: vec![
                        kw("ELECTION COMMISSION OF INDIA", 3.0),
                        kw("ELECTOR", 1.5),
                        kw("EPIC", 1.5),
                        kw("IDENTITY CARD", 1.0),
                        kw("भारत निर्वाचन आयोग", 3.0),
                        kw("निर्वाचक", 1.5),
                    ],
                    fields: vec![field("voter_id", 3.0), field("name_hindi", 0.3)],
                    prototypes: Vec::new(),
                },
            ],
        }
    }

    /// Parse and validate a JSON model.
    pub fn from_json(json: &str) -> Result<Self> {
        let model: ClassifierModel =
            serde_json::from_str(json).context("Failed to parse classifier model")?;
        model.validate()?;
        Ok(model)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.labels.is_empty() {
            bail!("classifier model '{}' has no labels", self.version);
        }
        if !(self.temperature.is_finite() && self.temperature > 0.0) {
            bail!("classifier model temperature must be > 0");
        }
        let mut seen = HashSet::new();
        for label in &self.labels {
            if label.label == DocumentType::Unknown {
                bail!("UNKNOWN is a fallback and cannot be a model label");
            }
            if !seen.insert(label.label) {
                bail!("label {} is declared more than once", label.label);
            }
            if !(label.prior.is_finite() && label.prior > 0.0) {
                bail!("label {} must have a prior > 0", label.label);
            }
            let weights = label
                .keywords
                .iter()
                .map(|k| k.weight)
                .chain(label.fields.iter().map(|f| f.weight))
                .chain(label.prototypes.iter().map(|p| p.weight));
            for w in weights {
                if !w.is_finite() {
                    bail!("label {} has a non-finite weight", label.label);
                }
            }
            if label.keywords.iter().any(|k| k.term.trim().is_empty()) {
                bail!("label {} has an empty keyword", label.label);
            }
        }
        Ok(())
    }
}

// ============ Compiled model ============

struct CompiledLabel {
    label: DocumentType,
    prior: f64,
    log_prior: f64,
    keywords: Vec<(Regex, f64)>,
    fields: Vec<FieldSignal>,
    prototypes: Vec<PrototypeSignal>,
}

struct CompiledModel {
    version: String,
    temperature: f64,
    labels: Vec<CompiledLabel>,
}

/// Build a case-insensitive regex for `term`: inner whitespace matches any
/// whitespace run, and alphanumeric ends are anchored on word boundaries.
fn keyword_regex(term: &str) -> Result<Regex> {
    let term = term.trim();
    let body = term
        .split_whitespace()
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(r"\s+");
    let starts_word = term.chars().next().is_some_and(char::is_alphanumeric);
    let ends_word = term.chars().last().is_some_and(char::is_alphanumeric);
    let pattern = format!(
        "(?i){}{}{}",
        if starts_word { r"\b" } else { "" },
        body,
        if ends_word { r"\b" } else { "" }
    );
    Regex::new(&pattern).with_context(|| format!("invalid keyword '{}'", term))
}

fn compile(model: ClassifierModel) -> Result<CompiledModel> {
    model.validate()?;
    let labels = model
        .labels
        .into_iter()
        .map(|l| {
            let keywords = l
                .keywords
                .iter()
                .map(|k| Ok((keyword_regex(&k.term)?, k.weight)))
                .collect::<Result<Vec<_>>>()?;
            Ok(CompiledLabel {
                label: l.label,
                prior: l.prior,
                log_prior: l.prior.ln(),
                keywords,
                fields: l.fields,
                prototypes: l.prototypes,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(CompiledModel {
        version: model.version,
        temperature: model.temperature,
        labels,
    })
}

// ============ Keyword classifier ============

/// Probability assigned to one label.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelScore {
    pub label: DocumentType,
    pub probability: f64,
}

/// Weighted-evidence classifier over a [`ClassifierModel`].
pub struct KeywordClassifier {
    model: std::result::Result<CompiledModel, String>,
    threshold: f64,
}

impl KeywordClassifier {
    /// Compile `model`. Labels with confidence below `threshold` are
    /// reported as [`DocumentType::Unknown`].
    pub fn new(model: ClassifierModel, threshold: f64) -> Result<Self> {
        if !(0.0..=1.0).contains(&threshold) {
            bail!("classifier threshold must be in [0.0, 1.0]");
        }
        Ok(Self {
            model: Ok(compile(model)?),
            threshold,
        })
    }

    /// A classifier whose model failed to load. Every call to
    /// [`Classifier::classify`] returns
    /// [`ClassifyError::ClassificationUnavailable`] with `reason`.
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            model: Err(reason.into()),
            threshold: 1.0,
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Probabilities for every label, best first.
    pub fn rank(
        &self,
        fingerprint: &Fingerprint,
        fields: &ExtractedFields,
    ) -> Result<Vec<LabelScore>, ClassifyError> {
        let model = self
            .model
            .as_ref()
            .map_err(|reason| ClassifyError::ClassificationUnavailable(reason.clone()))?;

        let text = fields.text();
        let scores: Vec<f64> = model
            .labels
            .iter()
            .map(|l| {
                let keyword_score: f64 = l
                    .keywords
                    .iter()
                    .filter(|(re, _)| re.is_match(&text))
                    .map(|(_, w)| w)
                    .sum();
                let field_score: f64 = l
                    .fields
                    .iter()
                    .filter(|f| fields.values.contains_key(&f.field))
                    .map(|f| f.weight)
                    .sum();
                let prototype_score: f64 = l
                    .prototypes
                    .iter()
                    .filter(|p| p.fingerprint.is_near(fingerprint, p.radius))
                    .map(|p| p.weight)
                    .sum();
                (l.log_prior + keyword_score + field_score + prototype_score) / model.temperature
            })
            .collect();

        let probabilities = softmax(&scores);

        let priors: Vec<f64> = model.labels.iter().map(|l| l.prior).collect();
        let order = rank_order(&probabilities, &priors);

        Ok(order
            .into_iter()
            .map(|i| LabelScore {
                label: model.labels[i].label,
                probability: probabilities[i],
            })
            .collect())
    }
}

/// Label indices by descending probability. Probabilities are compared in
/// [`TIE_EPSILON`] buckets so the ordering stays total; ties go to the
/// larger prior, then to declaration order.
fn rank_order(probabilities: &[f64], priors: &[f64]) -> Vec<usize> {
    let bucket = |i: usize| (probabilities[i] / TIE_EPSILON).round() as i64;
    let mut order: Vec<usize> = (0..probabilities.len()).collect();
    order.sort_by(|&a, &b| {
        bucket(b)
            .cmp(&bucket(a))
            .then(priors[b].total_cmp(&priors[a]))
            .then(a.cmp(&b))
    });
    order
}

fn softmax(scores: &[f64]) -> Vec<f64> {
    let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = scores.iter().map(|s| (s - max).exp()).collect();
    let total: f64 = exps.iter().sum();
    exps.iter().map(|e| e / total).collect()
}

impl Classifier for KeywordClassifier {
    fn classify(
        &self,
        fingerprint: &Fingerprint,
        fields: &ExtractedFields,
    ) -> Result<ClassificationResult, ClassifyError> {
        let ranked = self.rank(fingerprint, fields)?;
        let top = &ranked[0];
        let document_type = if top.probability >= self.threshold {
            top.label
        } else {
            DocumentType::Unknown
        };
        Ok(ClassificationResult {
            document_type,
            confidence: top.probability.clamp(0.0, 1.0),
        })
    }

    fn model_version(&self) -> Option<&str> {
        self.model.as_ref().ok().map(|m| m.version.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::parse_fields;
    use crate::models::TextRegion;

    fn fields_from(lines: &[&str]) -> ExtractedFields {
        let regions: Vec<TextRegion> = lines.iter().map(|l| TextRegion::new(*l, 0.9)).collect();
        ExtractedFields {
            values: parse_fields(&regions),
            regions,
        }
    }

    fn builtin(threshold: f64) -> KeywordClassifier {
        KeywordClassifier::new(ClassifierModel::builtin(), threshold).unwrap()
    }

    const FP: Fingerprint = Fingerprint::from_bits(0);

    #[test]
    fn test_builtin_model_is_valid_json() {
        let json = ClassifierModel::builtin().to_json().unwrap();
        let parsed = ClassifierModel::from_json(&json).unwrap();
        assert_eq!(parsed, ClassifierModel::builtin());
    }

    #[test]
    fn test_pan_card_is_classified() {
        let c = builtin(0.6);
        let result = c
            .classify(
                &FP,
                &fields_from(&["INCOME TAX DEPARTMENT", "GOVT. OF INDIA", "ABCPS1234K"]),
            )
            .unwrap();
        assert_eq!(result.document_type, DocumentType::PanCard);
        assert!(result.confidence > 0.9);
    }

    #[test]
    fn test_aadhaar_card_is_classified() {
        let c = builtin(0.6);
        let result = c
            .classify(&FP, &fields_from(&["Government of India", "4821 7730 1942", "MALE"]))
            .unwrap();
        assert_eq!(result.document_type, DocumentType::AadhaarCard);
    }

    #[test]
    fn test_voter_id_is_classified() {
        let c = builtin(0.6);
        let result = c
            .classify(
                &FP,
                &fields_from(&["ELECTION COMMISSION OF INDIA", "XYZ1234567"]),
            )
            .unwrap();
        assert_eq!(result.document_type, DocumentType::VoterIdCard);
    }

    #[test]
    fn test_no_evidence_is_unknown_with_prior_confidence() {
        let c = builtin(0.6);
        let result = c.classify(&FP, &ExtractedFields::empty()).unwrap();
        assert_eq!(result.document_type, DocumentType::Unknown);
        assert!((result.confidence - 0.45).abs() < 1e-9);
    }

    #[test]
    fn test_below_threshold_is_always_unknown() {
        let inputs = [
            vec!["INCOME TAX DEPARTMENT"],
            vec!["Government of India"],
            vec!["EPIC"],
            vec!["random words on a receipt"],
            vec!["AADHAAR", "4821 7730 1942"],
        ];
        for threshold in [0.5, 0.9, 0.999_999] {
            let c = builtin(threshold);
            for lines in &inputs {
                let result = c.classify(&FP, &fields_from(lines)).unwrap();
                if result.confidence < threshold {
                    assert_eq!(result.document_type, DocumentType::Unknown, "{:?}", lines);
                } else {
                    assert_ne!(result.document_type, DocumentType::Unknown, "{:?}", lines);
                }
            }
        }
    }

    #[test]
    fn test_weak_generic_phrase_alone_is_unknown() {
        let c = builtin(0.6);
        let result = c.classify(&FP, &fields_from(&["Government of India"])).unwrap();
        assert_eq!(result.document_type, DocumentType::Unknown);
    }

    #[test]
    fn test_keywords_respect_word_boundaries() {
        let c = builtin(0.6);
        // "PROVIDED" contains "VID" but must not count as Aadhaar evidence.
        let a = c.rank(&FP, &fields_from(&["PROVIDED"])).unwrap();
        let b = c.rank(&FP, &ExtractedFields::empty()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_tie_broken_by_prior() {
        let model = ClassifierModel {
            version: "tie".into(),
            temperature: 1.0,
            labels: vec![
                LabelModel {
                    label: DocumentType::VoterIdCard,
                    prior: 0.5,
                    keywords: vec![kw("CARD", 1.0)],
                    fields: vec![],
                    prototypes: vec![],
                },
                LabelModel {
                    label: DocumentType::PanCard,
                    prior: 0.5,
                    keywords: vec![kw("CARD", 1.0)],
                    fields: vec![],
                    prototypes: vec![],
                },
            ],
        };
        // Equal priors: declaration order decides.
        let c = KeywordClassifier::new(model.clone(), 0.0).unwrap();
        let r = c.classify(&FP, &fields_from(&["CARD"])).unwrap();
        assert_eq!(r.document_type, DocumentType::VoterIdCard);

        // Scores tie exactly when the evidence offsets the prior gap.
        let mut skewed = model;
        skewed.labels[0].prior = 0.25;
        skewed.labels[0].keywords[0].weight = 1.0 + 2f64.ln();
        let c = KeywordClassifier::new(skewed, 0.0).unwrap();
        let r = c.classify(&FP, &fields_from(&["CARD"])).unwrap();
        assert_eq!(r.document_type, DocumentType::PanCard);
    }

    #[test]
    fn test_rank_order_is_consistent_for_near_ties() {
        // Neighbours sit within the tie width of each other but the ends do
        // not; a pairwise epsilon comparison is not transitive here.
        let step = TIE_EPSILON * 0.6;
        let probabilities: Vec<f64> = (0..40).map(|i| 0.01 + step * i as f64).collect();
        let priors: Vec<f64> = (0..40).map(|i| if i % 3 == 0 { 0.2 } else { 0.1 }).collect();

        let order = rank_order(&probabilities, &priors);
        let mut sorted = order.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..40).collect::<Vec<_>>());
        for pair in order.windows(2) {
            assert!(probabilities[pair[0]] >= probabilities[pair[1]] - TIE_EPSILON);
        }
        assert_eq!(order, rank_order(&probabilities, &priors));
    }

    #[test]
    fn test_rank_order_clear_winner_then_prior() {
        let order = rank_order(&[0.2, 0.4, 0.2, 0.2], &[0.1, 0.1, 0.3, 0.1]);
        assert_eq!(order, vec![1, 2, 0, 3]);
    }

    #[test]
    fn test_prototype_signal() {
        let template = Fingerprint::from_bits(0xF0F0_F0F0_F0F0_F0F0);
        let mut model = ClassifierModel::builtin();
        model.labels[2].prototypes.push(PrototypeSignal {
            fingerprint: template,
            radius: 4,
            weight: 5.0,
        });
        let c = KeywordClassifier::new(model, 0.6).unwrap();
        let near = Fingerprint::from_bits(template.bits() ^ 0b111);
        let r = c.classify(&near, &ExtractedFields::empty()).unwrap();
        assert_eq!(r.document_type, DocumentType::VoterIdCard);
        let r = c.classify(&FP, &ExtractedFields::empty()).unwrap();
        assert_eq!(r.document_type, DocumentType::Unknown);
    }

    #[test]
    fn test_deterministic() {
        let c = builtin(0.6);
        let f = fields_from(&["AADHAAR", "Government of India", "4821 7730 1942"]);
        let a = c.classify(&FP, &f).unwrap();
        let b = c.classify(&FP, &f).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_unavailable_model_fails() {
        let c = KeywordClassifier::unavailable("model file missing");
        let err = c.classify(&FP, &ExtractedFields::empty()).unwrap_err();
        assert!(matches!(err, ClassifyError::ClassificationUnavailable(ref m) if m == "model file missing"));
        assert!(c.model_version().is_none());
    }

    #[test]
    fn test_invalid_models_rejected() {
        assert!(ClassifierModel::from_json("{").is_err());
        let mut m = ClassifierModel::builtin();
        m.labels[0].label = DocumentType::Unknown;
        assert!(m.validate().is_err());
        let mut m = ClassifierModel::builtin();
        m.labels[1].prior = 0.0;
        assert!(m.validate().is_err());
        let mut m = ClassifierModel::builtin();
        m.labels[1].label = DocumentType::PanCard;
        assert!(m.validate().is_err());
        assert!(KeywordClassifier::new(ClassifierModel::builtin(), 1.5).is_err());
    }
}
