use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use docsift_core::index::MAX_SIMILARITY_THRESHOLD;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Defaults for commands that work without a config file
    /// (`fingerprint`, `preprocess`).
    pub fn minimal() -> Self {
        Self {
            db: DbConfig {
                path: PathBuf::from("./data/docsift.sqlite"),
            },
            server: ServerConfig::default(),
            pipeline: PipelineConfig::default(),
            extraction: ExtractionConfig::default(),
            classifier: ClassifierConfig::default(),
            index: IndexConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
    #[serde(default = "default_allowed_content_types")]
    pub allowed_content_types: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            max_upload_bytes: default_max_upload_bytes(),
            allowed_content_types: default_allowed_content_types(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}
fn default_max_upload_bytes() -> usize {
    10 * 1024 * 1024
}
fn default_allowed_content_types() -> Vec<String> {
    vec!["image/png".to_string(), "image/jpeg".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl PipelineConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_timeout_ms() -> u64 {
    15_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExtractionConfig {
    /// `"disabled"` (no text recognition) or `"tesseract"`.
    #[serde(default = "default_recognizer")]
    pub recognizer: String,
    #[serde(default = "default_tesseract_path")]
    pub tesseract_path: PathBuf,
    #[serde(default = "default_languages")]
    pub languages: Vec<String>,
    #[serde(default = "default_true")]
    pub binarize: bool,
    #[serde(default = "default_min_region_confidence")]
    pub min_region_confidence: f32,
    #[serde(default = "default_min_mean_confidence")]
    pub min_mean_confidence: f32,
    #[serde(default = "default_recognizer_timeout_ms")]
    pub recognizer_timeout_ms: u64,
    /// Images wider or taller than this are refused before decoding.
    #[serde(default = "default_max_image_side")]
    pub max_image_side: u32,
    /// Longest side the recognizer input is downscaled to.
    #[serde(default = "default_working_side")]
    pub working_side: u32,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            recognizer: default_recognizer(),
            tesseract_path: default_tesseract_path(),
            languages: default_languages(),
            binarize: true,
            min_region_confidence: default_min_region_confidence(),
            min_mean_confidence: default_min_mean_confidence(),
            recognizer_timeout_ms: default_recognizer_timeout_ms(),
            max_image_side: default_max_image_side(),
            working_side: default_working_side(),
        }
    }
}

fn default_recognizer() -> String {
    "disabled".to_string()
}
fn default_tesseract_path() -> PathBuf {
    PathBuf::from("tesseract")
}
fn default_languages() -> Vec<String> {
    vec!["eng".to_string()]
}
fn default_true() -> bool {
    true
}
fn default_min_region_confidence() -> f32 {
    0.4
}
fn default_min_mean_confidence() -> f32 {
    0.6
}
fn default_recognizer_timeout_ms() -> u64 {
    10_000
}
fn default_max_image_side() -> u32 {
    6000
}
fn default_working_side() -> u32 {
    2000
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClassifierConfig {
    /// JSON model file. The built-in model is used when unset.
    #[serde(default)]
    pub model_path: Option<PathBuf>,
    #[serde(default = "default_classifier_threshold")]
    pub threshold: f64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            model_path: None,
            threshold: default_classifier_threshold(),
        }
    }
}

fn default_classifier_threshold() -> f64 {
    0.6
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: u32,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: default_similarity_threshold(),
        }
    }
}

fn default_similarity_threshold() -> u32 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// `"pretty"` or `"json"`.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "pretty".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.server.max_upload_bytes == 0 {
        bail!("server.max_upload_bytes must be > 0");
    }
    if config.server.allowed_content_types.is_empty() {
        bail!("server.allowed_content_types must not be empty");
    }

    if config.pipeline.timeout_ms == 0 {
        bail!("pipeline.timeout_ms must be > 0");
    }

    match config.extraction.recognizer.as_str() {
        "disabled" | "tesseract" => {}
        other => bail!(
            "Unknown extraction recognizer: '{}'. Must be disabled or tesseract.",
            other
        ),
    }
    if config.extraction.languages.is_empty() {
        bail!("extraction.languages must not be empty");
    }
    for (key, value) in [
        (
            "extraction.min_region_confidence",
            config.extraction.min_region_confidence,
        ),
        (
            "extraction.min_mean_confidence",
            config.extraction.min_mean_confidence,
        ),
    ] {
        if !(0.0..=1.0).contains(&value) {
            bail!("{} must be in [0.0, 1.0]", key);
        }
    }
    if config.extraction.recognizer_timeout_ms == 0 {
        bail!("extraction.recognizer_timeout_ms must be > 0");
    }
    if config.extraction.max_image_side == 0 || config.extraction.working_side == 0 {
        bail!("extraction.max_image_side and extraction.working_side must be > 0");
    }

    if !(0.0..=1.0).contains(&config.classifier.threshold) {
        bail!("classifier.threshold must be in [0.0, 1.0]");
    }

    if config.index.similarity_threshold > MAX_SIMILARITY_THRESHOLD {
        bail!(
            "index.similarity_threshold must be <= {}",
            MAX_SIMILARITY_THRESHOLD
        );
    }

    match config.logging.format.as_str() {
        "pretty" | "json" => {}
        other => bail!(
            "Unknown logging format: '{}'. Must be pretty or json.",
            other
        ),
    }

    Ok(())
}
