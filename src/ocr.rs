//! Text recognition backends.
//!
//! The extractor hands a preprocessed PNG to a [`TextRecognizer`] and gets
//! back recognized lines with confidences. Two backends ship with docsift:
//!
//! | Recognizer | Config value | Behaviour |
//! |------------|--------------|-----------|
//! | [`DisabledRecognizer`] | `"disabled"` | Recognizes nothing; classification falls back to layout prototypes and priors |
//! | [`TesseractRecognizer`] | `"tesseract"` | Pipes the image through the `tesseract` CLI and parses its TSV output |
//!
//! The tesseract child process is spawned with `kill_on_drop`, so dropping
//! the recognition future (request timeout, client disconnect) kills it.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use docsift_core::models::TextRegion;

use crate::config::ExtractionConfig;

/// A text recognition engine.
///
/// Implementations must be cancel-safe: dropping the future returned by
/// [`recognize`](TextRecognizer::recognize) must release any external
/// resources it holds.
#[async_trait]
pub trait TextRecognizer: Send + Sync {
    /// Short identifier used in logs.
    fn name(&self) -> &str;

    /// Recognize text lines in a PNG image.
    async fn recognize(&self, image_png: &[u8]) -> Result<Vec<TextRegion>>;
}

/// Recognizer used when `[extraction].recognizer = "disabled"`.
pub struct DisabledRecognizer;

#[async_trait]
impl TextRecognizer for DisabledRecognizer {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn recognize(&self, _image_png: &[u8]) -> Result<Vec<TextRegion>> {
        Ok(Vec::new())
    }
}

/// Recognizer backed by the `tesseract` command-line tool.
pub struct TesseractRecognizer {
    binary: PathBuf,
    languages: String,
    timeout: Duration,
}

impl TesseractRecognizer {
    /// Check that the binary runs before accepting traffic.
    pub async fn probe(config: &ExtractionConfig) -> Result<Self> {
        let binary = config.tesseract_path.clone();
        let output = tokio::time::timeout(
            Duration::from_secs(5),
            Command::new(&binary)
                .arg("--version")
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| anyhow!("{} --version timed out", binary.display()))?
        .with_context(|| format!("Failed to run tesseract at {}", binary.display()))?;

        if !output.status.success() {
            bail!(
                "{} --version exited with {}",
                binary.display(),
                output.status
            );
        }

        let version = String::from_utf8_lossy(&output.stdout);
        let first_line = version.lines().next().unwrap_or("").trim();
        tracing::info!(binary = %binary.display(), version = first_line, "tesseract available");

        Ok(Self {
            binary,
            languages: config.languages.join("+"),
            timeout: Duration::from_millis(config.recognizer_timeout_ms),
        })
    }
}

#[async_trait]
impl TextRecognizer for TesseractRecognizer {
    fn name(&self) -> &str {
        "tesseract"
    }

    async fn recognize(&self, image_png: &[u8]) -> Result<Vec<TextRegion>> {
        let mut child = Command::new(&self.binary)
            .args(["stdin", "stdout", "-l", self.languages.as_str(), "tsv"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.binary.display()))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("tesseract stdin not captured"))?;
        let input = image_png.to_vec();
        let feed = async move {
            stdin.write_all(&input).await?;
            stdin.shutdown().await
        };

        let run = async {
            let (fed, output) = tokio::join!(feed, child.wait_with_output());
            let output = output.context("tesseract did not complete")?;
            fed.context("Failed to write image to tesseract")?;
            Ok::<_, anyhow::Error>(output)
        };

        let output = tokio::time::timeout(self.timeout, run)
            .await
            .map_err(|_| anyhow!("tesseract timed out after {:?}", self.timeout))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("tesseract exited with {}: {}", output.status, stderr.trim());
        }

        Ok(parse_tsv(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Build the recognizer named in `[extraction].recognizer`.
pub async fn create_recognizer(config: &ExtractionConfig) -> Result<Arc<dyn TextRecognizer>> {
    match config.recognizer.as_str() {
        "disabled" => Ok(Arc::new(DisabledRecognizer)),
        "tesseract" => Ok(Arc::new(TesseractRecognizer::probe(config).await?)),
        other => bail!("Unknown extraction recognizer: '{}'", other),
    }
}

// ============ TSV parsing ============

struct LineAccumulator {
    key: (u32, u32, u32),
    words: Vec<String>,
    confidence_sum: f32,
}

impl LineAccumulator {
    fn finish(self) -> Option<TextRegion> {
        if self.words.is_empty() {
            return None;
        }
        let confidence = self.confidence_sum / self.words.len() as f32 / 100.0;
        Some(TextRegion::new(
            self.words.join(" "),
            confidence.clamp(0.0, 1.0),
        ))
    }
}

/// Group tesseract's word-level TSV rows into lines.
///
/// Columns: `level page block par line word left top width height conf text`.
/// Only level-5 (word) rows with non-negative confidence and non-blank text
/// contribute; line confidence is the mean word confidence scaled to `[0, 1]`.
pub fn parse_tsv(tsv: &str) -> Vec<TextRegion> {
    let mut regions = Vec::new();
    let mut current: Option<LineAccumulator> = None;

    for row in tsv.lines().skip(1) {
        let cols: Vec<&str> = row.split('\t').collect();
        if cols.len() < 12 || cols[0] != "5" {
            continue;
        }
        let text = cols[11].trim();
        let confidence: f32 = match cols[10].trim().parse() {
            Ok(c) if c >= 0.0 => c,
            _ => continue,
        };
        if text.is_empty() {
            continue;
        }
        let num = |i: usize| cols[i].parse::<u32>().unwrap_or(0);
        let key = (num(2), num(3), num(4));

        match current.as_mut() {
            Some(line) if line.key == key => {
                line.words.push(text.to_string());
                line.confidence_sum += confidence;
            }
            _ => {
                if let Some(done) = current.take().and_then(LineAccumulator::finish) {
                    regions.push(done);
                }
                current = Some(LineAccumulator {
                    key,
                    words: vec![text.to_string()],
                    confidence_sum: confidence,
                });
            }
        }
    }

    if let Some(done) = current.and_then(LineAccumulator::finish) {
        regions.push(done);
    }
    regions
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str =
        "level\tpage_num\tblock_num\tpar_num\tline_num\tword_num\tleft\ttop\twidth\theight\tconf\ttext";

    fn word(block: u32, line: u32, word: u32, conf: &str, text: &str) -> String {
        format!("5\t1\t{block}\t1\t{line}\t{word}\t0\t0\t10\t10\t{conf}\t{text}")
    }

    #[test]
    fn test_parse_tsv_groups_words_into_lines() {
        let tsv = [
            HEADER.to_string(),
            "1\t1\t0\t0\t0\t0\t0\t0\t100\t100\t-1\t".to_string(),
            word(1, 1, 1, "96", "INCOME"),
            word(1, 1, 2, "90", "TAX"),
            word(1, 1, 3, "84", "DEPARTMENT"),
            word(1, 2, 1, "80", "ABCDE1234F"),
        ]
        .join("\n");

        let regions = parse_tsv(&tsv);
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0].text, "INCOME TAX DEPARTMENT");
        assert!((regions[0].confidence - 0.90).abs() < 1e-5);
        assert_eq!(regions[1].text, "ABCDE1234F");
    }

    #[test]
    fn test_parse_tsv_skips_blank_and_unscored_words() {
        let tsv = [
            HEADER.to_string(),
            word(1, 1, 1, "-1", ""),
            word(1, 1, 2, "95", "   "),
            word(2, 1, 1, "70", "Name"),
            "garbage row".to_string(),
        ]
        .join("\n");

        let regions = parse_tsv(&tsv);
        assert_eq!(regions, vec![TextRegion::new("Name", 0.7)]);
    }

    #[test]
    fn test_parse_tsv_empty_output() {
        assert!(parse_tsv("").is_empty());
        assert!(parse_tsv(HEADER).is_empty());
    }

    #[tokio::test]
    async fn test_disabled_recognizer_returns_nothing() {
        let regions = DisabledRecognizer.recognize(b"png").await.unwrap();
        assert!(regions.is_empty());
    }

    #[tokio::test]
    async fn test_probe_fails_for_missing_binary() {
        let config = ExtractionConfig {
            recognizer: "tesseract".to_string(),
            tesseract_path: PathBuf::from("/nonexistent/tesseract"),
            ..ExtractionConfig::default()
        };
        assert!(create_recognizer(&config).await.is_err());
    }
}
