//! # docsift CLI
//!
//! ## Usage
//!
//! ```bash
//! docsift --config ./config/docsift.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docsift init` | Create the SQLite database and run schema migrations |
//! | `docsift serve` | Start the HTTP gateway |
//! | `docsift process <path>` | Run one image through the full pipeline and print the result |
//! | `docsift fingerprint <path> [<other>]` | Print perceptual hashes and their distance |
//! | `docsift preprocess <in> <out>` | Write the image the text recognizer sees |
//! | `docsift stats` | Summarize the duplicate index |
//!
//! `fingerprint` and `preprocess` fall back to built-in defaults when the
//! config file is missing.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use docsift::config::{self, Config};
use docsift::extract::{bound_side, decode_gray, fingerprint_bytes, preprocess};
use docsift::logging::init_logging;
use docsift::pipeline::{Pipeline, Services};
use docsift::{migrate, server, stats};
use docsift_core::models::Document;

/// docsift: document classification and near-duplicate detection for
/// identity-card images.
#[derive(Parser)]
#[command(name = "docsift", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/docsift.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Start the HTTP gateway on `[server].bind`.
    Serve,

    /// Classify, de-duplicate and extract one image file.
    ///
    /// The document is recorded in the duplicate index exactly as an upload
    /// through the gateway would be.
    Process {
        /// PNG or JPEG file.
        path: PathBuf,
    },

    /// Print the perceptual fingerprint of one image, or the Hamming
    /// distance between two.
    Fingerprint {
        path: PathBuf,
        other: Option<PathBuf>,
    },

    /// Write the preprocessed (blurred, binarized) image handed to the
    /// text recognizer.
    Preprocess {
        input: PathBuf,
        output: PathBuf,
    },

    /// Show duplicate index statistics.
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Commands that don't require a config file
    match &cli.command {
        Commands::Fingerprint { path, other } => {
            let cfg = config::load_config(&cli.config).unwrap_or_else(|_| Config::minimal());
            init_logging(&cfg.logging);
            return run_fingerprint(&cfg, path, other.as_deref());
        }
        Commands::Preprocess { input, output } => {
            let cfg = config::load_config(&cli.config).unwrap_or_else(|_| Config::minimal());
            init_logging(&cfg.logging);
            return run_preprocess(&cfg, input, output);
        }
        _ => {}
    }

    let cfg = config::load_config(&cli.config)?;
    init_logging(&cfg.logging);

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Process { path } => {
            run_process(&cfg, &path).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Fingerprint { .. } | Commands::Preprocess { .. } => {
            // Handled above (before config loading)
            unreachable!()
        }
    }

    Ok(())
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))
}

/// Declared MIME type from the file extension, as a browser would send it.
fn mime_from_extension(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        _ => "",
    }
}

async fn run_process(cfg: &Config, path: &Path) -> Result<()> {
    let bytes = read_image(path)?;
    let services = Services::from_config(cfg).await?;
    let pipeline = Pipeline::new(services, cfg.pipeline.timeout());

    let document = Document::new(bytes, mime_from_extension(path));
    let result = pipeline
        .process(document)
        .await
        .with_context(|| format!("Failed to process {}", path.display()))?;

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

fn run_fingerprint(cfg: &Config, path: &Path, other: Option<&Path>) -> Result<()> {
    let first = fingerprint_bytes(&read_image(path)?, cfg.extraction.max_image_side)
        .with_context(|| format!("Cannot fingerprint {}", path.display()))?;
    println!("{}  {}", first, path.display());

    if let Some(other) = other {
        let second = fingerprint_bytes(&read_image(other)?, cfg.extraction.max_image_side)
            .with_context(|| format!("Cannot fingerprint {}", other.display()))?;
        println!("{}  {}", second, other.display());

        let distance = first.distance(&second);
        let threshold = cfg.index.similarity_threshold;
        let verdict = if distance <= threshold {
            "near-duplicate"
        } else {
            "distinct"
        };
        println!("distance: {} (threshold {}, {})", distance, threshold, verdict);
    }
    Ok(())
}

fn run_preprocess(cfg: &Config, input: &Path, output: &Path) -> Result<()> {
    let gray = decode_gray(&read_image(input)?, cfg.extraction.max_image_side)
        .with_context(|| format!("Cannot decode {}", input.display()))?;
    preprocess(&bound_side(gray, cfg.extraction.working_side), cfg.extraction.binarize)
        .save(output)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    println!("Wrote {}", output.display());
    Ok(())
}
