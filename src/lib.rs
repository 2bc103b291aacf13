//! # docsift
//!
//! Document classification and near-duplicate detection for identity-card
//! images (PAN, Aadhaar, Voter ID).
//!
//! Each upload is fingerprinted with a 64-bit perceptual hash, its text is
//! recognized and parsed into fields, and then classification and the
//! duplicate lookup run side by side. The first document of every
//! similarity cluster is recorded in SQLite.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌────────────┐   ┌────────────┐
//! │  HTTP /  │──▶│ Extractor  │──▶│ Classifier │──┐
//! │   CLI    │   │ pHash+OCR  │   └────────────┘  │  merge
//! └──────────┘   └─────┬──────┘   ┌────────────┐  ├──────▶ result
//!                      └─────────▶│ Dup. index │──┘
//!                                 │ BK + SQLite│
//!                                 └────────────┘
//! ```
//!
//! Pure logic (hashing, field parsing, the classifier model, the BK-tree)
//! lives in `docsift-core`; this crate adds I/O.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`logging`] | `tracing` subscriber set-up |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_index`] | Persistent duplicate index |
//! | [`ocr`] | Text recognizer backends |
//! | [`extract`] | Image decoding, fingerprinting, preprocessing |
//! | [`pipeline`] | Request orchestration |
//! | [`server`] | HTTP gateway |
//! | [`stats`] | Index statistics |

pub mod config;
pub mod db;
pub mod extract;
pub mod logging;
pub mod migrate;
pub mod ocr;
pub mod pipeline;
pub mod server;
pub mod sqlite_index;
pub mod stats;
