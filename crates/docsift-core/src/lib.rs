//! # docsift Core
//!
//! Shared, I/O-free logic for docsift: the data model, perceptual
//! fingerprinting, field parsers, the classifier model, and the duplicate
//! index abstraction.
//!
//! This crate contains no tokio, sqlx, image decoding, or filesystem I/O.
//! Everything here is a pure function of its inputs plus explicitly
//! constructed model state, which keeps it trivially testable.

pub mod classifier;
pub mod error;
pub mod fields;
pub mod fingerprint;
pub mod index;
pub mod models;
