//! Layer-level building blocks used by both stages.
//!
//! - [`filesystem`] - In-layer path mapping, file install, cleanup
//! - [`layer`] - Deterministic `tar.zst` packing, extraction and listing

pub mod filesystem;
pub mod layer;
