//! The two build stages. Each runs in its own private layer directory; the
//! only thing that crosses from one to the other is an [`s00_builder::ArtifactRef`].

pub mod s00_builder;
pub mod s01_runtime;
