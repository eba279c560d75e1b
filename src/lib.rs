//! Two-stage build-and-release pipeline for the `ord` executable.
//!
//! A heavy builder stage compiles a source snapshot with a pinned Rust
//! toolchain. A minimal runtime stage takes exactly one artifact from it
//! (the executable), adds a CA trust store and publishes an image whose
//! default process is that executable.
//!
//! # Architecture
//!
//! ```text
//! Image.toml ──> recipe ──> pipeline
//!                              │
//!                              ├── stages::s00_builder   snapshot + Toolchain::compile
//!                              │        │
//!                              │        └── ArtifactRef (sha256 in artifact_store)
//!                              │
//!                              └── stages::s01_runtime   base rootfs + artifact + trust
//!                                       │
//!                                       └── image tag (committed last)
//! ```
//!
//! Each stage works in a private layer directory under the run directory.
//! The builder layer is never visible to the runtime stage; the handoff is a
//! content hash resolved through the store. A failure in either stage leaves
//! the previously published tag untouched.
//!
//! # Example
//!
//! ```rust,ignore
//! use ord_image::{load_recipe, BuildOptions, Pipeline};
//!
//! let recipe = load_recipe("Image.toml".as_ref())?;
//! let outcome = Pipeline::new(recipe)?.run(&BuildOptions::default())?;
//! println!("{} -> {}", outcome.image.tag, outcome.image.sha256);
//! ```

pub mod artifact;
pub mod artifact_store;
pub mod error;
pub mod image;
pub mod pipeline;
pub mod preflight;
pub mod recipe;
pub mod snapshot;
pub mod stage_runs;
pub mod stages;
pub mod toolchain;
pub mod trust;
pub mod verify;

pub use artifact_store::ArtifactStore;
pub use error::{failure_class, StageFailure};
pub use image::{ImageConfig, RuntimeImage};
pub use pipeline::{BuildOptions, Pipeline, PipelineOutcome};
pub use recipe::{load_recipe, resolve_recipe_path, ImageRecipe};
pub use stages::s00_builder::ArtifactRef;
pub use toolchain::{CargoToolchain, Toolchain};
pub use trust::{AptChroot, HostBundle, TrustProvisioner};
pub use verify::{verify_image, VerifyReport};
