//! Image recipe: the `Image.toml` file describing both pipeline stages.
//!
//! The on-disk format is parsed into private `*Toml` structs with
//! `deny_unknown_fields`, then resolved into [`ImageRecipe`] with defaults
//! applied, paths made absolute and every pinning rule checked. Code past this
//! module never sees an unvalidated value.

pub mod pin;

use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::error::StageFailure;
pub use pin::{BaseImageRef, ToolchainRef};

pub const RECIPE_FILENAME: &str = "Image.toml";

pub const DEFAULT_IMAGE_NAME: &str = "ord";
pub const DEFAULT_MOUNT: &str = "/usr/src/ord";
pub const DEFAULT_BIN: &str = "ord";
pub const DEFAULT_FEATURES: &[&str] = &["rollback"];
pub const DEFAULT_EXCLUDE: &[&str] = &["target", ".git"];
pub const DEFAULT_INSTALL_PATH: &str = "/usr/local/bin/ord";
pub const DEFAULT_TRUST_PACKAGES: &[&str] = &["openssl", "ca-certificates"];
pub const DEFAULT_HOST_BUNDLE: &str = "/etc/ssl/certs/ca-certificates.crt";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RecipeToml {
    image: Option<ImageToml>,
    builder: BuilderToml,
    runtime: RuntimeToml,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ImageToml {
    name: Option<String>,
    tag: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct BuilderToml {
    toolchain: String,
    source: Option<String>,
    mount: Option<String>,
    bin: Option<String>,
    features: Option<Vec<String>>,
    locked: Option<bool>,
    exclude: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuntimeToml {
    base: BaseImageRef,
    copy_from: Option<String>,
    install_path: Option<String>,
    trust: Option<TrustToml>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TrustToml {
    provider: Option<String>,
    packages: Option<Vec<String>>,
    host_bundle: Option<String>,
}

/// Fully resolved recipe.
#[derive(Debug, Clone)]
pub struct ImageRecipe {
    /// Directory holding the recipe; relative paths resolve against it.
    pub recipe_dir: PathBuf,
    pub name: String,
    pub tag: String,
    pub builder: BuilderSpec,
    pub runtime: RuntimeSpec,
}

#[derive(Debug, Clone)]
pub struct BuilderSpec {
    pub toolchain: ToolchainRef,
    pub source_dir: PathBuf,
    /// Absolute mount point of the source snapshot inside the builder layer.
    pub mount: String,
    pub bin: String,
    pub features: FeatureSet,
    pub locked: bool,
    pub exclude: Vec<String>,
}

impl BuilderSpec {
    /// Deterministic artifact path inside the builder layer.
    pub fn output_layer_path(&self) -> String {
        format!("{}/target/release/{}", self.mount, self.bin)
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeSpec {
    pub base: BaseImageRef,
    /// Builder-layer path the runtime stage imports from.
    pub copy_from: String,
    /// Fixed installation path of the artifact in the runtime image.
    pub install_path: String,
    pub trust: TrustSpec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustProviderKind {
    /// `apt-get` inside the rootfs via chroot.
    Apt,
    /// Copy a CA bundle file from the host.
    HostBundle,
}

impl TrustProviderKind {
    fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "apt" => Ok(Self::Apt),
            "host-bundle" | "host_bundle" => Ok(Self::HostBundle),
            other => Err(StageFailure::Recipe(format!(
                "unsupported trust provider '{}' (expected 'apt' or 'host-bundle')",
                other
            ))
            .into()),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Apt => "apt",
            Self::HostBundle => "host-bundle",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrustSpec {
    pub provider: TrustProviderKind,
    /// Package names, optionally apt-pinned as `name=version`.
    pub packages: Vec<String>,
    pub host_bundle: PathBuf,
}

/// Ordered, deduplicated set of cargo feature names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeatureSet(Vec<String>);

impl FeatureSet {
    pub fn new<I, S>(names: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut out: Vec<String> = Vec::new();
        for name in names {
            let name = name.as_ref().trim();
            if name.is_empty() {
                return Err(StageFailure::Recipe("feature names must not be empty".into()).into());
            }
            let valid = name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '+' | '.' | '/'));
            if !valid {
                return Err(
                    StageFailure::Recipe(format!("invalid feature name '{}'", name)).into(),
                );
            }
            if !out.iter().any(|existing| existing == name) {
                out.push(name.to_string());
            }
        }
        Ok(Self(out))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// Value for `cargo build --features`.
    pub fn to_cli_arg(&self) -> String {
        self.0.join(",")
    }
}

/// Load and resolve a recipe file.
pub fn load_recipe(path: &Path) -> Result<ImageRecipe> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading image recipe '{}'", path.display()))?;
    let recipe_dir = path
        .parent()
        .map(Path::to_path_buf)
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from("."));
    let recipe_dir = fs::canonicalize(&recipe_dir)
        .with_context(|| format!("resolving recipe directory '{}'", recipe_dir.display()))?;
    ImageRecipe::from_toml_str(&text, &recipe_dir)
        .with_context(|| format!("loading image recipe '{}'", path.display()))
}

/// Resolve the recipe path given on the command line, defaulting to
/// `./Image.toml`. A directory argument means `<dir>/Image.toml`.
pub fn resolve_recipe_path(arg: Option<&str>) -> Result<PathBuf> {
    let path = match arg {
        Some(raw) => PathBuf::from(raw),
        None => std::env::current_dir()
            .context("resolving current directory")?
            .join(RECIPE_FILENAME),
    };
    if path.is_dir() {
        return Ok(path.join(RECIPE_FILENAME));
    }
    Ok(path)
}

impl ImageRecipe {
    pub fn from_toml_str(text: &str, recipe_dir: &Path) -> Result<Self> {
        let parsed: RecipeToml = toml::from_str(text).context("parsing recipe TOML")?;

        let image = parsed.image.unwrap_or(ImageToml {
            name: None,
            tag: None,
        });
        let name = image
            .name
            .map(|n| n.trim().to_string())
            .unwrap_or_else(|| DEFAULT_IMAGE_NAME.to_string());
        validate_segment(&name, "image.name")?;
        let tag = image
            .tag
            .map(|t| t.trim().to_string())
            .unwrap_or_else(|| default_tag(&name));
        validate_tag(&tag)?;

        let builder = parsed.builder;
        let toolchain = ToolchainRef::parse(&builder.toolchain)?;
        let source_dir = resolve_path(recipe_dir, builder.source.as_deref().unwrap_or("."));
        let mount = normalize_abs_path(
            builder.mount.as_deref().unwrap_or(DEFAULT_MOUNT),
            "builder.mount",
        )?;
        let bin = builder
            .bin
            .map(|b| b.trim().to_string())
            .unwrap_or_else(|| DEFAULT_BIN.to_string());
        validate_segment(&bin, "builder.bin")?;
        let features = match builder.features {
            Some(list) => FeatureSet::new(list)?,
            None => FeatureSet::new(DEFAULT_FEATURES)?,
        };
        let exclude = builder
            .exclude
            .unwrap_or_else(|| DEFAULT_EXCLUDE.iter().map(|s| s.to_string()).collect());
        for pattern in &exclude {
            validate_relative(pattern, "builder.exclude")?;
        }

        let builder = BuilderSpec {
            toolchain,
            source_dir,
            mount,
            bin,
            features,
            locked: builder.locked.unwrap_or(false),
            exclude,
        };

        let runtime = parsed.runtime;
        let mut base = runtime.base;
        base.validate()?;
        base.archive = base
            .archive
            .map(|archive| resolve_path(recipe_dir, &archive.to_string_lossy()));

        let copy_from = match runtime.copy_from {
            Some(raw) => normalize_abs_path(&raw, "runtime.copy_from")?,
            None => builder.output_layer_path(),
        };
        let install_path = normalize_abs_path(
            runtime
                .install_path
                .as_deref()
                .unwrap_or(DEFAULT_INSTALL_PATH),
            "runtime.install_path",
        )?;
        if install_path == "/" {
            return Err(StageFailure::Recipe(
                "runtime.install_path must name a file, not '/'".into(),
            )
            .into());
        }

        let trust = runtime.trust.unwrap_or(TrustToml {
            provider: None,
            packages: None,
            host_bundle: None,
        });
        let provider = TrustProviderKind::parse(trust.provider.as_deref().unwrap_or("apt"))?;
        let packages = trust
            .packages
            .unwrap_or_else(|| DEFAULT_TRUST_PACKAGES.iter().map(|s| s.to_string()).collect())
            .into_iter()
            .map(|p| p.trim().to_string())
            .collect::<Vec<_>>();
        for package in &packages {
            validate_package(package)?;
        }
        let host_bundle = resolve_path(
            recipe_dir,
            trust.host_bundle.as_deref().unwrap_or(DEFAULT_HOST_BUNDLE),
        );

        Ok(Self {
            recipe_dir: recipe_dir.to_path_buf(),
            name,
            tag,
            builder,
            runtime: RuntimeSpec {
                base,
                copy_from,
                install_path,
                trust: TrustSpec {
                    provider,
                    packages,
                    host_bundle,
                },
            },
        })
    }

    /// Store root for this recipe: `ORD_IMAGE_STORE` or `<recipe dir>/.artifacts`.
    pub fn store_root(&self) -> PathBuf {
        match std::env::var_os("ORD_IMAGE_STORE") {
            Some(root) if !root.is_empty() => PathBuf::from(root),
            _ => self
                .recipe_dir
                .join(crate::artifact_store::DEFAULT_STORE_DIR),
        }
    }
}

pub fn default_tag(name: &str) -> String {
    format!("{name}:latest-build")
}

pub(crate) fn validate_tag(tag: &str) -> Result<()> {
    if tag.is_empty() || tag.contains('/') || tag.contains('\\') || tag.contains("..") {
        return Err(StageFailure::Recipe(format!(
            "image tag '{}' must be a non-empty name without path separators",
            tag
        ))
        .into());
    }
    if tag.chars().any(char::is_whitespace) {
        return Err(StageFailure::Recipe(format!("image tag '{}' contains whitespace", tag)).into());
    }
    Ok(())
}

fn validate_segment(value: &str, field: &str) -> Result<()> {
    if value.is_empty() || value.contains('/') || value.contains('\\') || value == ".." {
        return Err(StageFailure::Recipe(format!(
            "{field} must be a plain name, got '{}'",
            value
        ))
        .into());
    }
    Ok(())
}

fn validate_relative(raw: &str, field: &str) -> Result<()> {
    let candidate = Path::new(raw);
    if raw.is_empty() || candidate.is_absolute() {
        return Err(StageFailure::Recipe(format!(
            "{field} entries must be relative, got '{}'",
            raw
        ))
        .into());
    }
    if candidate
        .components()
        .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
    {
        return Err(StageFailure::Recipe(format!(
            "{field} entry '{}' contains a traversal component",
            raw
        ))
        .into());
    }
    Ok(())
}

fn validate_package(package: &str) -> Result<()> {
    let name = package.split('=').next().unwrap_or_default();
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '+' | '.'));
    if !valid || package.matches('=').count() > 1 {
        return Err(
            StageFailure::Recipe(format!("invalid trust package '{}'", package)).into(),
        );
    }
    Ok(())
}

/// Normalize an absolute path inside an image: no `..`, no `.`, no trailing `/`.
pub(crate) fn normalize_abs_path(raw: &str, field: &str) -> Result<String> {
    let candidate = Path::new(raw.trim());
    if !candidate.is_absolute() {
        return Err(StageFailure::Recipe(format!(
            "{field} must be absolute, got '{}'",
            raw
        ))
        .into());
    }
    let mut parts = Vec::new();
    for component in candidate.components() {
        match component {
            Component::RootDir | Component::CurDir => {}
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::ParentDir | Component::Prefix(_) => {
                return Err(StageFailure::Recipe(format!(
                    "{field} contains a traversal component in '{}'",
                    raw
                ))
                .into())
            }
        }
    }
    Ok(format!("/{}", parts.join("/")))
}

/// Resolve a recipe path: `~/` expands to the home directory, relative paths
/// are taken from the recipe directory.
pub(crate) fn resolve_path(recipe_dir: &Path, raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    let candidate = Path::new(raw);
    if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        recipe_dir.join(candidate)
    }
}
