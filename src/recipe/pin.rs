//! Pinned base references for both stages.
//!
//! A reference must name an exact version. Floating channels would make two
//! builds of the same source resolve different environments, so they are
//! rejected while the recipe is loaded.

use std::fmt;
use std::path::PathBuf;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::error::StageFailure;

/// Name of the empty runtime base.
pub const SCRATCH: &str = "scratch";

const FLOATING_TAGS: &[&str] = &["", "latest", "stable", "beta", "nightly", "edge", "current"];

/// Rust toolchain channel used by the builder stage (`cargo +<channel>`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ToolchainRef(String);

impl ToolchainRef {
    pub fn parse(raw: &str) -> Result<Self> {
        let channel = raw.trim();
        if FLOATING_TAGS.contains(&channel) {
            return Err(StageFailure::Recipe(format!(
                "builder toolchain '{}' is floating; pin an exact version such as '1.76.0'",
                raw
            ))
            .into());
        }

        if let Some(date) = channel
            .strip_prefix("nightly-")
            .or_else(|| channel.strip_prefix("beta-"))
        {
            if !is_iso_date(date) {
                return Err(StageFailure::Recipe(format!(
                    "builder toolchain '{}' must carry a YYYY-MM-DD date",
                    raw
                ))
                .into());
            }
            return Ok(Self(channel.to_string()));
        }

        let parts: Vec<&str> = channel.split('.').collect();
        let numeric = parts.len() >= 2
            && parts.len() <= 3
            && parts
                .iter()
                .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()));
        if !numeric {
            return Err(StageFailure::Recipe(format!(
                "builder toolchain '{}' is not a pinned release (expected MAJOR.MINOR[.PATCH] or nightly-YYYY-MM-DD)",
                raw
            ))
            .into());
        }
        Ok(Self(channel.to_string()))
    }

    pub fn channel(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ToolchainRef {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<ToolchainRef> for String {
    fn from(value: ToolchainRef) -> Self {
        value.0
    }
}

impl fmt::Display for ToolchainRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rust:{}", self.0)
    }
}

/// Minimal OS rootfs the runtime stage starts from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BaseImageRef {
    pub name: String,
    #[serde(default)]
    pub version: String,
    /// Rootfs archive (`.tar` or `.tar.zst`). Absent only for `scratch`.
    #[serde(default)]
    pub archive: Option<PathBuf>,
    #[serde(default)]
    pub sha256: Option<String>,
}

impl BaseImageRef {
    pub fn scratch() -> Self {
        Self {
            name: SCRATCH.to_string(),
            version: String::new(),
            archive: None,
            sha256: None,
        }
    }

    pub fn is_scratch(&self) -> bool {
        self.name == SCRATCH
    }

    /// Check the pinning invariant.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(StageFailure::Recipe("runtime base name must not be empty".into()).into());
        }

        if self.is_scratch() {
            if self.archive.is_some() {
                return Err(StageFailure::Recipe(
                    "runtime base 'scratch' must not reference an archive".into(),
                )
                .into());
            }
            return Ok(());
        }

        if FLOATING_TAGS.contains(&self.version.trim()) {
            return Err(StageFailure::Recipe(format!(
                "runtime base '{}' has floating version '{}'; pin an exact version",
                self.name, self.version
            ))
            .into());
        }

        if self.archive.is_none() {
            return Err(StageFailure::Recipe(format!(
                "runtime base '{}' needs an 'archive' rootfs path",
                self
            ))
            .into());
        }

        match self.sha256.as_deref() {
            Some(sha) if is_hex_64(sha) => Ok(()),
            Some(sha) => Err(StageFailure::Recipe(format!(
                "runtime base '{}' has malformed sha256 '{}'",
                self, sha
            ))
            .into()),
            None => Err(StageFailure::Recipe(format!(
                "runtime base '{}' must pin the archive with 'sha256'",
                self
            ))
            .into()),
        }
    }
}

impl fmt::Display for BaseImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_scratch() {
            return write!(f, "{}", SCRATCH);
        }
        write!(f, "{}:{}", self.name, self.version)?;
        if let Some(sha) = &self.sha256 {
            let short: String = sha.chars().take(12).collect();
            write!(f, "@sha256:{}", short)?;
        }
        Ok(())
    }
}

pub(crate) fn is_hex_64(s: &str) -> bool {
    s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit())
}

fn is_iso_date(s: &str) -> bool {
    let b = s.as_bytes();
    b.len() == 10
        && b[4] == b'-'
        && b[7] == b'-'
        && b.iter()
            .enumerate()
            .all(|(i, c)| i == 4 || i == 7 || c.is_ascii_digit())
}
