//! Preflight checks for build validation.
//!
//! Validates that the host has the tools the selected collaborators shell out
//! to, so a run fails before it allocates a run directory instead of halfway
//! through a stage.

use anyhow::{bail, Result};

use crate::recipe::{ImageRecipe, TrustProviderKind};

/// Tools `CargoToolchain` needs. Each tuple is (command_name, hint).
pub const CARGO_TOOLS: &[(&str, &str)] = &[
    ("cargo", "install rustup from https://rustup.rs"),
    ("rustup", "install rustup from https://rustup.rs"),
];

/// Tools the `apt` trust provider needs.
pub const APT_TOOLS: &[(&str, &str)] = &[("chroot", "coreutils")];

/// Check if a command exists on the host system.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Check that specific tools are available.
///
/// Returns an error listing every missing tool with its install hint.
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let missing: Vec<_> = tools
        .iter()
        .filter(|(tool, _)| !command_exists(tool))
        .collect();

    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(t, p)| format!("  {} ({})", t, p))
            .collect::<Vec<_>>()
            .join("\n");
        bail!("Missing required host tools:\n{}", msg);
    }

    Ok(())
}

/// `chroot` needs root.
pub fn running_as_root() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

/// Everything a real (non-stubbed) run of `recipe` needs from the host.
pub fn check_for_recipe(recipe: &ImageRecipe) -> Result<()> {
    check_required_tools(CARGO_TOOLS)?;

    match recipe.runtime.trust.provider {
        TrustProviderKind::Apt => {
            check_required_tools(APT_TOOLS)?;
            if !running_as_root() {
                bail!("trust provider 'apt' runs apt-get through chroot and requires root");
            }
            if recipe.runtime.base.is_scratch() {
                bail!("trust provider 'apt' needs a base rootfs with apt-get; 'scratch' has none");
            }
        }
        TrustProviderKind::HostBundle => {
            let bundle = &recipe.runtime.trust.host_bundle;
            if !bundle.is_file() {
                bail!("host CA bundle not found: {}", bundle.display());
            }
        }
    }

    if !recipe.builder.source_dir.join("Cargo.toml").is_file() {
        bail!(
            "source directory '{}' has no Cargo.toml",
            recipe.builder.source_dir.display()
        );
    }
    Ok(())
}
