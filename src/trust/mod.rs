//! Trust-store provisioning for the runtime layer.
//!
//! Provisioning is three steps, always in this order: refresh the package
//! index, install the trust packages, purge the index cache so it does not
//! end up in the image. Any step failing is a
//! [`StageFailure::TrustProvisioning`]; nothing is retried here.
//!
//! [`AptChroot`] borrows the host resolver config for the duration of the
//! package work and puts the base image's own `etc/resolv.conf` back when the
//! cache is purged.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};

use crate::artifact::filesystem::install_file;
use crate::error::StageFailure;
use crate::recipe::{TrustProviderKind, TrustSpec};

/// In-image location of the CA bundle (Debian layout).
pub const CA_BUNDLE_PATH: &str = "/etc/ssl/certs/ca-certificates.crt";

/// Path prefixes (relative to the rootfs) that trust provisioning may touch.
pub const TRUST_STORE_PREFIXES: &[&str] = &[
    "etc/ssl",
    "etc/ca-certificates",
    "etc/ca-certificates.conf",
    "etc/alternatives",
    "etc/ld.so.cache",
    "usr/share/ca-certificates",
    "usr/lib/ssl",
    "usr/lib/x86_64-linux-gnu",
    "usr/lib/aarch64-linux-gnu",
    "usr/bin/openssl",
    "usr/bin/c_rehash",
    "usr/sbin/update-ca-certificates",
    "usr/share/doc",
    "usr/share/man",
    "usr/share/lintian",
    "usr/share/perl5",
    "var/lib/dpkg",
    "var/lib/apt",
    "var/cache",
    "var/log",
];

/// What a provisioner did, recorded in the image config.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisionReport {
    pub provider: String,
    pub packages: Vec<String>,
}

pub trait TrustProvisioner {
    fn name(&self) -> &'static str;

    fn refresh_index(&self, rootfs: &Path) -> Result<()>;

    /// Install `packages` and return the ones actually installed, which is
    /// what the image config records.
    fn install(&self, rootfs: &Path, packages: &[String]) -> Result<Vec<String>>;

    fn purge_index_cache(&self, rootfs: &Path) -> Result<()>;
}

/// Run the three steps against `rootfs`, tagging any failure with its step.
pub fn provision(
    provisioner: &dyn TrustProvisioner,
    rootfs: &Path,
    packages: &[String],
) -> Result<ProvisionReport> {
    tracing::info!(
        provider = provisioner.name(),
        packages = ?packages,
        "provisioning trust store"
    );
    step("index refresh", || provisioner.refresh_index(rootfs))?;
    let installed = step("package install", || provisioner.install(rootfs, packages))?;
    step("index cache purge", || provisioner.purge_index_cache(rootfs))?;
    Ok(ProvisionReport {
        provider: provisioner.name().to_string(),
        packages: installed,
    })
}

fn step<T>(name: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
    match f() {
        Ok(value) => Ok(value),
        Err(err) if crate::error::failure_class(&err).is_some() => Err(err),
        Err(err) => Err(StageFailure::TrustProvisioning {
            step: name.to_string(),
            reason: format!("{err:#}"),
        }
        .into()),
    }
}

/// Build the provisioner selected by the recipe.
pub fn provisioner_for(spec: &TrustSpec) -> Box<dyn TrustProvisioner> {
    match spec.provider {
        TrustProviderKind::Apt => Box::new(AptChroot::default()),
        TrustProviderKind::HostBundle => Box::new(HostBundle {
            bundle: spec.host_bundle.clone(),
        }),
    }
}

const RESOLV_CONF: &str = "etc/resolv.conf";
const RESOLV_CONF_SAVED: &str = "etc/resolv.conf.ord-image-saved";

/// `apt-get` executed inside the rootfs with `chroot`. Requires root.
#[derive(Debug, Clone)]
pub struct AptChroot {
    pub chroot: PathBuf,
    /// Resolver config copied into the rootfs while apt talks to mirrors.
    pub host_resolv_conf: PathBuf,
}

impl Default for AptChroot {
    fn default() -> Self {
        Self {
            chroot: PathBuf::from("chroot"),
            host_resolv_conf: PathBuf::from("/etc/resolv.conf"),
        }
    }
}

impl AptChroot {
    /// Move the base's resolv.conf aside and put the host's in its place.
    ///
    /// The base entry is renamed, never written through: it is often a
    /// symlink into `/run` that would resolve against the host.
    fn stage_resolv_conf(&self, rootfs: &Path) -> Result<()> {
        let target = rootfs.join(RESOLV_CONF);
        let saved = rootfs.join(RESOLV_CONF_SAVED);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating '{}'", parent.display()))?;
        }
        if fs::symlink_metadata(&target).is_ok() {
            fs::rename(&target, &saved)
                .with_context(|| format!("moving aside '{}'", target.display()))?;
        }
        if let Err(err) = fs::copy(&self.host_resolv_conf, &target) {
            restore_resolv_conf(rootfs)?;
            return Err(err).with_context(|| {
                format!(
                    "copying host resolv.conf '{}' into '{}'",
                    self.host_resolv_conf.display(),
                    target.display()
                )
            });
        }
        Ok(())
    }

    fn run(&self, rootfs: &Path, args: &[&str]) -> Result<()> {
        tracing::debug!(rootfs = %rootfs.display(), args = ?args, "chroot apt-get");
        let output = Command::new(&self.chroot)
            .arg(rootfs)
            .arg("apt-get")
            .args(args)
            .env("DEBIAN_FRONTEND", "noninteractive")
            .output()
            .with_context(|| format!("spawning '{}'", self.chroot.display()))?;

        if output.status.success() {
            return Ok(());
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!(
            "apt-get {} exited with {}: {}\n{}",
            args.join(" "),
            output.status,
            stdout.trim(),
            stderr.trim()
        )
    }
}

impl TrustProvisioner for AptChroot {
    fn name(&self) -> &'static str {
        TrustProviderKind::Apt.as_str()
    }

    fn refresh_index(&self, rootfs: &Path) -> Result<()> {
        self.stage_resolv_conf(rootfs)?;
        if let Err(err) = self.run(rootfs, &["update"]) {
            restore_resolv_conf(rootfs)?;
            return Err(err);
        }
        Ok(())
    }

    fn install(&self, rootfs: &Path, packages: &[String]) -> Result<Vec<String>> {
        if packages.is_empty() {
            return Ok(Vec::new());
        }
        let mut args = vec!["install", "-y", "--no-install-recommends"];
        args.extend(packages.iter().map(String::as_str));
        if let Err(err) = self.run(rootfs, &args) {
            restore_resolv_conf(rootfs)?;
            return Err(err);
        }
        Ok(packages.to_vec())
    }

    fn purge_index_cache(&self, rootfs: &Path) -> Result<()> {
        purge_lists(rootfs)?;
        restore_resolv_conf(rootfs)
    }
}

/// Drop the staged host resolv.conf and bring back whatever the base had.
fn restore_resolv_conf(rootfs: &Path) -> Result<()> {
    let target = rootfs.join(RESOLV_CONF);
    let saved = rootfs.join(RESOLV_CONF_SAVED);
    if fs::symlink_metadata(&target).is_ok() {
        fs::remove_file(&target).with_context(|| format!("removing '{}'", target.display()))?;
    }
    if fs::symlink_metadata(&saved).is_ok() {
        fs::rename(&saved, &target)
            .with_context(|| format!("restoring '{}'", target.display()))?;
    }
    Ok(())
}

fn purge_lists(rootfs: &Path) -> Result<()> {
    let lists = rootfs.join("var/lib/apt/lists");
    if !lists.is_dir() {
        return Ok(());
    }
    for entry in fs::read_dir(&lists).with_context(|| format!("reading '{}'", lists.display()))? {
        let path = entry?.path();
        let removed = if path.is_dir() && !path.is_symlink() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        removed.with_context(|| format!("removing '{}'", path.display()))?;
    }
    Ok(())
}

/// Copy the host's CA bundle into the rootfs. No package index involved.
#[derive(Debug, Clone)]
pub struct HostBundle {
    pub bundle: PathBuf,
}

impl TrustProvisioner for HostBundle {
    fn name(&self) -> &'static str {
        TrustProviderKind::HostBundle.as_str()
    }

    fn refresh_index(&self, _rootfs: &Path) -> Result<()> {
        Ok(())
    }

    /// Installs no packages, only the bundle file.
    fn install(&self, rootfs: &Path, _packages: &[String]) -> Result<Vec<String>> {
        if !self.bundle.is_file() {
            anyhow::bail!("host CA bundle not found: {}", self.bundle.display());
        }
        let contents = fs::read(&self.bundle)
            .with_context(|| format!("reading '{}'", self.bundle.display()))?;
        if !contents
            .windows(b"BEGIN CERTIFICATE".len())
            .any(|w| w == b"BEGIN CERTIFICATE")
        {
            anyhow::bail!(
                "host CA bundle '{}' contains no PEM certificates",
                self.bundle.display()
            );
        }
        install_file(&self.bundle, rootfs, CA_BUNDLE_PATH, 0o644)?;
        Ok(Vec::new())
    }

    fn purge_index_cache(&self, _rootfs: &Path) -> Result<()> {
        Ok(())
    }
}

/// True when `rel` (rootfs-relative) lies under one of the trust-store prefixes.
pub fn is_trust_store_path(rel: &str) -> bool {
    TRUST_STORE_PREFIXES
        .iter()
        .any(|prefix| rel == *prefix || rel.starts_with(&format!("{prefix}/")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    const PEM: &str = "-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----\n";

    #[derive(Default)]
    struct Recorder {
        calls: RefCell<Vec<&'static str>>,
        fail_on: Option<&'static str>,
    }

    impl Recorder {
        fn record(&self, call: &'static str) -> Result<()> {
            self.calls.borrow_mut().push(call);
            if self.fail_on == Some(call) {
                anyhow::bail!("Temporary failure resolving 'deb.debian.org'");
            }
            Ok(())
        }
    }

    impl TrustProvisioner for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }

        fn refresh_index(&self, _rootfs: &Path) -> Result<()> {
            self.record("refresh")
        }

        fn install(&self, _rootfs: &Path, packages: &[String]) -> Result<Vec<String>> {
            self.record("install")?;
            Ok(packages.to_vec())
        }

        fn purge_index_cache(&self, _rootfs: &Path) -> Result<()> {
            self.record("purge")
        }
    }

    /// A `chroot` stand-in that logs its arguments, shows what resolv.conf
    /// apt would see during `update`, and exits 100 on the `fail_on` verb.
    fn fake_chroot(dir: &Path, fail_on: &str) -> (PathBuf, PathBuf) {
        let log = dir.join("chroot.log");
        let script = dir.join("chroot");
        fs::write(
            &script,
            format!(
                r#"#!/bin/sh
root="$1"
shift
echo "$*" >> "{log}"
if [ "$2" = "update" ]; then
    cat "$root/etc/resolv.conf" >> "{log}"
    mkdir -p "$root/var/lib/apt/lists/partial"
    echo index > "$root/var/lib/apt/lists/InRelease"
fi
if [ "$2" = "{fail_on}" ]; then
    echo "E: simulated $2 failure" >&2
    exit 100
fi
"#,
                log = log.display()
            ),
        )
        .unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        (script, log)
    }

    fn apt_fixture(tmp: &TempDir, fail_on: &str) -> (AptChroot, PathBuf, PathBuf) {
        let (chroot, log) = fake_chroot(tmp.path(), fail_on);
        let host_resolv_conf = tmp.path().join("host-resolv.conf");
        fs::write(&host_resolv_conf, "nameserver 192.0.2.53\n").unwrap();
        let rootfs = tmp.path().join("rootfs");
        fs::create_dir_all(rootfs.join("etc")).unwrap();
        fs::write(rootfs.join("etc/resolv.conf"), "").unwrap();
        (
            AptChroot {
                chroot,
                host_resolv_conf,
            },
            rootfs,
            log,
        )
    }

    fn packages() -> Vec<String> {
        vec!["openssl".into(), "ca-certificates".into()]
    }

    #[test]
    fn steps_run_in_order() {
        let tmp = TempDir::new().unwrap();
        let recorder = Recorder::default();
        let report = provision(&recorder, tmp.path(), &["ca-certificates".into()]).unwrap();

        assert_eq!(*recorder.calls.borrow(), vec!["refresh", "install", "purge"]);
        assert_eq!(report.packages, vec!["ca-certificates".to_string()]);
    }

    #[test]
    fn failure_stops_and_is_classified() {
        let tmp = TempDir::new().unwrap();
        let recorder = Recorder {
            fail_on: Some("refresh"),
            ..Default::default()
        };
        let err = provision(&recorder, tmp.path(), &[]).unwrap_err();

        assert_eq!(*recorder.calls.borrow(), vec!["refresh"]);
        let class = crate::error::failure_class(&err).unwrap();
        assert_eq!(class.class(), "trust_provisioning");
        assert!(err.to_string().contains("index refresh"));
    }

    #[test]
    fn install_and_purge_failures_name_their_step() {
        for (fail_on, step_name, calls) in [
            ("install", "package install", vec!["refresh", "install"]),
            ("purge", "index cache purge", vec!["refresh", "install", "purge"]),
        ] {
            let tmp = TempDir::new().unwrap();
            let recorder = Recorder {
                fail_on: Some(fail_on),
                ..Default::default()
            };
            let err = provision(&recorder, tmp.path(), &packages()).unwrap_err();

            assert_eq!(*recorder.calls.borrow(), calls);
            assert_eq!(
                crate::error::failure_class(&err).unwrap().class(),
                "trust_provisioning"
            );
            assert!(err.to_string().contains(step_name), "{err}");
        }
    }

    #[test]
    fn apt_runs_apt_get_inside_rootfs() {
        let tmp = TempDir::new().unwrap();
        let (apt, rootfs, log) = apt_fixture(&tmp, "");

        let report = provision(&apt, &rootfs, &packages()).unwrap();

        assert_eq!(report.provider, "apt");
        assert_eq!(report.packages, packages());
        let log = fs::read_to_string(log).unwrap();
        let lines: Vec<&str> = log.lines().collect();
        assert_eq!(
            lines,
            vec![
                "apt-get update",
                "nameserver 192.0.2.53",
                "apt-get install -y --no-install-recommends openssl ca-certificates",
            ]
        );
    }

    #[test]
    fn apt_restores_base_resolv_conf() {
        let tmp = TempDir::new().unwrap();
        let (apt, rootfs, _log) = apt_fixture(&tmp, "");

        provision(&apt, &rootfs, &packages()).unwrap();

        assert_eq!(fs::read_to_string(rootfs.join("etc/resolv.conf")).unwrap(), "");
        assert!(!rootfs.join(RESOLV_CONF_SAVED).exists());
        let lists = rootfs.join("var/lib/apt/lists");
        assert_eq!(fs::read_dir(lists).unwrap().count(), 0);
    }

    #[test]
    fn apt_removes_resolv_conf_the_base_lacked() {
        let tmp = TempDir::new().unwrap();
        let (apt, rootfs, log) = apt_fixture(&tmp, "");
        fs::remove_file(rootfs.join("etc/resolv.conf")).unwrap();

        provision(&apt, &rootfs, &packages()).unwrap();

        assert!(fs::read_to_string(log).unwrap().contains("nameserver 192.0.2.53"));
        assert!(fs::symlink_metadata(rootfs.join("etc/resolv.conf")).is_err());
    }

    #[test]
    fn apt_symlinked_resolv_conf_is_not_followed() {
        let tmp = TempDir::new().unwrap();
        let (apt, rootfs, _log) = apt_fixture(&tmp, "");
        let outside = tmp.path().join("outside.conf");
        fs::write(&outside, "untouched\n").unwrap();
        fs::remove_file(rootfs.join("etc/resolv.conf")).unwrap();
        std::os::unix::fs::symlink(&outside, rootfs.join("etc/resolv.conf")).unwrap();

        provision(&apt, &rootfs, &packages()).unwrap();

        assert_eq!(fs::read_to_string(&outside).unwrap(), "untouched\n");
        assert_eq!(
            fs::read_link(rootfs.join("etc/resolv.conf")).unwrap(),
            outside
        );
    }

    #[test]
    fn apt_install_failure_is_classified_and_cleaned_up() {
        let tmp = TempDir::new().unwrap();
        let (apt, rootfs, _log) = apt_fixture(&tmp, "install");

        let err = provision(&apt, &rootfs, &packages()).unwrap_err();

        assert_eq!(
            crate::error::failure_class(&err).unwrap().class(),
            "trust_provisioning"
        );
        let msg = format!("{err:#}");
        assert!(msg.contains("package install"), "{msg}");
        assert!(msg.contains("simulated install failure"), "{msg}");
        assert_eq!(fs::read_to_string(rootfs.join("etc/resolv.conf")).unwrap(), "");
    }

    #[test]
    fn apt_update_failure_stops_before_install() {
        let tmp = TempDir::new().unwrap();
        let (apt, rootfs, log) = apt_fixture(&tmp, "update");

        let err = provision(&apt, &rootfs, &packages()).unwrap_err();

        assert!(format!("{err:#}").contains("index refresh"));
        assert!(!fs::read_to_string(log).unwrap().contains("install"));
        assert_eq!(fs::read_to_string(rootfs.join("etc/resolv.conf")).unwrap(), "");
    }

    #[test]
    fn host_bundle_installs_pem_and_no_packages() {
        let tmp = TempDir::new().unwrap();
        let bundle = tmp.path().join("bundle.pem");
        fs::write(&bundle, PEM).unwrap();
        let rootfs = tmp.path().join("rootfs");
        fs::create_dir_all(&rootfs).unwrap();

        let provider = HostBundle { bundle };
        let report = provision(&provider, &rootfs, &packages()).unwrap();

        assert!(report.packages.is_empty());
        let installed = rootfs.join("etc/ssl/certs/ca-certificates.crt");
        assert_eq!(fs::read_to_string(installed).unwrap(), PEM);
        assert!(!rootfs.join("var/lib/dpkg/status").exists());
    }

    #[test]
    fn host_bundle_missing_is_fatal() {
        let tmp = TempDir::new().unwrap();
        let provider = HostBundle {
            bundle: tmp.path().join("absent.pem"),
        };
        let err = provision(&provider, tmp.path(), &[]).unwrap_err();
        assert_eq!(
            crate::error::failure_class(&err).unwrap().class(),
            "trust_provisioning"
        );
    }

    #[test]
    fn trust_prefixes() {
        assert!(is_trust_store_path("etc/ssl/certs/ca-certificates.crt"));
        assert!(is_trust_store_path("var/lib/dpkg/status"));
        assert!(!is_trust_store_path("usr/src/ord/Cargo.toml"));
        assert!(!is_trust_store_path("etc/sslx"));
    }
}
