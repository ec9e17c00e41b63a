//! Finding the `usbip` executable.
//!
//! `usbip` ships inside the kernel-specific `linux-tools` package, and the
//! copy on `PATH` is usually a wrapper script that only works when the
//! matching package is installed. Inside a container the host's tools are
//! expected under a mounted prefix (`/hostfs` by default), so the tools
//! tree is searched there first.

use std::collections::HashSet;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use crate::error::MonitorError;
use crate::grammar::parse_kernel_version;

const BINARY_NAME: &str = "usbip";
const TOOLS_DIR: &str = "usr/lib/linux-tools";
const PROC_VERSION: &str = "/proc/version";

/// Default root under which the host's filesystem is mounted.
pub const DEFAULT_HOSTFS_PREFIX: &str = "/hostfs";

#[derive(Debug, Clone)]
pub struct BinaryLocator {
    hostfs_prefix: PathBuf,
    proc_version: PathBuf,
    path_var: Option<OsString>,
}

impl BinaryLocator {
    /// Locator reading the live `/proc/version` and `PATH`.
    pub fn new(hostfs_prefix: impl Into<PathBuf>) -> Self {
        Self {
            hostfs_prefix: hostfs_prefix.into(),
            proc_version: PathBuf::from(PROC_VERSION),
            path_var: std::env::var_os("PATH"),
        }
    }

    pub fn with_proc_version(mut self, path: impl Into<PathBuf>) -> Self {
        self.proc_version = path.into();
        self
    }

    pub fn with_path_var(mut self, path_var: Option<OsString>) -> Self {
        self.path_var = path_var;
        self
    }

    fn tools_root(&self) -> PathBuf {
        self.hostfs_prefix.join(TOOLS_DIR)
    }

    /// Every candidate file, in search order, without duplicates.
    pub fn candidates(&self) -> Vec<PathBuf> {
        let dirs = self
            .kernel_tools_dir()
            .into_iter()
            .chain(self.tools_dirs())
            .chain(self.path_dirs());

        let mut seen = HashSet::new();
        dirs.map(|dir| dir.join(BINARY_NAME))
            .filter(|candidate| seen.insert(candidate.clone()))
            .collect()
    }

    /// The first candidate that exists as a regular file.
    pub fn locate(&self) -> crate::Result<PathBuf> {
        let candidates = self.candidates();
        for candidate in &candidates {
            tracing::trace!(path = %candidate.display(), "Probing for usbip");
            if candidate.is_file() {
                tracing::debug!(path = %candidate.display(), "Found usbip");
                return Ok(candidate.clone());
            }
        }
        Err(MonitorError::ExecutableNotFound(candidates))
    }

    /// `<tools root>/<running kernel release>`, if the release is known.
    fn kernel_tools_dir(&self) -> Option<PathBuf> {
        let raw = match std::fs::read_to_string(&self.proc_version) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::debug!(path = %self.proc_version.display(), error = %e, "Kernel version unavailable");
                return None;
            }
        };

        match parse_kernel_version(&raw) {
            Ok(version) => {
                tracing::debug!(kernel = %version, "Detected running kernel");
                Some(self.tools_root().join(version.to_string()))
            }
            Err(e) => {
                tracing::warn!(error = %e, "Unrecognized kernel version string");
                None
            }
        }
    }

    /// Every directory under the tools root, sorted.
    fn tools_dirs(&self) -> Vec<PathBuf> {
        let root = self.tools_root();
        let entries = match std::fs::read_dir(&root) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::debug!(path = %root.display(), error = %e, "No linux-tools directory");
                return Vec::new();
            }
        };

        let mut dirs: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_dir())
            .collect();
        dirs.sort();
        dirs
    }

    fn path_dirs(&self) -> Vec<PathBuf> {
        let Some(path_var) = &self.path_var else {
            return Vec::new();
        };
        path_var
            .to_string_lossy()
            .split(':')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(PathBuf::from)
            .collect()
    }
}

/// Check a user-supplied executable path.
pub fn check_executable(path: &Path) -> crate::Result<()> {
    if path.is_file() {
        Ok(())
    } else {
        Err(MonitorError::InvalidConfig(format!(
            "--usb-ip-path was set to '{}', but no file exists at this path",
            path.display()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROC_VERSION_AZURE: &str =
        "Linux version 5.4.0-1104-azure (buildd@lcy02-amd64-027) (gcc version 7.5.0) #110 SMP\n";

    fn touch(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, "#!/bin/sh\n").unwrap();
    }

    struct Fixture {
        dir: tempfile::TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                dir: tempfile::tempdir().unwrap(),
            }
        }

        fn hostfs(&self) -> PathBuf {
            self.dir.path().join("hostfs")
        }

        fn proc_version(&self, content: &str) -> PathBuf {
            let path = self.dir.path().join("version");
            std::fs::write(&path, content).unwrap();
            path
        }

        fn tools(&self, release: &str) -> PathBuf {
            self.hostfs().join(TOOLS_DIR).join(release).join(BINARY_NAME)
        }

        fn bin_dir(&self, name: &str) -> PathBuf {
            let dir = self.dir.path().join(name);
            std::fs::create_dir_all(&dir).unwrap();
            dir
        }
    }

    #[test]
    fn test_running_kernel_tools_win() {
        let fx = Fixture::new();
        touch(&fx.tools("5.4.0-1104-azure"));
        touch(&fx.tools("4.15.0-20"));
        let bin = fx.bin_dir("bin");
        touch(&bin.join(BINARY_NAME));

        let locator = BinaryLocator::new(fx.hostfs())
            .with_proc_version(fx.proc_version(PROC_VERSION_AZURE))
            .with_path_var(Some(bin.into_os_string()));

        assert_eq!(locator.locate().unwrap(), fx.tools("5.4.0-1104-azure"));
    }

    #[test]
    fn test_falls_back_to_any_tools_dir_then_path() {
        let fx = Fixture::new();
        touch(&fx.tools("4.15.0-20"));
        let locator = BinaryLocator::new(fx.hostfs())
            .with_proc_version(fx.proc_version(PROC_VERSION_AZURE))
            .with_path_var(None);
        assert_eq!(locator.locate().unwrap(), fx.tools("4.15.0-20"));

        let fx = Fixture::new();
        let empty = fx.bin_dir("empty");
        let bin = fx.bin_dir("bin");
        touch(&bin.join(BINARY_NAME));
        let path_var = format!(" {} :: {}", empty.display(), bin.display());
        let locator = BinaryLocator::new(fx.hostfs())
            .with_proc_version(fx.dir.path().join("missing"))
            .with_path_var(Some(path_var.into()));
        assert_eq!(locator.locate().unwrap(), bin.join(BINARY_NAME));
    }

    #[test]
    fn test_candidates_are_ordered_and_unique() {
        let fx = Fixture::new();
        std::fs::create_dir_all(fx.tools("5.4.0-1104-azure").parent().unwrap()).unwrap();
        std::fs::create_dir_all(fx.tools("4.15.0-20").parent().unwrap()).unwrap();

        let locator = BinaryLocator::new(fx.hostfs())
            .with_proc_version(fx.proc_version(PROC_VERSION_AZURE))
            .with_path_var(Some("/usr/bin:/usr/sbin:/usr/bin".into()));

        assert_eq!(
            locator.candidates(),
            vec![
                fx.tools("5.4.0-1104-azure"),
                fx.tools("4.15.0-20"),
                PathBuf::from("/usr/bin/usbip"),
                PathBuf::from("/usr/sbin/usbip"),
            ]
        );
    }

    #[test]
    fn test_unparseable_kernel_version_is_skipped() {
        let fx = Fixture::new();
        let locator = BinaryLocator::new(fx.hostfs())
            .with_proc_version(fx.proc_version("not a kernel"))
            .with_path_var(Some("/opt/tools".into()));
        assert_eq!(locator.candidates(), vec![PathBuf::from("/opt/tools/usbip")]);
    }

    #[test]
    fn test_not_found_lists_every_candidate() {
        let fx = Fixture::new();
        let locator = BinaryLocator::new(fx.hostfs())
            .with_proc_version(fx.proc_version(PROC_VERSION_AZURE))
            .with_path_var(Some(fx.bin_dir("bin").into_os_string()));

        match locator.locate().unwrap_err() {
            MonitorError::ExecutableNotFound(paths) => {
                assert_eq!(
                    paths,
                    vec![fx.tools("5.4.0-1104-azure"), fx.dir.path().join("bin").join(BINARY_NAME)]
                );
            }
            other => panic!("expected ExecutableNotFound, got {other:?}"),
        }
    }

    #[test]
    fn test_directory_named_usbip_is_not_an_executable() {
        let fx = Fixture::new();
        let bin = fx.bin_dir("bin");
        std::fs::create_dir_all(bin.join(BINARY_NAME)).unwrap();
        let locator = BinaryLocator::new(fx.hostfs())
            .with_proc_version(fx.dir.path().join("missing"))
            .with_path_var(Some(bin.into_os_string()));
        assert!(locator.locate().is_err());
    }

    #[test]
    fn test_check_executable() {
        let fx = Fixture::new();
        let exe = fx.dir.path().join("usbip");
        touch(&exe);
        assert!(check_executable(&exe).is_ok());
        assert!(matches!(
            check_executable(&fx.dir.path().join("nope")),
            Err(MonitorError::InvalidConfig(_))
        ));
    }
}
