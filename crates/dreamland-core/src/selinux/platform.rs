//! Platform SELinux query capability.
//!
//! The platform API is an optional capability: some OS builds do not expose
//! it at all, and the ones that do may refuse individual queries. Every
//! method is therefore fallible and callers treat an error as "no answer",
//! never as a hard failure.

use std::fmt;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Extended attribute holding a file's SELinux label.
const SELINUX_XATTR: &str = "security.selinux";

/// Errors returned by a [`PlatformSelinux`] implementation.
#[derive(Debug, Error)]
pub enum PlatformError {
    /// The query is not provided on this platform.
    #[error("platform SELinux query unavailable: {0}")]
    Unavailable(&'static str),

    /// The query exists but failed.
    #[error("platform SELinux query failed: {0}")]
    Query(#[from] std::io::Error),
}

/// Platform-provided SELinux queries.
///
/// Mirrors the four calls the manager needs from the host. Implementations
/// must be cheap to call repeatedly; nothing is cached by callers.
pub trait PlatformSelinux: Send + Sync + fmt::Debug {
    /// Whether SELinux is enabled.
    ///
    /// # Errors
    ///
    /// Returns an error if the platform cannot answer.
    fn is_enabled(&self) -> Result<bool, PlatformError>;

    /// Whether SELinux is in enforcing mode.
    ///
    /// # Errors
    ///
    /// Returns an error if the platform cannot answer.
    fn is_enforcing(&self) -> Result<bool, PlatformError>;

    /// The security context of the current process.
    ///
    /// # Errors
    ///
    /// Returns an error if the platform cannot answer.
    fn context(&self) -> Result<String, PlatformError>;

    /// The security context of the file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the platform cannot answer.
    fn file_context(&self, path: &Path) -> Result<String, PlatformError>;
}

/// A host without any platform SELinux API.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPlatformApi;

impl PlatformSelinux for NoPlatformApi {
    fn is_enabled(&self) -> Result<bool, PlatformError> {
        Err(PlatformError::Unavailable("is_enabled"))
    }

    fn is_enforcing(&self) -> Result<bool, PlatformError> {
        Err(PlatformError::Unavailable("is_enforcing"))
    }

    fn context(&self) -> Result<String, PlatformError> {
        Err(PlatformError::Unavailable("context"))
    }

    fn file_context(&self, _path: &Path) -> Result<String, PlatformError> {
        Err(PlatformError::Unavailable("file_context"))
    }
}

/// Answers platform queries from procfs and extended attributes.
///
/// Enforcement is only exposed by the kernel through selinuxfs, which the
/// probe already reads directly, so [`PlatformSelinux::is_enforcing`] is
/// unavailable here.
#[derive(Debug, Clone)]
pub struct ProcfsPlatform {
    proc_root: PathBuf,
}

impl ProcfsPlatform {
    /// Create a platform reader rooted at `proc_root` (normally `/proc`).
    #[must_use]
    pub fn new(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
        }
    }
}

impl Default for ProcfsPlatform {
    fn default() -> Self {
        Self::new("/proc")
    }
}

impl PlatformSelinux for ProcfsPlatform {
    fn is_enabled(&self) -> Result<bool, PlatformError> {
        let filesystems = std::fs::read_to_string(self.proc_root.join("filesystems"))?;
        Ok(filesystems
            .lines()
            .any(|line| line.split_whitespace().last() == Some("selinuxfs")))
    }

    fn is_enforcing(&self) -> Result<bool, PlatformError> {
        Err(PlatformError::Unavailable("is_enforcing"))
    }

    fn context(&self) -> Result<String, PlatformError> {
        let raw = std::fs::read(self.proc_root.join("self/attr/current"))?;
        parse_context(&raw)
    }

    fn file_context(&self, path: &Path) -> Result<String, PlatformError> {
        let raw = read_label_xattr(path)?;
        parse_context(&raw)
    }
}

/// Decode a kernel-provided label, which may carry a trailing NUL or newline.
fn parse_context(raw: &[u8]) -> Result<String, PlatformError> {
    let label = String::from_utf8_lossy(raw);
    let label = label.trim_end_matches(['\0', '\n']);
    if label.is_empty() {
        return Err(PlatformError::Query(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "empty security context",
        )));
    }
    Ok(label.to_string())
}

#[cfg(target_os = "linux")]
fn read_label_xattr(path: &Path) -> Result<Vec<u8>, PlatformError> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "path contains NUL byte")
    })?;
    let c_name = CString::new(SELINUX_XATTR).map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "attribute contains NUL byte")
    })?;

    let mut buf = vec![0u8; 256];
    loop {
        // SAFETY: both strings are valid NUL-terminated C strings that outlive
        // the call, and `buf` is a writable region of exactly `buf.len()` bytes.
        #[allow(unsafe_code)]
        let len = unsafe {
            libc::getxattr(
                c_path.as_ptr(),
                c_name.as_ptr(),
                buf.as_mut_ptr().cast(),
                buf.len(),
            )
        };
        if len >= 0 {
            #[allow(clippy::cast_sign_loss)] // checked non-negative above
            buf.truncate(len as usize);
            return Ok(buf);
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ERANGE) && buf.len() < 64 * 1024 {
            buf.resize(buf.len() * 4, 0);
            continue;
        }
        return Err(PlatformError::Query(err));
    }
}

#[cfg(not(target_os = "linux"))]
fn read_label_xattr(_path: &Path) -> Result<Vec<u8>, PlatformError> {
    let _ = SELINUX_XATTR;
    Err(PlatformError::Unavailable("file_context"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_platform_api_is_unavailable() {
        let api = NoPlatformApi;
        assert!(matches!(
            api.is_enabled(),
            Err(PlatformError::Unavailable("is_enabled"))
        ));
        assert!(api.is_enforcing().is_err());
        assert!(api.context().is_err());
        assert!(api.file_context(Path::new("/")).is_err());
    }

    #[test]
    fn test_procfs_detects_selinuxfs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("filesystems"),
            "nodev\tsysfs\nnodev\tselinuxfs\n\text4\n",
        )
        .unwrap();

        let api = ProcfsPlatform::new(dir.path());
        assert!(api.is_enabled().unwrap());
    }

    #[test]
    fn test_procfs_without_selinuxfs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("filesystems"), "nodev\tsysfs\n\text4\n").unwrap();

        let api = ProcfsPlatform::new(dir.path());
        assert!(!api.is_enabled().unwrap());
    }

    #[test]
    fn test_procfs_missing_filesystems_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let api = ProcfsPlatform::new(dir.path());
        assert!(matches!(api.is_enabled(), Err(PlatformError::Query(_))));
    }

    #[test]
    fn test_procfs_reads_process_context() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("self/attr")).unwrap();
        std::fs::write(
            dir.path().join("self/attr/current"),
            b"u:r:untrusted_app:s0:c512,c768\0",
        )
        .unwrap();

        let api = ProcfsPlatform::new(dir.path());
        assert_eq!(api.context().unwrap(), "u:r:untrusted_app:s0:c512,c768");
    }

    #[test]
    fn test_empty_context_is_error() {
        assert!(parse_context(b"\0").is_err());
        assert!(parse_context(b"").is_err());
        assert_eq!(parse_context(b"u:r:init:s0\n").unwrap(), "u:r:init:s0");
    }

    #[test]
    fn test_procfs_enforcing_unavailable() {
        let api = ProcfsPlatform::default();
        assert!(matches!(
            api.is_enforcing(),
            Err(PlatformError::Unavailable(_))
        ));
    }
}
