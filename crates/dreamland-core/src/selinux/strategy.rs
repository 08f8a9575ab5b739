//! Enforcement detection strategies.
//!
//! No single signal is reliable across every OS and vendor build, so the
//! enforcement state is resolved by an ordered chain of sources. Each source
//! either returns a definite verdict or defers to the next one. The chain
//! always ends with a source that is definite, so resolution terminates.

use std::io::{self, Read};
use std::path::{Path, PathBuf};

use tracing::{debug, error, warn};

use super::platform::PlatformSelinux;

/// Outcome of a single detection source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The source determined the enforcement state.
    Definite(bool),
    /// The source could not decide; the next source is consulted.
    Inconclusive,
}

/// One step in the enforcement detection chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnforcementSource {
    /// Read the first byte of the selinuxfs `enforce` file.
    StatusFile(PathBuf),
    /// Ask the platform API.
    PlatformApi,
    /// Last resort: whether the status file existed at all.
    StatusFilePresence(bool),
}

impl EnforcementSource {
    /// Short name used in diagnostics.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::StatusFile(_) => "status_file",
            Self::PlatformApi => "platform_api",
            Self::StatusFilePresence(_) => "status_file_presence",
        }
    }

    /// Evaluate this source.
    pub fn evaluate(&self, platform: &dyn PlatformSelinux) -> Verdict {
        match self {
            Self::StatusFile(path) => classify_status_read(path, read_status_byte(path)),
            Self::PlatformApi => match platform.is_enforcing() {
                Ok(enforcing) => Verdict::Definite(enforcing),
                Err(e) => {
                    error!(error = %e, "platform enforcement query failed");
                    Verdict::Inconclusive
                },
            },
            Self::StatusFilePresence(existed) => Verdict::Definite(*existed),
        }
    }
}

/// Build the detection chain for the given status file.
///
/// The status file is only read when it exists at the time the chain is
/// built; its presence is also captured for the final fallback.
#[must_use]
pub fn enforcement_chain(status_file: &Path) -> Vec<EnforcementSource> {
    let exists = status_file.exists();
    let mut chain = Vec::with_capacity(3);
    if exists {
        chain.push(EnforcementSource::StatusFile(status_file.to_path_buf()));
    }
    chain.push(EnforcementSource::PlatformApi);
    chain.push(EnforcementSource::StatusFilePresence(exists));
    chain
}

/// Walk `chain` in order and return the first definite verdict.
///
/// An empty or fully inconclusive chain resolves to enforcing.
pub fn resolve(chain: &[EnforcementSource], platform: &dyn PlatformSelinux) -> bool {
    for source in chain {
        if let Verdict::Definite(enforcing) = source.evaluate(platform) {
            debug!(source = source.name(), enforcing, "enforcement resolved");
            return enforcing;
        }
    }
    true
}

/// Read the first byte of the status file, `None` if it is empty.
///
/// # Errors
///
/// Returns the underlying I/O error if the file cannot be opened or read.
pub fn read_status_byte(path: &Path) -> io::Result<Option<u8>> {
    let mut file = std::fs::File::open(path)?;
    let mut byte = [0u8; 1];
    match file.read(&mut byte)? {
        0 => Ok(None),
        _ => Ok(Some(byte[0])),
    }
}

/// Turn the result of reading the status file into a verdict.
///
/// A denied read counts as enforcing. Other failures and unexpected contents
/// are inconclusive.
pub fn classify_status_read(path: &Path, read: io::Result<Option<u8>>) -> Verdict {
    match read {
        Ok(Some(b'1')) => Verdict::Definite(true),
        Ok(Some(b'0')) => Verdict::Definite(false),
        Ok(Some(other)) => {
            error!(byte = other, path = %path.display(), "unexpected byte in SELinux status file");
            Verdict::Inconclusive
        },
        Ok(None) => {
            error!(path = %path.display(), "SELinux status file is empty");
            Verdict::Inconclusive
        },
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
            warn!(path = %path.display(), "read of SELinux status file denied, assuming enforcing");
            Verdict::Definite(true)
        },
        Err(e) => {
            error!(error = %e, path = %path.display(), "failed to read SELinux status file");
            Verdict::Inconclusive
        },
    }
}
