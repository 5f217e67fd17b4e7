//! Installer error codes and details.

use std::collections::BTreeMap;

/// The stable error codes the installer surfaces upward.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum InstallErrorCode {
    /// No pinned hash exists for the requested artifact.  The install
    /// never starts; operator action (a new release pin) is required.
    PinnedHashMissing,
    /// The downloaded artifact's digest did not match the pin.  The
    /// install aborts; no pointer is written and no rollback-forward is
    /// possible.
    HashMismatch,
    /// The release index had no asset for this platform and arch.
    AssetNotFound,
    /// The download failed or returned a non-success status.
    DownloadFailed,
    /// The archive would not extract.
    ExtractFailed,
    /// The expected binary was absent from the extracted tree.
    BinaryMissing,
    /// The filesystem refused us.
    PermissionDenied,
    /// Any other filesystem problem.
    FsError,
    /// Anything else.
    Unknown,
}

impl InstallErrorCode {
    /// The wire form of this code.
    pub fn as_str(&self) -> &'static str {
        match self {
            InstallErrorCode::PinnedHashMissing => "PINNED_HASH_MISSING",
            InstallErrorCode::HashMismatch => "HASH_MISMATCH",
            InstallErrorCode::AssetNotFound => "ASSET_NOT_FOUND",
            InstallErrorCode::DownloadFailed => "DOWNLOAD_FAILED",
            InstallErrorCode::ExtractFailed => "EXTRACT_FAILED",
            InstallErrorCode::BinaryMissing => "BINARY_MISSING",
            InstallErrorCode::PermissionDenied => "PERMISSION_DENIED",
            InstallErrorCode::FsError => "FS_ERROR",
            InstallErrorCode::Unknown => "UNKNOWN_ERROR",
        }
    }
}

/// An installer failure: a code plus a details map naming the network,
/// version, asset, and paths involved.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{} ({})", code.as_str(), render_details(details))]
#[non_exhaustive]
pub struct InstallError {
    /// The stable code.
    pub code: InstallErrorCode,
    /// Context for operators: network, version, asset, target paths.
    pub details: BTreeMap<String, String>,
}

/// Render a details map compactly for Display.
fn render_details(details: &BTreeMap<String, String>) -> String {
    details
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(", ")
}

impl InstallError {
    /// Construct an error with an empty details map.
    pub fn new(code: InstallErrorCode) -> Self {
        InstallError {
            code,
            details: BTreeMap::new(),
        }
    }

    /// Attach one detail.
    pub fn detail(mut self, key: &str, value: impl Into<String>) -> Self {
        self.details.insert(key.to_owned(), value.into());
        self
    }

    /// Classify an I/O error as `PERMISSION_DENIED` or `FS_ERROR`.
    pub fn from_io(e: &std::io::Error) -> Self {
        let code = match e.kind() {
            std::io::ErrorKind::PermissionDenied => InstallErrorCode::PermissionDenied,
            _ => InstallErrorCode::FsError,
        };
        InstallError::new(code).detail("io", e.to_string())
    }
}

impl From<fs_mistrust::Error> for InstallError {
    fn from(e: fs_mistrust::Error) -> Self {
        InstallError::new(InstallErrorCode::FsError).detail("fs", e.to_string())
    }
}

#[cfg(test)]
mod test {
    // @@ begin test lint list maintained by maint/add_warning @@
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::clone_on_copy)]
    #![allow(clippy::dbg_macro)]
    #![allow(clippy::mixed_attributes_style)]
    #![allow(clippy::print_stderr)]
    #![allow(clippy::print_stdout)]
    #![allow(clippy::single_char_pattern)]
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::unchecked_duration_subtraction)]
    #![allow(clippy::useless_vec)]
    #![allow(clippy::needless_pass_by_value)]
    //! <!-- @@ end test lint list maintained by maint/add_warning @@ -->
    use super::*;

    #[test]
    fn display_includes_code_and_details() {
        let e = InstallError::new(InstallErrorCode::HashMismatch)
            .detail("network", "tor")
            .detail("version", "13.5.9");
        let s = e.to_string();
        assert!(s.contains("HASH_MISMATCH"));
        assert!(s.contains("network=tor"));
        assert!(s.contains("version=13.5.9"));
    }

    #[test]
    fn io_classification() {
        let denied = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        assert_eq!(
            InstallError::from_io(&denied).code,
            InstallErrorCode::PermissionDenied
        );
        let other = std::io::Error::other("disk on fire");
        assert_eq!(InstallError::from_io(&other).code, InstallErrorCode::FsError);
    }
}
