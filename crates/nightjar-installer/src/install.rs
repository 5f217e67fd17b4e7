//! Download, verify, extract, and atomically activate a release.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use fs_mistrust::{CheckedDir, Mistrust};
use oneshot_fused_workaround as oneshot;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tor_rtcompat::Runtime;
use tracing::{debug, info, warn};

use nightjar_socks::{HttpClient, Request, RequestClass};

use crate::err::{InstallError, InstallErrorCode};
use crate::pinned::{OnionNetwork, Platform};
use crate::release::UpdateCheck;
use crate::Result;

/// Deadline for a whole artifact download.
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Progress milestones reported during an install.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[non_exhaustive]
pub enum InstallProgress {
    /// The download is running.
    Downloading,
    /// The artifact downloaded (`bytes` total) and is being verified.
    Verifying {
        /// Size of the downloaded artifact.
        bytes: u64,
    },
    /// The archive is being unpacked.
    Extracting,
    /// The pointer file is being swapped.
    Finalizing,
}

/// The pointer file naming the active version of a network's binary.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct CurrentPointer {
    /// Active version string.
    pub version: String,
    /// Absolute path of the installed binary.
    pub path: PathBuf,
}

/// A successful install: where things landed, plus the rollback handle.
#[derive(Debug)]
#[non_exhaustive]
pub struct InstallOutcome {
    /// The version that is now active.
    pub version: String,
    /// Absolute path of the installed binary.
    pub install_path: PathBuf,
    /// Restores the previous pointer if invoked.
    pub rollback: Rollback,
}

/// Undo handle for a pointer swap.
///
/// Restores the pointer bytes that were in place before the install (or
/// removes the pointer if there was none).  The extracted files of the
/// new version are left on disk; `prune_old_versions` collects them
/// later.
#[derive(Debug)]
pub struct Rollback {
    /// The component root.
    root: CheckedDir,
    /// Pointer file path, relative to the root.
    rel: String,
    /// Previous pointer bytes, if a pointer existed.
    previous: Option<String>,
}

impl Rollback {
    /// Put the previous pointer back.
    pub fn rollback(self) -> Result<()> {
        match self.previous {
            Some(bytes) => {
                self.root.write_and_replace(&self.rel, bytes)?;
            }
            None => {
                let path = self.root.join(&self.rel)?;
                match std::fs::remove_file(path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(InstallError::from_io(&e)),
                }
            }
        }
        Ok(())
    }
}

/// Manages the on-disk component tree under `<userData>/onion`.
///
/// Layout:
/// ```text
/// <root>/tmp-<asset>                         download staging
/// <root>/components/<network>/<version>/…    extracted releases
/// <root>/components/<network>/current.json   the active-version pointer
/// ```
pub struct Installer {
    /// The verified component root.
    root: CheckedDir,
    /// Platform whose assets we install.
    platform: Platform,
}

impl Installer {
    /// Open (or create) the component tree under `onion_root`.
    pub fn open(onion_root: &Path, mistrust: &Mistrust) -> Result<Self> {
        let root = mistrust.verifier().make_secure_dir(onion_root)?;
        Ok(Installer {
            root,
            platform: Platform::current(),
        })
    }

    /// As [`Installer::open`], with an explicit platform (for tests).
    pub fn open_for_platform(
        onion_root: &Path,
        mistrust: &Mistrust,
        platform: Platform,
    ) -> Result<Self> {
        let root = mistrust.verifier().make_secure_dir(onion_root)?;
        Ok(Installer { root, platform })
    }

    /// Pointer file path for `network`, relative to the root.
    fn pointer_rel(network: OnionNetwork) -> String {
        format!("components/{}/current.json", network.as_str())
    }

    /// Read the active-version pointer for `network`, if one exists.
    pub fn read_current_pointer(&self, network: OnionNetwork) -> Result<Option<CurrentPointer>> {
        match self.root.read_to_string(Self::pointer_rel(network)) {
            Ok(text) => {
                let ptr = serde_json::from_str(&text).map_err(|e| {
                    InstallError::new(InstallErrorCode::FsError)
                        .detail("network", network.as_str())
                        .detail("error", format!("corrupt pointer: {e}"))
                })?;
                Ok(Some(ptr))
            }
            Err(fs_mistrust::Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Download, verify, extract, and activate the release described by
    /// `check`.
    ///
    /// The pointer is swapped only after the new tree is fully extracted
    /// and its binary is present; every failure before that leaves the
    /// previous install untouched.
    pub async fn install<R: Runtime>(
        &self,
        client: &HttpClient<R>,
        check: &UpdateCheck,
        mut on_progress: impl FnMut(InstallProgress) + Send,
    ) -> Result<InstallOutcome> {
        let network = check.network;
        let err_details = |e: InstallError| {
            e.detail("network", network.as_str())
                .detail("version", &check.version)
                .detail("asset", &check.asset_name)
        };

        // (a) Download to a staging file under the component root.
        on_progress(InstallProgress::Downloading);
        let tmp_rel = format!("tmp-{}", check.asset_name);
        let tmp_path = self.root.join(&tmp_rel)?;
        let bytes = self
            .download(client, &check.download_url, &tmp_path)
            .await
            .map_err(err_details)?;
        let cleanup = TempFile(tmp_path.clone());

        // (b) Hash and compare against the pin, case-insensitively.
        on_progress(InstallProgress::Verifying { bytes });
        let got = sha256_of_file(tmp_path.clone())
            .await
            .map_err(|e| err_details(InstallError::from_io(&e)))?;
        if !got.eq_ignore_ascii_case(check.sha256) {
            warn!(
                "{} artifact digest mismatch: expected {}, got {}",
                network, check.sha256, got
            );
            return Err(err_details(
                InstallError::new(InstallErrorCode::HashMismatch)
                    .detail("expected", check.sha256)
                    .detail("actual", got),
            ));
        }

        // (c) Extract into the version directory.
        on_progress(InstallProgress::Extracting);
        let version_rel = format!("components/{}/{}", network.as_str(), check.version);
        let version_dir = self.root.join(&version_rel)?;
        std::fs::create_dir_all(&version_dir)
            .map_err(|e| err_details(InstallError::from_io(&e)))?;
        extract_archive(&check.asset_name, tmp_path.clone(), version_dir.clone())
            .await
            .map_err(err_details)?;

        // (d) The binary we promised must actually be there.
        let binary_rel = network.expected_binary(self.platform);
        let install_path = version_dir.join(binary_rel);
        if !install_path.is_file() {
            return Err(err_details(
                InstallError::new(InstallErrorCode::BinaryMissing)
                    .detail("expected", install_path.display().to_string()),
            ));
        }

        // (e) Swap the pointer, keeping the old bytes for rollback.
        on_progress(InstallProgress::Finalizing);
        let pointer_rel = Self::pointer_rel(network);
        let previous = match self.root.read_to_string(&pointer_rel) {
            Ok(text) => Some(text),
            Err(fs_mistrust::Error::NotFound(_)) => None,
            Err(e) => return Err(err_details(e.into())),
        };
        let pointer = CurrentPointer {
            version: check.version.clone(),
            path: install_path.clone(),
        };
        let json = serde_json::to_string_pretty(&pointer).map_err(|e| {
            err_details(InstallError::new(InstallErrorCode::Unknown).detail("error", e.to_string()))
        })?;
        self.root
            .write_and_replace(&pointer_rel, json)
            .map_err(|e| err_details(e.into()))?;

        drop(cleanup);
        info!("{} {} installed at {:?}", network, check.version, install_path);

        Ok(InstallOutcome {
            version: check.version.clone(),
            install_path,
            rollback: Rollback {
                root: self.root.clone(),
                rel: pointer_rel,
                previous,
            },
        })
    }

    /// Stream one artifact to `dest`; returns its size in bytes.
    async fn download<R: Runtime>(
        &self,
        client: &HttpClient<R>,
        url: &str,
        dest: &Path,
    ) -> Result<u64> {
        let request = Request::get(url)
            .map_err(|e| {
                InstallError::new(InstallErrorCode::DownloadFailed).detail("error", e.to_string())
            })?
            .class(RequestClass::ReleaseFetch)
            .timeout(DOWNLOAD_TIMEOUT);

        let mut file = std::fs::File::create(dest).map_err(|e| InstallError::from_io(&e))?;
        let (response, bytes) = client
            .fetch_to_writer(request, &mut file)
            .await
            .map_err(|e| {
                InstallError::new(InstallErrorCode::DownloadFailed)
                    .detail("url", url)
                    .detail("error", e.to_string())
            })?;
        if !response.is_success() {
            return Err(InstallError::new(InstallErrorCode::DownloadFailed)
                .detail("url", url)
                .detail("status", response.status.to_string()));
        }
        debug!("downloaded {} bytes from {}", bytes, url);
        Ok(bytes)
    }

    /// Best-effort removal of version directories other than the active
    /// one.  Failures are logged, never fatal.
    pub fn prune_old_versions(&self, network: OnionNetwork, keep_active: bool) {
        let active = if keep_active {
            self.read_current_pointer(network).ok().flatten()
        } else {
            None
        };
        let dir = match self.root.join(format!("components/{}", network.as_str())) {
            Ok(d) => d,
            Err(_) => return,
        };
        let entries = match std::fs::read_dir(&dir) {
            Ok(e) => e,
            Err(_) => return,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let is_active = active
                .as_ref()
                .map(|p| p.path.starts_with(&path))
                .unwrap_or(false);
            if is_active {
                continue;
            }
            debug!("pruning old {} version at {:?}", network, path);
            if let Err(e) = std::fs::remove_dir_all(&path) {
                warn!("could not prune {:?}: {}", path, e);
            }
        }
    }
}

/// Removes a staging file when dropped.
struct TempFile(PathBuf);

impl Drop for TempFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.0) {
            if e.kind() != std::io::ErrorKind::NotFound {
                debug!("could not remove staging file {:?}: {}", self.0, e);
            }
        }
    }
}

/// Run blocking work on its own thread, awaiting the result.
async fn run_blocking<T, F>(f: F) -> T
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    std::thread::spawn(move || {
        let _ = tx.send(f());
    });
    rx.await.expect("blocking worker died")
}

/// SHA-256 of a file's contents, streamed, as lowercase hex.
async fn sha256_of_file(path: PathBuf) -> std::io::Result<String> {
    run_blocking(move || {
        let mut file = std::fs::File::open(&path)?;
        let mut hasher = Sha256::new();
        let mut buf = [0_u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hex::encode(hasher.finalize()))
    })
    .await
}

/// Unpack `archive` into `dest` with the platform utility for its
/// extension.
async fn extract_archive(asset_name: &str, archive: PathBuf, dest: PathBuf) -> Result<()> {
    let (program, args): (&str, Vec<String>) = if asset_name.ends_with(".tar.gz") {
        (
            "tar",
            vec![
                "xzf".into(),
                archive.display().to_string(),
                "-C".into(),
                dest.display().to_string(),
            ],
        )
    } else if asset_name.ends_with(".tar.xz") {
        (
            "tar",
            vec![
                "xJf".into(),
                archive.display().to_string(),
                "-C".into(),
                dest.display().to_string(),
            ],
        )
    } else if asset_name.ends_with(".zip") {
        (
            "unzip",
            vec![
                "-o".into(),
                "-q".into(),
                archive.display().to_string(),
                "-d".into(),
                dest.display().to_string(),
            ],
        )
    } else {
        return Err(InstallError::new(InstallErrorCode::ExtractFailed)
            .detail("error", format!("unknown archive type: {asset_name}")));
    };

    let program = program.to_owned();
    let output = run_blocking(move || {
        std::process::Command::new(&program)
            .args(&args)
            .output()
            .map_err(|e| (program.clone(), e))
    })
    .await;

    match output {
        Ok(out) if out.status.success() => Ok(()),
        Ok(out) => Err(InstallError::new(InstallErrorCode::ExtractFailed)
            .detail("status", out.status.to_string())
            .detail("stderr", String::from_utf8_lossy(&out.stderr).into_owned())),
        Err((program, e)) => Err(InstallError::new(InstallErrorCode::ExtractFailed)
            .detail("utility", program)
            .detail("error", e.to_string())),
    }
}
