//! Resolving the latest release from an upstream index.

use serde::Deserialize;
use tor_rtcompat::Runtime;
use tracing::debug;

use nightjar_socks::{HttpClient, Request, RequestClass};

use crate::err::{InstallError, InstallErrorCode};
use crate::pinned::{asset_name, lookup_pinned_sha256, Arch, OnionNetwork, Platform};
use crate::Result;

/// Where to ask for the latest release of a network's binary.
#[derive(Debug, Clone)]
pub struct ReleaseSource {
    /// Which network's releases this index describes.
    pub network: OnionNetwork,
    /// URL of the JSON release index.
    pub index_url: String,
}

impl ReleaseSource {
    /// Construct a source for `network` with a given index URL.
    pub fn new(network: OnionNetwork, index_url: impl Into<String>) -> Self {
        ReleaseSource {
            network,
            index_url: index_url.into(),
        }
    }
}

/// The upstream index document: a version plus its downloadable assets.
#[derive(Debug, Clone, Deserialize)]
struct ReleaseIndex {
    /// Latest released version.
    version: String,
    /// The release's artifacts.
    assets: Vec<ReleaseAsset>,
}

/// One downloadable artifact in a release.
#[derive(Debug, Clone, Deserialize)]
struct ReleaseAsset {
    /// Artifact file name.
    name: String,
    /// Download URL.
    url: String,
}

/// The result of a successful update check: everything `install` needs.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct UpdateCheck {
    /// Which network this is for.
    pub network: OnionNetwork,
    /// The version the index advertises.
    pub version: String,
    /// The asset selected for this platform and architecture.
    pub asset_name: String,
    /// Where to download it.
    pub download_url: String,
    /// The pinned digest it must match.
    pub sha256: &'static str,
}

/// Resolve the latest installable release for `source`.
///
/// Fails with `ASSET_NOT_FOUND` when the index has no artifact for this
/// platform+arch, and with `PINNED_HASH_MISSING` when we have no
/// compiled-in digest for the advertised version; in that case nothing
/// is downloaded at all.
pub async fn check_updates<R: Runtime>(
    client: &HttpClient<R>,
    source: &ReleaseSource,
) -> Result<UpdateCheck> {
    check_updates_for(client, source, Platform::current(), Arch::current()).await
}

/// As [`check_updates`], for an explicit platform and architecture.
pub async fn check_updates_for<R: Runtime>(
    client: &HttpClient<R>,
    source: &ReleaseSource,
    platform: Platform,
    arch: Arch,
) -> Result<UpdateCheck> {
    let request = Request::get(&source.index_url)
        .map_err(|e| {
            InstallError::new(InstallErrorCode::DownloadFailed)
                .detail("network", source.network.as_str())
                .detail("index", &source.index_url)
                .detail("error", e.to_string())
        })?
        .class(RequestClass::ReleaseFetch);
    let response = client.fetch(request).await.map_err(|e| {
        InstallError::new(InstallErrorCode::DownloadFailed)
            .detail("network", source.network.as_str())
            .detail("index", &source.index_url)
            .detail("error", e.to_string())
    })?;
    if !response.is_success() {
        return Err(InstallError::new(InstallErrorCode::DownloadFailed)
            .detail("network", source.network.as_str())
            .detail("index", &source.index_url)
            .detail("status", response.status.to_string()));
    }

    let index: ReleaseIndex = serde_json::from_slice(&response.body).map_err(|e| {
        InstallError::new(InstallErrorCode::DownloadFailed)
            .detail("network", source.network.as_str())
            .detail("index", &source.index_url)
            .detail("error", format!("bad index JSON: {e}"))
    })?;
    debug!(
        "{} release index advertises version {}",
        source.network, index.version
    );

    let wanted = asset_name(source.network, platform, arch, &index.version);
    let asset = index
        .assets
        .iter()
        .find(|a| a.name == wanted)
        .ok_or_else(|| {
            InstallError::new(InstallErrorCode::AssetNotFound)
                .detail("network", source.network.as_str())
                .detail("version", &index.version)
                .detail("asset", &wanted)
        })?;

    let sha256 = lookup_pinned_sha256(source.network, platform, arch, &index.version, &wanted)
        .ok_or_else(|| {
            InstallError::new(InstallErrorCode::PinnedHashMissing)
                .detail("network", source.network.as_str())
                .detail("version", &index.version)
                .detail("asset", &wanted)
        })?;

    Ok(UpdateCheck {
        network: source.network,
        version: index.version,
        asset_name: asset.name.clone(),
        download_url: asset.url.clone(),
        sha256,
    })
}
