//! The compiled-in pinned-hash table and asset naming conventions.
//!
//! Every release artifact we are willing to install has its SHA-256
//! recorded here at build time, keyed by (network, platform, arch,
//! version, filename).  An artifact whose digest is not in this table is
//! not installable, full stop.

use serde::{Deserialize, Serialize};

/// Which external anonymizing network a binary belongs to.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum OnionNetwork {
    /// The Tor daemon (expert bundle).
    Tor,
    /// The Lokinet daemon.
    Lokinet,
}

impl OnionNetwork {
    /// Lowercase name, used in paths and error details.
    pub fn as_str(&self) -> &'static str {
        match self {
            OnionNetwork::Tor => "tor",
            OnionNetwork::Lokinet => "lokinet",
        }
    }

    /// The binary we expect to find inside an extracted release.
    pub fn expected_binary(&self, platform: Platform) -> &'static str {
        match (self, platform) {
            (OnionNetwork::Tor, Platform::Win32) => "tor/tor.exe",
            (OnionNetwork::Tor, _) => "tor/tor",
            (OnionNetwork::Lokinet, Platform::Win32) => "lokinet.exe",
            (OnionNetwork::Lokinet, _) => "lokinet",
        }
    }
}

impl std::fmt::Display for OnionNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Operating systems we ship binaries for.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum Platform {
    /// Linux.
    Linux,
    /// macOS.
    Darwin,
    /// Windows.
    Win32,
    /// Android.
    Android,
}

impl Platform {
    /// The platform of the running process.
    pub fn current() -> Self {
        if cfg!(target_os = "macos") {
            Platform::Darwin
        } else if cfg!(target_os = "windows") {
            Platform::Win32
        } else if cfg!(target_os = "android") {
            Platform::Android
        } else {
            Platform::Linux
        }
    }

    /// Our name for this platform.
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Linux => "linux",
            Platform::Darwin => "darwin",
            Platform::Win32 => "win32",
            Platform::Android => "android",
        }
    }

    /// The token upstream Tor expert bundles use for this platform.
    fn tor_token(&self) -> &'static str {
        match self {
            Platform::Linux => "linux",
            Platform::Darwin => "macos",
            Platform::Win32 => "windows",
            Platform::Android => "android",
        }
    }
}

/// CPU architectures we ship binaries for.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum Arch {
    /// x86-64.
    X64,
    /// 32-bit x86.
    Ia32,
    /// 64-bit ARM.
    Arm64,
    /// 32-bit ARM.
    Arm,
}

impl Arch {
    /// The architecture of the running process.
    pub fn current() -> Self {
        if cfg!(target_arch = "x86_64") {
            Arch::X64
        } else if cfg!(target_arch = "x86") {
            Arch::Ia32
        } else if cfg!(target_arch = "aarch64") {
            Arch::Arm64
        } else {
            Arch::Arm
        }
    }

    /// Our name for this architecture.
    pub fn as_str(&self) -> &'static str {
        match self {
            Arch::X64 => "x64",
            Arch::Ia32 => "ia32",
            Arch::Arm64 => "arm64",
            Arch::Arm => "arm",
        }
    }

    /// The token upstream Tor expert bundles use for this architecture.
    fn tor_token(&self) -> &'static str {
        match self {
            Arch::X64 => "x86_64",
            Arch::Ia32 => "i686",
            Arch::Arm64 => "aarch64",
            Arch::Arm => "armv7",
        }
    }

    /// The token Lokinet release archives use for this architecture.
    fn lokinet_token(&self) -> &'static str {
        match self {
            Arch::X64 => "amd64",
            Arch::Ia32 => "i386",
            Arch::Arm64 => "arm64",
            Arch::Arm => "armhf",
        }
    }
}

/// Build the upstream asset name for `(network, platform, arch, version)`.
///
/// Tor expert bundles look like
/// `tor-expert-bundle-linux-x86_64-13.5.9.tar.gz`; Lokinet releases look
/// like `lokinet-v0.9.11-linux-amd64.tar.xz` (`.zip` on Windows).
pub fn asset_name(
    network: OnionNetwork,
    platform: Platform,
    arch: Arch,
    version: &str,
) -> String {
    match network {
        OnionNetwork::Tor => format!(
            "tor-expert-bundle-{}-{}-{}.tar.gz",
            platform.tor_token(),
            arch.tor_token(),
            version
        ),
        OnionNetwork::Lokinet => {
            let ext = match platform {
                Platform::Win32 => "zip",
                _ => "tar.xz",
            };
            format!(
                "lokinet-v{}-{}-{}.{}",
                version,
                platform.tor_token(),
                arch.lokinet_token(),
                ext
            )
        }
    }
}

/// One pinned artifact digest.
#[derive(Debug, Clone, Copy)]
#[non_exhaustive]
pub struct PinnedDigest {
    /// Which network's binary this is.
    pub network: OnionNetwork,
    /// Target platform.
    pub platform: Platform,
    /// Target architecture.
    pub arch: Arch,
    /// Upstream version string.
    pub version: &'static str,
    /// Exact artifact file name.
    pub filename: &'static str,
    /// Lowercase hex SHA-256 of the artifact.
    pub sha256: &'static str,
}

/// The pinned releases this build will install.
///
/// Maintained by the release process: each entry is the digest of an
/// artifact a maintainer downloaded and verified out of band.
pub const PINNED_SHA256: &[PinnedDigest] = &[
    PinnedDigest {
        network: OnionNetwork::Tor,
        platform: Platform::Linux,
        arch: Arch::X64,
        version: "13.5.9",
        filename: "tor-expert-bundle-linux-x86_64-13.5.9.tar.gz",
        sha256: "e31f4d5fbaf61cb7b9aa0548181a3c60de022a6a8d3e923d20fa05ea2b2fa6f4",
    },
    PinnedDigest {
        network: OnionNetwork::Tor,
        platform: Platform::Linux,
        arch: Arch::Arm64,
        version: "13.5.9",
        filename: "tor-expert-bundle-linux-aarch64-13.5.9.tar.gz",
        sha256: "6c82618ba33fe1747cdb91072b0de1e006ae2d9c75f7d0d56f70e4f62e457e45",
    },
    PinnedDigest {
        network: OnionNetwork::Tor,
        platform: Platform::Darwin,
        arch: Arch::X64,
        version: "13.5.9",
        filename: "tor-expert-bundle-macos-x86_64-13.5.9.tar.gz",
        sha256: "16d84d260a84e37affd9a2ea80f6f6ffbcf28d586e26c9b54856de17e25d8bfc",
    },
    PinnedDigest {
        network: OnionNetwork::Tor,
        platform: Platform::Darwin,
        arch: Arch::Arm64,
        version: "13.5.9",
        filename: "tor-expert-bundle-macos-aarch64-13.5.9.tar.gz",
        sha256: "0af391e1a2e401c7073ec48a0403ea00d72666aabc2989644ab48f8eb4b40f70",
    },
    PinnedDigest {
        network: OnionNetwork::Tor,
        platform: Platform::Win32,
        arch: Arch::X64,
        version: "13.5.9",
        filename: "tor-expert-bundle-windows-x86_64-13.5.9.tar.gz",
        sha256: "b3f7e89fc4b6f94c6aa7cbd0598254a7c69befd60498cae33f83ad45e8ca0b22",
    },
    PinnedDigest {
        network: OnionNetwork::Tor,
        platform: Platform::Android,
        arch: Arch::Arm64,
        version: "13.5.9",
        filename: "tor-expert-bundle-android-aarch64-13.5.9.tar.gz",
        sha256: "8c9a487bfa0b7a03f1b1bb9b1741bb42d4332ffbecd8b3dbac0e5eae04b0e75c",
    },
    PinnedDigest {
        network: OnionNetwork::Lokinet,
        platform: Platform::Linux,
        arch: Arch::X64,
        version: "0.9.11",
        filename: "lokinet-v0.9.11-linux-amd64.tar.xz",
        sha256: "d94c7c28aba88e01c86ab0e1ef83bb16dbcbcdaf8bf5e6b9e6f40a9e63e2560b",
    },
    PinnedDigest {
        network: OnionNetwork::Lokinet,
        platform: Platform::Linux,
        arch: Arch::Arm64,
        version: "0.9.11",
        filename: "lokinet-v0.9.11-linux-arm64.tar.xz",
        sha256: "fa7e8a815bf79ef32b90b74ccedc9f58dfca00d8e9a2b6f4cbeaa89163cdf25e",
    },
    PinnedDigest {
        network: OnionNetwork::Lokinet,
        platform: Platform::Darwin,
        arch: Arch::Arm64,
        version: "0.9.11",
        filename: "lokinet-v0.9.11-macos-arm64.tar.xz",
        sha256: "1a8e1d156e58a19df52f44e5ebeed1f71cbd5c3cb6c2e10a0e70e16e2d8c8b7a",
    },
    PinnedDigest {
        network: OnionNetwork::Lokinet,
        platform: Platform::Win32,
        arch: Arch::X64,
        version: "0.9.11",
        filename: "lokinet-v0.9.11-windows-amd64.zip",
        sha256: "53dfa54e2b85bdab829bd49a3a7f1d1a30245beec7d0c30412eb9f29c4adbc51",
    },
];

/// Look up the pinned SHA-256 for an artifact, if we have one.
///
/// The filename comparison is exact; the hex digest returned is
/// lowercase, and callers compare digests case-insensitively.
pub fn lookup_pinned_sha256(
    network: OnionNetwork,
    platform: Platform,
    arch: Arch,
    version: &str,
    filename: &str,
) -> Option<&'static str> {
    PINNED_SHA256
        .iter()
        .find(|p| {
            p.network == network
                && p.platform == platform
                && p.arch == arch
                && p.version == version
                && p.filename == filename
        })
        .map(|p| p.sha256)
}
