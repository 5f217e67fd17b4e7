//! Bridge policy: whether a Tor start should include bridge lines.

/// What the policy decided.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[non_exhaustive]
pub enum BridgeDecision {
    /// Connect directly.
    Off,
    /// Bridges preferred but direct fallback acceptable.
    Auto,
    /// Bridges required; never attempt a direct connection.
    Force,
}

/// Countries where direct Tor connections are known-blocked and bridges
/// are forced.
const FORCE_COUNTRIES: &[&str] = &["cn", "ir", "ru", "by", "tm"];

/// Countries where interference is intermittent; bridges are tried first
/// when the user left the policy on auto.
const AUTO_COUNTRIES: &[&str] = &["eg", "ae", "ve"];

/// Decide bridge usage from the user mode and a country code.
///
/// `user_force`/`user_off` reflect the explicit `torBridgesMode`
/// settings; auto mode consults the country table.
pub fn bridge_decision(user_off: bool, user_force: bool, country: Option<&str>) -> BridgeDecision {
    if user_off {
        return BridgeDecision::Off;
    }
    if user_force {
        return BridgeDecision::Force;
    }
    match country {
        Some(cc) if FORCE_COUNTRIES.contains(&cc) => BridgeDecision::Force,
        Some(cc) if AUTO_COUNTRIES.contains(&cc) => BridgeDecision::Auto,
        _ => BridgeDecision::Off,
    }
}

/// Best-effort country code: explicit override first, then the locale
/// environment.
///
/// `LANG=en_US.UTF-8` yields `us`; an unset or unparsable locale yields
/// `None`, which the policy treats as "no reason for bridges".
pub fn country_code(override_cc: Option<&str>) -> Option<String> {
    if let Some(cc) = override_cc {
        return Some(cc.to_ascii_lowercase());
    }
    for var in ["NIGHTJAR_COUNTRY", "LC_ALL", "LANG"] {
        if let Ok(value) = std::env::var(var) {
            if let Some(cc) = country_of_locale(&value) {
                return Some(cc);
            }
        }
    }
    None
}

/// Parse the territory out of a POSIX locale string.
fn country_of_locale(locale: &str) -> Option<String> {
    if locale.len() == 2 && locale.chars().all(|c| c.is_ascii_alphabetic()) {
        return Some(locale.to_ascii_lowercase());
    }
    let after_lang = locale.split('_').nth(1)?;
    let cc: String = after_lang
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect();
    if cc.len() == 2 {
        Some(cc.to_ascii_lowercase())
    } else {
        None
    }
}

/// Default obfs4 bridge lines, used when bridges are on and the
/// transport helper is bundled.
pub(crate) const DEFAULT_BRIDGE_LINES: &[&str] = &[
    "Bridge obfs4 193.11.166.194:27025 1E05F577A0EC0213F971D81BF4D86A9E4E8229ED \
     cert=4TLQPJrTSaDffMK7Nbao6LC7G9OW/NHkUwIdjLSS3KYf0Nv4/nQiiI8dY2TcsQx01NniOg iat-mode=0",
    "Bridge obfs4 85.31.186.98:443 011F2599C0E9B27EE74B353155E244813763C3E5 \
     cert=ayq0XzCwhpdysn5o0EyDUbmSOx3X/oTEbzDMvczHOdBJKlvIdHHLJGkZARtT4dcBFArPPg iat-mode=0",
];
