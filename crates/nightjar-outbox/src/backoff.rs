//! Retry backoff: capped exponential with jitter.

use rand::Rng;

/// Base delay multiplied by 2^attempts.
pub const BACKOFF_BASE_MS: u64 = 500;
/// Upper bound on the un-jittered delay.
pub const BACKOFF_CAP_MS: u64 = 60_000;
/// Jitter amplitude, as a percentage of the delay.
pub const BACKOFF_JITTER_PCT: u64 = 20;

/// Return the delay before attempt number `attempts` + 1, in
/// milliseconds: `min(2^attempts * 500ms, 60s)` plus or minus 20 %.
///
/// Jitter keeps a fleet of stuck senders from synchronizing their
/// retries against the same unreachable peer.
pub fn backoff_ms<R: Rng>(attempts: u32, rng: &mut R) -> u64 {
    let shift = attempts.min(20);
    let raw = BACKOFF_BASE_MS.saturating_mul(1_u64 << shift);
    let base = raw.min(BACKOFF_CAP_MS);
    let amplitude = base * BACKOFF_JITTER_PCT / 100;
    rng.random_range(base - amplitude..=base + amplitude)
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
    fn bounds_hold_for_every_attempt_count() {
        let mut rng = rand::rng();
        for attempts in 0..64 {
            let expected = (BACKOFF_BASE_MS.saturating_mul(1_u64 << attempts.min(20)))
                .min(BACKOFF_CAP_MS);
            for _ in 0..50 {
                let d = backoff_ms(attempts, &mut rng);
                assert!(d >= expected - expected / 5, "attempt {attempts}: {d} too low");
                assert!(d <= expected + expected / 5, "attempt {attempts}: {d} too high");
            }
        }
    }

    #[test]
    fn grows_then_caps() {
        let mut rng = rand::rng();
        // Even with maximal jitter, attempt 1 is well below attempt 5.
        let d1 = backoff_ms(1, &mut rng);
        let d5 = backoff_ms(5, &mut rng);
        assert!(d1 <= 1_200);
        assert!(d5 >= 12_800);
        // Far past the cap, the delay never exceeds cap + 20%.
        for _ in 0..50 {
            assert!(backoff_ms(40, &mut rng) <= BACKOFF_CAP_MS + BACKOFF_CAP_MS / 5);
        }
    }
}
