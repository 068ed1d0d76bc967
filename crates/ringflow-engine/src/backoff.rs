//! Retry delay computation: capped exponential backoff with decorrelated
//! jitter.
//!
//! The delay for the k-th retry is `min(base * 2^(attempt-1), max)`, then
//! jittered by a uniform fraction in `(-jitter/2, +jitter/2)` and floored at
//! `base`. With `jitter = 0` delays are deterministic; with
//! `max_delay = base_delay` the exponential collapses to a constant.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;

use crate::messages::DispatchMessage;

/// Fallback base delay when the message carries a non-positive value.
const DEFAULT_BASE_MS: i64 = 2_000;
/// Fallback delay cap when the message carries a non-positive value.
const DEFAULT_MAX_MS: i64 = 120_000;

/// Computes the scheduled time of the next attempt for a failed dispatch.
///
/// The policy travels on the message itself (`retry_base_ms`,
/// `retry_max_ms`, `retry_jitter`), so no store lookup happens on the retry
/// path. Non-positive policy values fall back to 2 s base / 2 min cap.
pub fn compute_next_attempt<R: Rng + ?Sized>(
    msg: &DispatchMessage,
    now: DateTime<Utc>,
    rng: &mut R,
) -> DateTime<Utc> {
    let delay_ms = compute_delay_ms(
        msg.retry_base_ms,
        msg.retry_max_ms,
        msg.retry_jitter,
        msg.attempt,
        rng,
    );
    now + ChronoDuration::milliseconds(delay_ms)
}

/// Computes the jittered delay in milliseconds for a 1-based attempt.
pub fn compute_delay_ms<R: Rng + ?Sized>(
    base_ms: i64,
    max_ms: i64,
    jitter: f64,
    attempt: u32,
    rng: &mut R,
) -> i64 {
    let base = if base_ms > 0 { base_ms } else { DEFAULT_BASE_MS };
    let max = if max_ms > 0 { max_ms } else { DEFAULT_MAX_MS };

    let exponent = attempt.saturating_sub(1).min(62);
    let factor = 1_i64.checked_shl(exponent).unwrap_or(i64::MAX);
    let mut delay = base.saturating_mul(factor).min(max);

    if jitter > 0.0 {
        // Uniform fraction in (-jitter/2, +jitter/2), floored at base.
        let fraction = rng.gen::<f64>().mul_add(jitter, -(jitter / 2.0));
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
        let offset = (delay as f64 * fraction) as i64;
        delay = delay.saturating_add(offset).max(base);
    }

    delay
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    #[test]
    fn zero_jitter_is_deterministic_and_doubles() {
        let mut rng = rng();
        assert_eq!(compute_delay_ms(1_000, 60_000, 0.0, 1, &mut rng), 1_000);
        assert_eq!(compute_delay_ms(1_000, 60_000, 0.0, 2, &mut rng), 2_000);
        assert_eq!(compute_delay_ms(1_000, 60_000, 0.0, 3, &mut rng), 4_000);
        assert_eq!(compute_delay_ms(1_000, 60_000, 0.0, 4, &mut rng), 8_000);
    }

    #[test]
    fn cap_bounds_growth() {
        let mut rng = rng();
        assert_eq!(compute_delay_ms(1_000, 5_000, 0.0, 10, &mut rng), 5_000);
    }

    #[test]
    fn max_equal_to_base_collapses_to_constant() {
        let mut rng = rng();
        for attempt in 1..8 {
            assert_eq!(compute_delay_ms(3_000, 3_000, 0.0, attempt, &mut rng), 3_000);
        }
    }

    #[test]
    fn full_jitter_stays_within_bounds() {
        let mut rng = rng();
        for attempt in 1..6 {
            for _ in 0..200 {
                let capped = (1_000_i64 << (attempt - 1)).min(30_000);
                let delay = compute_delay_ms(1_000, 30_000, 1.0, attempt, &mut rng);
                // Within [base, 1.5 x capped].
                assert!(delay >= 1_000, "delay {delay} below base");
                assert!(
                    delay <= capped + capped / 2,
                    "delay {delay} above 1.5x cap for attempt {attempt}"
                );
            }
        }
    }

    #[test]
    fn non_positive_policy_values_fall_back() {
        let mut rng = rng();
        assert_eq!(compute_delay_ms(0, 0, 0.0, 1, &mut rng), DEFAULT_BASE_MS);
        assert_eq!(
            compute_delay_ms(-5, -5, 0.0, 30, &mut rng),
            DEFAULT_MAX_MS
        );
    }

    #[test]
    fn huge_attempt_numbers_saturate_at_cap() {
        let mut rng = rng();
        assert_eq!(
            compute_delay_ms(1_000, 90_000, 0.0, u32::MAX, &mut rng),
            90_000
        );
    }

    #[test]
    fn next_attempt_is_in_the_future() {
        use chrono::Utc;
        use ringflow_core::{CallId, CampaignId};

        let msg = DispatchMessage {
            call_id: CallId::generate(),
            campaign_id: CampaignId::generate(),
            phone_number: "+15550100".into(),
            attempt: 2,
            max_attempts: 5,
            retry_base_ms: 1_000,
            retry_max_ms: 10_000,
            retry_jitter: 0.0,
            concurrency_limit: 1,
            metadata: None,
            enqueued_at: Utc::now(),
        };
        let now = Utc::now();
        let next = compute_next_attempt(&msg, now, &mut rng());
        assert_eq!((next - now).num_milliseconds(), 2_000);
    }
}
