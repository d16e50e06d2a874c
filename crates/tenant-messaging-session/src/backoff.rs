//! Reconnect delays for transient drops.

use std::time::Duration;

use rand::Rng;
use tenant_messaging_core::ReconnectPolicy;

/// Delay before reconnect `attempt` (1-based).
///
/// The first reconnect is immediate; later ones double from the base up to
/// the cap. Jitter is applied separately so this stays deterministic.
#[must_use]
pub fn base_delay(policy: &ReconnectPolicy, attempt: u32) -> Duration {
    if attempt <= 1 {
        return Duration::ZERO;
    }
    let exponent = (attempt - 2).min(31);
    let delay_ms = policy
        .base_delay_ms
        .saturating_mul(1u64 << exponent)
        .min(policy.max_delay_ms);
    Duration::from_millis(delay_ms)
}

/// [`base_delay`] with symmetric random jitter.
#[must_use]
pub fn jittered_delay(policy: &ReconnectPolicy, attempt: u32) -> Duration {
    let base = base_delay(policy, attempt);
    if base.is_zero() || policy.jitter_percent == 0 {
        return base;
    }
    let spread = u64::from(policy.jitter_percent);
    let pct = rand::rng().random_range(100u64.saturating_sub(spread)..=100 + spread);
    let base_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
    Duration::from_millis((base_ms.saturating_mul(pct) / 100).max(1))
}
