//! Saturation-driven throttling of principal limits.

const MIN_FACTOR: f64 = 0.1;

/// Factor applied to RPM and TPM limits for the given upstream saturation.
///
/// Traffic is untouched below `threshold` or for principals without a positive
/// priority. Above it, the factor shrinks linearly with saturation and priority,
/// down to `0.1`.
pub fn throttle_factor(saturation: f64, threshold: f64, priority: i64) -> f64 {
    if saturation < threshold || priority <= 0 {
        return 1.0;
    }

    (1.0 - (saturation - threshold) * priority as f64 * 2.0).max(MIN_FACTOR)
}

/// `⌊limit · factor⌋`, never below one for a positive limit.
pub fn effective_limit(limit: u64, factor: f64) -> u64 {
    if limit == 0 {
        return 0;
    }

    ((limit as f64 * factor).floor() as u64).max(1)
}
