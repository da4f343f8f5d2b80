//! Small numeric helpers shared by the estimators and the processing engine.

use crate::error::ProcessingError;

/// Largest magnitude a logit may take before being clamped.
pub const MAX_LOGIT: f64 = 7.0;

/// Clamp `x` into `[min, max]`.
pub fn clamp(x: f64, min: f64, max: f64) -> f64 {
    debug_assert!(max >= min, "maximum {max} was less than minimum {min}");
    x.min(max).max(min)
}

/// Logit of `ratio`, clamped to `[-MAX_LOGIT, MAX_LOGIT]`.
///
/// Ratios at or beyond the (0, 1) boundaries map to the clamp values exactly,
/// so negligible or saturated components never blow up.
pub fn clamped_logit(ratio: f64) -> f64 {
    if ratio <= 0.0 {
        -MAX_LOGIT
    } else if ratio >= 1.0 {
        MAX_LOGIT
    } else {
        clamp((ratio / (1.0 - ratio)).ln(), -MAX_LOGIT, MAX_LOGIT)
    }
}

/// Inverse of the clamped logit: e^arg / (1 + e^arg), saturating to 0 or 1
/// outside `[-radius, radius]`.
pub fn ratio(arg: f64, radius: f64) -> f64 {
    if arg < -radius {
        0.0
    } else if arg > radius {
        1.0
    } else {
        arg.exp() / (1.0 + arg.exp())
    }
}

/// e^logit, failing rather than overflowing when the argument is implausibly
/// large for a logit.
pub fn safe_exponent(logit: f64) -> Result<f64, ProcessingError> {
    if logit > 88.0 {
        return Err(ProcessingError::LogitOverflow(logit));
    }
    Ok(logit.exp())
}

/// e^logit / (1 + e^logit) with the overflow guard of [`safe_exponent`].
pub fn exponent_ratio(logit: f64) -> Result<f64, ProcessingError> {
    let exp = safe_exponent(logit)?;
    Ok(exp / (1.0 + exp))
}
