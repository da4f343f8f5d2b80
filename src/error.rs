use thiserror::Error;

/// Unrecoverable data or processing failure for a single polygon.
///
/// These are reported to the caller per polygon and never corrupt the
/// processing of any other polygon. Retry and skip policy belongs to the
/// batch layer, not this crate.
#[derive(Error, Debug)]
pub enum ProcessingError {
    #[error("polygon {0} has no primary layer")]
    NoPrimaryLayer(String),

    #[error("malformed layer: {0}")]
    MalformedLayer(String),

    #[error("no {kind} equation group for species '{species}' in BEC zone '{bec}'")]
    MissingEquationGroup {
        kind: &'static str,
        species: String,
        bec: String,
    },

    #[error("no coefficients for {kind} group {group}")]
    MissingCoefficients { kind: &'static str, group: i32 },

    #[error("root finder did not converge after {iterations} iterations (residual {residual})")]
    RootFinderDidNotConverge { iterations: usize, residual: f64 },

    #[error("logit {0} exceeds 88")]
    LogitOverflow(f64),

    #[error("processing failed: {0}")]
    Other(String),
}

/// Programmer/contract violation: reading a derived value before it has been
/// computed, or re-setting a write-once field.
///
/// Expected to surface only in tests and during development; runtime callers
/// should never need to handle these.
#[derive(Error, Debug)]
pub enum StateError {
    #[error("unset {0}")]
    Unset(&'static str),

    #[error("{0} can be set once only")]
    AlreadySet(&'static str),

    #[error("no processing step {0} the {1} step")]
    NoSuchStep(&'static str, &'static str),
}

// The engine propagates contract violations as processing failures so a bad
// polygon never takes the batch down with a panic.
impl From<StateError> for ProcessingError {
    fn from(e: StateError) -> Self {
        ProcessingError::Other(format!("illegal state: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_processing_error_display() {
        let err = ProcessingError::NoPrimaryLayer("093C090-1".to_string());
        assert_eq!(err.to_string(), "polygon 093C090-1 has no primary layer");

        let err = ProcessingError::MissingEquationGroup {
            kind: "volume",
            species: "MB".to_string(),
            bec: "CDF".to_string(),
        };
        assert!(err.to_string().contains("volume"));
        assert!(err.to_string().contains("MB"));
        assert!(err.to_string().contains("CDF"));
    }

    #[test]
    fn test_root_finder_error_display() {
        let err = ProcessingError::RootFinderDidNotConverge {
            iterations: 100,
            residual: 0.5,
        };
        assert!(err.to_string().contains("100"));
        assert!(err.to_string().contains("0.5"));
    }

    #[test]
    fn test_state_error_display() {
        assert_eq!(
            StateError::Unset("rankingDetails").to_string(),
            "unset rankingDetails"
        );
        assert_eq!(
            StateError::AlreadySet("siteCurveNumbers").to_string(),
            "siteCurveNumbers can be set once only"
        );
        assert_eq!(
            StateError::NoSuchStep("before", "first").to_string(),
            "no processing step before the first step"
        );
    }

    #[test]
    fn test_state_error_converts_to_processing_error() {
        let err: ProcessingError = StateError::Unset("rankingDetails").into();
        assert_eq!(err.to_string(), "processing failed: illegal state: unset rankingDetails");
    }

    #[test]
    fn test_errors_are_debug() {
        let err = ProcessingError::Other("boom".to_string());
        assert!(format!("{err:?}").contains("Other"));
        let err = StateError::Unset("x");
        assert!(format!("{err:?}").contains("Unset"));
    }
}
