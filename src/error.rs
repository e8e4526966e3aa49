//! Error types for the model pool and the enrichment service.

use thiserror::Error;

/// Boxed loader error, kept as the `source()` of [`PoolError::LoadFailure`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors raised while building the model registry.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Model '{name}' is registered more than once")]
    DuplicateModel { name: String },

    #[error("Model '{name}' has memory cost 0, must be positive")]
    InvalidMemoryCost { name: String },
}

/// Model pool errors.
///
/// Everything except `LoadFailure` indicates misconfiguration or misuse
/// and is meant to fail fast.
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Unknown model: {name}")]
    UnknownModel { name: String },

    #[error("Model '{name}' is disabled")]
    ModelDisabled { name: String },

    #[error("Failed to load model '{name}': {source}")]
    LoadFailure {
        name: String,
        #[source]
        source: BoxError,
    },

    #[error("Invalid reload reason '{reason}' (expected one of: manual, oom, crash, timeout, system)")]
    InvalidReloadReason { reason: String },

    #[error("Model '{name}' released more times than it was acquired")]
    DoubleRelease { name: String },

    #[error("Model '{name}' released while not loaded")]
    NotLoaded { name: String },
}

impl PoolError {
    /// Whether this is a structural error (misconfiguration or misuse)
    /// rather than a runtime load failure.
    pub fn is_structural(&self) -> bool {
        !matches!(self, PoolError::LoadFailure { .. })
    }
}

/// Hard failures of an enrichment batch.
///
/// Per-detection problems never show up here; they are reported in
/// [`crate::service::EnrichmentResult::errors`].
#[derive(Error, Debug)]
pub enum EnrichError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("Invalid detection '{id}': {reason}")]
    InvalidDetection { id: String, reason: String },

    #[error("Detection id '{id}' appears more than once in the batch")]
    DuplicateDetection { id: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_load_failure_keeps_source() {
        let source = std::io::Error::new(std::io::ErrorKind::NotFound, "weights missing");
        let err = PoolError::LoadFailure {
            name: "plate_ocr".to_string(),
            source: Box::new(source),
        };
        assert!(err.to_string().contains("plate_ocr"));
        assert!(err.to_string().contains("weights missing"));
        assert!(err.source().is_some());
        assert!(!err.is_structural());
    }

    #[test]
    fn test_structural_errors() {
        assert!(PoolError::UnknownModel { name: "x".into() }.is_structural());
        assert!(PoolError::DoubleRelease { name: "x".into() }.is_structural());
        assert!(PoolError::InvalidReloadReason { reason: "bogus".into() }.is_structural());
    }

    #[test]
    fn test_enrich_error_is_transparent_over_pool_error() {
        let err: EnrichError = PoolError::ModelDisabled { name: "depth".into() }.into();
        assert_eq!(err.to_string(), "Model 'depth' is disabled");
    }
}
