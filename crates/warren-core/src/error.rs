//! Error types for warren-core.

use std::fmt;
use thiserror::Error;
use warren_api::StoreError;

/// Result type alias for controller operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors that can occur while reconciling.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Error from the object store
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Store error annotated with the step that failed
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: StoreError,
    },

    /// Referenced template does not exist
    #[error("SandboxTemplate {0:?} not found")]
    TemplateNotFound(String),

    /// Object with the expected name belongs to another controller
    #[error("{kind} {name:?} is not controlled by {owner}")]
    NotControlled {
        kind: &'static str,
        name: String,
        owner: String,
    },

    /// Desired state that can never be realized
    #[error("invalid spec: {0}")]
    InvalidSpec(String),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Tracing backend failure
    #[error("telemetry error: {0}")]
    Telemetry(String),

    /// Several independent steps failed in one pass
    #[error("{0}")]
    Aggregate(AggregateError),
}

/// Errors from independent steps of one reconcile pass.
#[derive(Debug)]
pub struct AggregateError(Vec<CoreError>);

impl AggregateError {
    pub fn errors(&self) -> &[CoreError] {
        &self.0
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateError {}

impl CoreError {
    /// Returns a closure that wraps a store error with `context`, for use
    /// with `map_err`.
    pub fn context(context: impl Into<String>) -> impl FnOnce(StoreError) -> CoreError {
        let context = context.into();
        move |source| CoreError::Context { context, source }
    }

    /// Combine step errors: `None` if there were none, the error itself if
    /// there was one.
    pub fn join(errors: Vec<CoreError>) -> Option<CoreError> {
        let mut errors = errors;
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(CoreError::Aggregate(AggregateError(errors))),
        }
    }

    fn store_error(&self) -> Option<&StoreError> {
        match self {
            Self::Store(e) | Self::Context { source: e, .. } => Some(e),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.store_error().is_some_and(StoreError::is_not_found)
    }

    /// Whether this is an optimistic-concurrency conflict (for an aggregate,
    /// whether every part is).
    pub fn is_conflict(&self) -> bool {
        match self {
            Self::Aggregate(agg) => agg.0.iter().all(CoreError::is_conflict),
            _ => self.store_error().is_some_and(StoreError::is_conflict),
        }
    }

    /// Errors that retrying cannot fix; they are surfaced in status instead.
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::TemplateNotFound(_) | Self::InvalidSpec(_) | Self::InvalidConfig(_) => true,
            Self::Aggregate(agg) => agg.0.iter().all(CoreError::is_permanent),
            _ => false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        !self.is_permanent()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warren_api::ObjectKey;

    fn conflict() -> StoreError {
        StoreError::Conflict {
            kind: "Pod".into(),
            key: ObjectKey::new("default", "p"),
            expected: 1,
            actual: 2,
        }
    }

    #[test]
    fn test_join() {
        assert!(CoreError::join(vec![]).is_none());

        let single = CoreError::join(vec![CoreError::InvalidSpec("x".into())]).unwrap();
        assert!(matches!(single, CoreError::InvalidSpec(_)));

        let both = CoreError::join(vec![
            CoreError::InvalidSpec("a".into()),
            CoreError::TemplateNotFound("b".into()),
        ])
        .unwrap();
        assert_eq!(
            both.to_string(),
            "invalid spec: a; SandboxTemplate \"b\" not found"
        );
    }

    #[test]
    fn test_context() {
        let err = CoreError::context("failed to get pod")(conflict());
        assert!(err.is_conflict());
        assert!(err.to_string().starts_with("failed to get pod: conflict"));
    }

    #[test]
    fn test_classification() {
        assert!(CoreError::TemplateNotFound("t".into()).is_permanent());
        assert!(CoreError::Store(conflict()).is_retryable());

        let mixed = CoreError::join(vec![
            CoreError::Store(conflict()),
            CoreError::InvalidSpec("x".into()),
        ])
        .unwrap();
        assert!(!mixed.is_conflict());
        assert!(!mixed.is_permanent());

        let conflicts =
            CoreError::join(vec![CoreError::Store(conflict()), CoreError::Store(conflict())])
                .unwrap();
        assert!(conflicts.is_conflict());
    }
}
