//! Error types for gridstore
//!
//! Every fallible persistence operation returns [`PersistenceError`]. The
//! variants mirror how a caller is expected to react: delete and recreate on
//! [`PersistenceError::FatalAccess`], back off and retry on
//! [`PersistenceError::ConcurrentAccess`], and correlate background failures
//! through the receipt carried by [`PersistenceError::Async`].

use crate::types::Receipt;
use std::fmt;
use thiserror::Error;

/// Common result type for gridstore operations
pub type Result<T> = std::result::Result<T, PersistenceError>;

/// Common error type for gridstore
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// The store is structurally unrecoverable.
    #[error("fatal access: {0}")]
    FatalAccess(String),

    /// The resource is locked by another opener or process.
    #[error("concurrent access: {0}")]
    ConcurrentAccess(String),

    /// A failure raised by deferred or background execution.
    #[error("asynchronous persistence failure (receipt {}): {source}", fmt_receipt(.receipt.as_ref()))]
    Async {
        receipt: Option<Receipt>,
        #[source]
        source: Box<PersistenceError>,
    },

    #[error("illegal argument: {0}")]
    IllegalArgument(String),

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("stream corrupted: {0}")]
    StreamCorrupted(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("interrupted: {0}")]
    Interrupted(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("allocation error: {0}")]
    Allocation(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    /// An error annotated with the environment, manager and store it came from.
    #[error("{source} [{context}]")]
    Context {
        context: ErrorContext,
        #[source]
        source: Box<PersistenceError>,
    },
}

fn fmt_receipt(receipt: Option<&Receipt>) -> String {
    receipt.map_or_else(|| "none".to_string(), ToString::to_string)
}

/// Diagnostic references attached to an error
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ErrorContext {
    pub environment: Option<String>,
    pub manager: Option<String>,
    pub store: Option<String>,
}

impl ErrorContext {
    fn merge(&mut self, other: Self) {
        if self.environment.is_none() {
            self.environment = other.environment;
        }
        if self.manager.is_none() {
            self.manager = other.manager;
        }
        if self.store.is_none() {
            self.store = other.store;
        }
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::with_capacity(3);
        if let Some(env) = &self.environment {
            parts.push(format!("environment={env}"));
        }
        if let Some(mgr) = &self.manager {
            parts.push(format!("manager={mgr}"));
        }
        if let Some(store) = &self.store {
            parts.push(format!("store={store}"));
        }
        write!(f, "{}", parts.join(", "))
    }
}

impl PersistenceError {
    /// Create a fatal access error
    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::FatalAccess(msg.into())
    }

    /// Create a concurrent access error
    pub fn concurrent(msg: impl Into<String>) -> Self {
        Self::ConcurrentAccess(msg.into())
    }

    /// Create an illegal argument error
    pub fn illegal_argument(msg: impl Into<String>) -> Self {
        Self::IllegalArgument(msg.into())
    }

    /// Create an illegal state error
    pub fn illegal_state(msg: impl Into<String>) -> Self {
        Self::IllegalState(msg.into())
    }

    /// Create a backend error
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    /// Create a corrupt stream error
    pub fn corrupted(msg: impl Into<String>) -> Self {
        Self::StreamCorrupted(msg.into())
    }

    /// Create a generic persistence error
    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::Persistence(msg.into())
    }

    /// Wrap this error as the failure of a background operation.
    #[must_use]
    pub fn into_async(self, receipt: Option<Receipt>) -> Self {
        match self {
            Self::Async { .. } => self,
            other => Self::Async {
                receipt,
                source: Box::new(other),
            },
        }
    }

    /// Attach a store reference.
    #[must_use]
    pub fn with_store(self, store: impl Into<String>) -> Self {
        self.with_context(ErrorContext {
            store: Some(store.into()),
            ..ErrorContext::default()
        })
    }

    /// Attach a manager reference.
    #[must_use]
    pub fn with_manager(self, manager: impl Into<String>) -> Self {
        self.with_context(ErrorContext {
            manager: Some(manager.into()),
            ..ErrorContext::default()
        })
    }

    /// Attach an environment reference.
    #[must_use]
    pub fn with_environment(self, environment: impl Into<String>) -> Self {
        self.with_context(ErrorContext {
            environment: Some(environment.into()),
            ..ErrorContext::default()
        })
    }

    fn with_context(self, extra: ErrorContext) -> Self {
        match self {
            Self::Context {
                mut context,
                source,
            } => {
                context.merge(extra);
                Self::Context { context, source }
            }
            other => Self::Context {
                context: extra,
                source: Box::new(other),
            },
        }
    }

    /// The error with all diagnostic context wrappers removed.
    #[must_use]
    pub fn root(&self) -> &Self {
        match self {
            Self::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// Diagnostic context, if any was attached.
    #[must_use]
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Self::Context { context, .. } => Some(context),
            _ => None,
        }
    }

    /// Receipt of a failed background operation.
    #[must_use]
    pub fn receipt(&self) -> Option<&Receipt> {
        match self.root() {
            Self::Async { receipt, .. } => receipt.as_ref(),
            _ => None,
        }
    }

    /// Check whether the store should be deleted rather than retried
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        match self.root() {
            Self::FatalAccess(_) => true,
            Self::Async { source, .. } => source.is_fatal(),
            _ => false,
        }
    }

    /// Check whether the failure was a lock held by someone else
    #[must_use]
    pub fn is_concurrent_access(&self) -> bool {
        match self.root() {
            Self::ConcurrentAccess(_) => true,
            Self::Async { source, .. } => source.is_concurrent_access(),
            _ => false,
        }
    }

    /// Check whether this is an illegal argument error
    #[must_use]
    pub fn is_illegal_argument(&self) -> bool {
        matches!(self.root(), Self::IllegalArgument(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_merges_instead_of_nesting() {
        let err = PersistenceError::fatal("bad metadata")
            .with_store("7")
            .with_manager("active")
            .with_environment("/data");

        let ctx = err.context().unwrap();
        assert_eq!(ctx.store.as_deref(), Some("7"));
        assert_eq!(ctx.manager.as_deref(), Some("active"));
        assert_eq!(ctx.environment.as_deref(), Some("/data"));
        assert!(matches!(err.root(), PersistenceError::FatalAccess(_)));
        assert!(err.to_string().contains("store=7"));
    }

    #[test]
    fn test_predicates_see_through_wrappers() {
        let err = PersistenceError::concurrent("locked")
            .into_async(Some(Receipt::from("r1")))
            .with_store("s");
        assert!(err.is_concurrent_access());
        assert!(!err.is_fatal());
        assert_eq!(err.receipt(), Some(&Receipt::from("r1")));
    }

    #[test]
    fn test_into_async_is_not_nested_twice() {
        let err = PersistenceError::persistence("x")
            .into_async(None)
            .into_async(Some(Receipt::from(3u64)));
        match err {
            PersistenceError::Async { receipt, source } => {
                assert!(receipt.is_none());
                assert!(matches!(*source, PersistenceError::Persistence(_)));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_io_conversion() {
        let err: PersistenceError = std::io::Error::other("disk gone").into();
        assert!(matches!(err, PersistenceError::Io(_)));
        assert!(!err.is_illegal_argument());
    }
}
