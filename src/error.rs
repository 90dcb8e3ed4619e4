/// Error taxonomy for the platform
///
/// Every public operation fails with one of these kinds instead of returning
/// empty values on misuse. Install and start failures keep the original cause
/// attached as `source` so callers can walk the chain.

use thiserror::Error;

/// Failures raised while evaluating or assigning an expression
///
/// Each variant carries the original expression text so the message alone is
/// enough to locate the offending model attribute.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExpressionError {
    #[error("Unknown property used in expression: {expression}. Cause: Cannot resolve identifier '{identifier}'")]
    UnknownIdentifier { expression: String, identifier: String },

    #[error("Unknown method used in expression: {expression}. Cause: Cannot find method '{method}'")]
    UnknownMethod { expression: String, method: String },

    #[error("Error while evaluating expression: {expression}. Cause: {cause}")]
    Evaluation { expression: String, cause: String },

    #[error("Syntax error in expression '{expression}': {cause}")]
    Syntax { expression: String, cause: String },
}

/// Main error type of the platform
#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Lifecycle error: {message}")]
    Lifecycle {
        message: String,
        #[source]
        source: Option<Box<PlatformError>>,
    },

    #[error("Deployment error: {message}")]
    Deployment {
        message: String,
        #[source]
        source: Option<Box<PlatformError>>,
    },

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error(transparent)]
    Expression(#[from] ExpressionError),

    #[error("Unavailable: {0}")]
    Unavailable(String),

    #[error("Script error: {0}")]
    Script(String),

    #[error("Parse error in resource '{resource}': {cause}")]
    Parse { resource: String, cause: String },

    #[error("Persistence error: {0}")]
    Persistence(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Extension '{extension}' failed in '{hook}': {cause}")]
    Extension {
        extension: String,
        hook: &'static str,
        cause: String,
    },
}

impl PlatformError {
    /// Lifecycle error without an underlying cause
    pub fn lifecycle(message: impl Into<String>) -> Self {
        Self::Lifecycle {
            message: message.into(),
            source: None,
        }
    }

    /// Lifecycle error wrapping the cause that aborted the transition
    pub fn lifecycle_caused_by(message: impl Into<String>, cause: PlatformError) -> Self {
        Self::Lifecycle {
            message: message.into(),
            source: Some(Box::new(cause)),
        }
    }

    /// Deployment error wrapping the cause raised by the controller
    pub fn deployment_caused_by(message: impl Into<String>, cause: PlatformError) -> Self {
        Self::Deployment {
            message: message.into(),
            source: Some(Box::new(cause)),
        }
    }

    /// Lookup target does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Name or state clash
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// Rejected input
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Lifecycle hook or state failure
    pub fn is_lifecycle(&self) -> bool {
        matches!(self, Self::Lifecycle { .. })
    }

    /// Deployment could not be completed
    pub fn is_deployment(&self) -> bool {
        matches!(self, Self::Deployment { .. })
    }

    /// Full message including every wrapped cause, joined with " → "
    pub fn message_chain(&self) -> String {
        std::iter::successors(
            Some(self as &dyn std::error::Error),
            |err| err.source(),
        )
        .map(|err| err.to_string())
        .collect::<Vec<_>>()
        .join(" → ")
    }
}

/// Convenience result type
pub type Result<T> = std::result::Result<T, PlatformError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_chain_includes_cause() {
        let err = PlatformError::deployment_caused_by(
            "Could not install archive 'orders'",
            PlatformError::Parse {
                resource: "orders.bpmn".to_string(),
                cause: "unexpected end of file".to_string(),
            },
        );

        let chain = err.message_chain();
        assert!(chain.contains("orders"));
        assert!(chain.contains("unexpected end of file"));
        assert!(err.is_deployment());
    }

    #[test]
    fn test_expression_error_is_transparent() {
        let err: PlatformError = ExpressionError::UnknownIdentifier {
            expression: "${foo}".to_string(),
            identifier: "foo".to_string(),
        }
        .into();

        assert!(err.to_string().contains("${foo}"));
        assert!(err.to_string().contains("foo"));
    }
}
