use thiserror::Error;

/// Canonical strata error taxonomy used across crates.
///
/// Classification guidance:
/// - [`StrataError::Plan`]: logical plan construction failures (unknown column, type mismatch)
/// - [`StrataError::Compile`]: physical compilation failures (schema resolution, unsupported shape)
/// - [`StrataError::Execution`]: runtime operator evaluation failures, tagged with the operator
/// - [`StrataError::Cancelled`]: cancellation observed by an operator and propagated outwards
/// - [`StrataError::InvalidConfig`]: configuration contract violations
/// - [`StrataError::Unsupported`]: valid request for behavior that is not implemented
/// - [`StrataError::Io`]: raw IO failures from std APIs
#[derive(Debug, Error)]
pub enum StrataError {
    /// Logical plan construction failures.
    ///
    /// Examples:
    /// - a referenced column does not exist in the input schema
    /// - summing a non-numeric column
    /// - a filter predicate that is not boolean
    #[error("planning error: {0}")]
    Plan(String),

    /// Physical plan compilation failures.
    ///
    /// Examples:
    /// - the table schema handed to the compiler lacks a projected column
    /// - an expression cannot be resolved against its operator's input schema
    #[error("compile error: {0}")]
    Compile(String),

    /// Runtime failures raised while an operator processes a batch or a
    /// completion signal. `node` identifies the operator that failed and is
    /// empty until the error passes through an operator.
    #[error("execution error in {}: {message}", display_node(.node))]
    Execution {
        /// Identity of the failing operator.
        node: String,
        /// Failure description.
        message: String,
    },

    /// Cancellation observed at a batch boundary or completion call.
    #[error("execution cancelled")]
    Cancelled,

    /// Invalid or inconsistent configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Valid request for a feature/shape not implemented in current version.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Transparent std IO failures.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StrataError {
    /// Build an execution error that is not yet attributed to an operator.
    pub fn execution(message: impl Into<String>) -> Self {
        StrataError::Execution {
            node: String::new(),
            message: message.into(),
        }
    }

    /// Attribute an execution error to `node` unless an inner operator
    /// already claimed it. Other variants pass through unchanged.
    pub fn in_node(self, node: &str) -> Self {
        match self {
            StrataError::Execution { node: n, message } if n.is_empty() => {
                StrataError::Execution {
                    node: node.to_string(),
                    message,
                }
            }
            other => other,
        }
    }

    /// Name of the query stage that produced this error.
    pub fn stage(&self) -> &'static str {
        match self {
            StrataError::Plan(_) => "planning",
            StrataError::Compile(_) => "compilation",
            StrataError::Execution { .. } | StrataError::Cancelled | StrataError::Io(_) => {
                "execution"
            }
            StrataError::InvalidConfig(_) => "configuration",
            StrataError::Unsupported(_) => "planning",
        }
    }

    /// Whether this error is a propagated cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, StrataError::Cancelled)
    }
}

// Manual impl: `std::io::Error` is not `Clone`, so IO errors are rebuilt from
// their kind and message.
impl Clone for StrataError {
    fn clone(&self) -> Self {
        match self {
            StrataError::Plan(m) => StrataError::Plan(m.clone()),
            StrataError::Compile(m) => StrataError::Compile(m.clone()),
            StrataError::Execution { node, message } => StrataError::Execution {
                node: node.clone(),
                message: message.clone(),
            },
            StrataError::Cancelled => StrataError::Cancelled,
            StrataError::InvalidConfig(m) => StrataError::InvalidConfig(m.clone()),
            StrataError::Unsupported(m) => StrataError::Unsupported(m.clone()),
            StrataError::Io(e) => StrataError::Io(std::io::Error::new(e.kind(), e.to_string())),
        }
    }
}

fn display_node(node: &str) -> &str {
    if node.is_empty() {
        "<unknown>"
    } else {
        node
    }
}

/// Standard strata result alias.
pub type Result<T> = std::result::Result<T, StrataError>;
