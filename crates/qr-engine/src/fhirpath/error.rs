use thiserror::Error;

/// Failure classes of expression evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Syntax,
    UnresolvedReference,
    Evaluation,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Syntax => "syntax",
            ErrorKind::UnresolvedReference => "unresolved-reference",
            ErrorKind::Evaluation => "evaluation",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExpressionError {
    /// The source does not parse.
    #[error("syntax error at offset {position}: {message}")]
    Syntax { message: String, position: usize },
    /// The expression names data that is currently absent, such as an unbound
    /// environment constant or a variable whose own evaluation failed.
    #[error("reference to unavailable data %{name}")]
    UnresolvedReference { name: String },
    /// Runtime type or arity mismatch.
    #[error("{0}")]
    Evaluation(String),
}

impl ExpressionError {
    pub fn syntax(message: impl Into<String>, position: usize) -> Self {
        ExpressionError::Syntax {
            message: message.into(),
            position,
        }
    }

    pub fn unresolved(name: impl Into<String>) -> Self {
        ExpressionError::UnresolvedReference { name: name.into() }
    }

    pub fn evaluation(message: impl Into<String>) -> Self {
        ExpressionError::Evaluation(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ExpressionError::Syntax { .. } => ErrorKind::Syntax,
            ExpressionError::UnresolvedReference { .. } => ErrorKind::UnresolvedReference,
            ExpressionError::Evaluation(_) => ErrorKind::Evaluation,
        }
    }

    /// Completes the sentence "Failed to evaluate ... because ...".
    pub fn reason(&self) -> String {
        match self {
            ExpressionError::Syntax { message, position } => {
                format!("it could not be parsed ({message} at offset {position})")
            }
            ExpressionError::UnresolvedReference { name } => {
                format!("it references unavailable data (%{name})")
            }
            ExpressionError::Evaluation(message) => format!("evaluation failed: {message}"),
        }
    }
}

pub type ExpressionResult<T> = Result<T, ExpressionError>;
