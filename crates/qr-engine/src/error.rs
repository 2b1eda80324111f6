use thiserror::Error;

use crate::locator::LocateError;

/// Caller bugs: an operation that makes no sense for the addressed item.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StructuralError {
    #[error("item '{link_id}' of type {kind} does not hold answers")]
    NotAQuestion { link_id: String, kind: &'static str },
    #[error("{value} cannot be stored on item '{link_id}' of type {kind}")]
    TypeMismatch {
        link_id: String,
        kind: &'static str,
        value: &'static str,
    },
    #[error("answer {index} of item '{link_id}' does not exist")]
    NoSuchAnswer { link_id: String, index: usize },
    #[error("item '{0}' is not a repeating group")]
    NotRepeatingGroup(String),
    #[error("node {0} is not part of the live tree")]
    UnknownNode(usize),
    #[error(transparent)]
    Locate(#[from] LocateError),
}

pub type StructuralResult<T> = Result<T, StructuralError>;
