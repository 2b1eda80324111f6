//! FHIRPath subset used by item expressions.
//!
//! Parsing and evaluation are separate so callers can cache the syntax tree and
//! re-evaluate it whenever the response changes.

mod ast;
mod error;
mod evaluator;
mod functions;
mod parser;
mod tokenizer;
mod value;

pub use ast::ExpressionNode;
pub use error::{ErrorKind, ExpressionError, ExpressionResult};
pub use evaluator::{Environment, Evaluator};
pub use parser::parse;
pub use value::{Collection, FhirPathValue, collection_from_json, singleton_boolean};

/// Parses and evaluates `source` in one step.
pub fn evaluate(
    source: &str,
    input: &Collection,
    env: &dyn Environment,
) -> ExpressionResult<Collection> {
    let node = parse(source)?;
    Evaluator::new(env).evaluate(&node, input)
}
