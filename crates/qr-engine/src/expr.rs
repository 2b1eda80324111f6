//! Expression slots: per-purpose caches of an evaluated FHIRPath expression.
//!
//! A slot parses its source once. Evaluation results are memoized against the
//! engine revision at which they were computed; any write bumps the revision, so
//! every slot is dirty until its next read.

use std::cell::{Cell, RefCell};
use std::fmt;

use serde::Serialize;
use tracing::{debug, trace};

use crate::fhirpath::{self, Collection, ExpressionError, ExpressionNode, ExpressionResult};

/// What an expression computes. Used in diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExpressionPurpose {
    Variable,
    Enablement,
    Initial,
    Calculated,
    Text,
    ReadOnly,
    Repeats,
    Required,
    MinValue,
    MaxValue,
}

impl ExpressionPurpose {
    pub fn label(self) -> &'static str {
        match self {
            ExpressionPurpose::Variable => "variable",
            ExpressionPurpose::Enablement => "enable-when",
            ExpressionPurpose::Initial => "initial",
            ExpressionPurpose::Calculated => "calculated",
            ExpressionPurpose::Text => "text",
            ExpressionPurpose::ReadOnly => "read-only",
            ExpressionPurpose::Repeats => "repeats",
            ExpressionPurpose::Required => "required",
            ExpressionPurpose::MinValue => "min-value",
            ExpressionPurpose::MaxValue => "max-value",
        }
    }
}

impl fmt::Display for ExpressionPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A classified failure bound to the slot that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotError {
    pub purpose: ExpressionPurpose,
    pub source: String,
    pub error: ExpressionError,
}

impl fmt::Display for SlotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Failed to evaluate {} expression \"{}\" because {}",
            self.purpose,
            self.source,
            self.error.reason()
        )
    }
}

impl std::error::Error for SlotError {}

#[derive(Debug, Default)]
struct SlotState {
    computed_at: Option<u64>,
    /// Last successful result; kept when a later evaluation fails.
    value: Option<Collection>,
    error: Option<SlotError>,
}

#[derive(Debug)]
pub struct ExpressionSlot {
    purpose: ExpressionPurpose,
    source: String,
    parsed: ExpressionResult<ExpressionNode>,
    state: RefCell<SlotState>,
    evaluating: Cell<bool>,
}

impl ExpressionSlot {
    pub fn new(purpose: ExpressionPurpose, source: impl Into<String>) -> Self {
        let source = source.into();
        let parsed = fhirpath::parse(&source);
        Self {
            purpose,
            source,
            parsed,
            state: RefCell::new(SlotState::default()),
            evaluating: Cell::new(false),
        }
    }

    pub fn purpose(&self) -> ExpressionPurpose {
        self.purpose
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Whether the cached result predates `revision`.
    pub fn is_dirty(&self, revision: u64) -> bool {
        self.state.borrow().computed_at != Some(revision)
    }

    /// Forces recomputation on the next read.
    pub fn invalidate(&self) {
        self.state.borrow_mut().computed_at = None;
    }

    /// Cached result for `revision`, computing it with `compute` when dirty.
    ///
    /// Re-entering a slot while it is being evaluated (a variable that depends on
    /// itself) fails with an evaluation error instead of recursing.
    pub fn get(
        &self,
        revision: u64,
        compute: impl FnOnce(&ExpressionNode) -> ExpressionResult<Collection>,
    ) -> Result<Collection, SlotError> {
        {
            let state = self.state.borrow();
            if state.computed_at == Some(revision) {
                return match &state.error {
                    Some(error) => Err(error.clone()),
                    None => Ok(state.value.clone().unwrap_or_default()),
                };
            }
        }
        if self.evaluating.get() {
            return Err(self.failure(ExpressionError::evaluation(
                "it depends on its own result",
            )));
        }

        trace!(purpose = %self.purpose, source = %self.source, revision, "recomputing slot");
        self.evaluating.set(true);
        let outcome = match &self.parsed {
            Ok(node) => compute(node),
            Err(error) => Err(error.clone()),
        };
        self.evaluating.set(false);

        let mut state = self.state.borrow_mut();
        state.computed_at = Some(revision);
        match outcome {
            Ok(value) => {
                state.value = Some(value.clone());
                state.error = None;
                Ok(value)
            }
            Err(error) => {
                let failure = self.failure(error);
                debug!(%failure, "expression slot failed");
                state.error = Some(failure.clone());
                Err(failure)
            }
        }
    }

    /// Last successful result, whether or not it is current.
    pub fn last_value(&self) -> Option<Collection> {
        self.state.borrow().value.clone()
    }

    /// Error recorded by the most recent evaluation.
    pub fn last_error(&self) -> Option<SlotError> {
        self.state.borrow().error.clone()
    }

    fn failure(&self, error: ExpressionError) -> SlotError {
        SlotError {
            purpose: self.purpose,
            source: self.source.clone(),
            error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fhirpath::FhirPathValue;

    #[test]
    fn memoizes_per_revision() {
        let slot = ExpressionSlot::new(ExpressionPurpose::Text, "'x'");
        let calls = Cell::new(0);
        let compute = |_: &ExpressionNode| {
            calls.set(calls.get() + 1);
            Ok(vec![FhirPathValue::String("x".into())])
        };
        slot.get(1, compute).expect("first");
        slot.get(1, compute).expect("cached");
        assert_eq!(calls.get(), 1);
        assert!(slot.is_dirty(2));
        slot.get(2, compute).expect("recomputed");
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn keeps_previous_value_after_failure() {
        let slot = ExpressionSlot::new(ExpressionPurpose::ReadOnly, "%flag");
        slot.get(1, |_| Ok(vec![FhirPathValue::Boolean(true)]))
            .expect("first");
        let error = slot
            .get(2, |_| Err(ExpressionError::unresolved("flag")))
            .unwrap_err();
        assert_eq!(
            error.to_string(),
            "Failed to evaluate read-only expression \"%flag\" because it references unavailable data (%flag)"
        );
        assert_eq!(slot.last_value(), Some(vec![FhirPathValue::Boolean(true)]));
    }

    #[test]
    fn syntax_errors_surface_on_read() {
        let slot = ExpressionSlot::new(ExpressionPurpose::Calculated, "1 +");
        let error = slot.get(1, |_| Ok(Vec::new())).unwrap_err();
        assert_eq!(error.error.kind(), crate::fhirpath::ErrorKind::Syntax);
    }
}
