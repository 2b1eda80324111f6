use std::cmp::Ordering;

use serde::Serialize;
use serde_json::{Value, json};

use crate::codec;
use crate::datatypes::AnswerValue;
use crate::engine::FormEngine;
use crate::expr::{ExpressionPurpose, SlotError};
use crate::tree::{Node, NodeId, NodeKind};
use crate::visibility::VisibilityMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Information,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum IssueCode {
    Required,
    Value,
    TooLong,
    Structure,
    Invariant,
    Duplicate,
}

impl IssueCode {
    pub fn as_str(self) -> &'static str {
        match self {
            IssueCode::Required => "required",
            IssueCode::Value => "value",
            IssueCode::TooLong => "too-long",
            IssueCode::Structure => "structure",
            IssueCode::Invariant => "invariant",
            IssueCode::Duplicate => "duplicate",
        }
    }
}

/// What an issue is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "scope")]
pub enum IssueOwner {
    Form,
    Node { node: NodeId },
    Answer { node: NodeId, index: usize },
}

impl IssueOwner {
    pub fn node(self) -> Option<NodeId> {
        match self {
            IssueOwner::Form => None,
            IssueOwner::Node { node } | IssueOwner::Answer { node, .. } => Some(node),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Issue {
    pub severity: Severity,
    pub code: IssueCode,
    pub diagnostics: String,
    pub owner: IssueOwner,
    /// Identifier path of the owning item, `/`-separated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

/// Issues of one validation pass. A new pass replaces the whole report.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ValidationReport {
    issues: Vec<Issue>,
}

impl ValidationReport {
    /// No error-severity issues.
    pub fn is_valid(&self) -> bool {
        !self
            .issues
            .iter()
            .any(|issue| issue.severity == Severity::Error)
    }

    pub fn issues(&self) -> &[Issue] {
        &self.issues
    }

    /// Issues owned by the node or by any of its answers.
    pub fn for_node(&self, node: NodeId) -> Vec<&Issue> {
        self.issues
            .iter()
            .filter(|issue| issue.owner.node() == Some(node))
            .collect()
    }

    pub fn for_answer(&self, node: NodeId, index: usize) -> Vec<&Issue> {
        self.issues
            .iter()
            .filter(|issue| issue.owner == IssueOwner::Answer { node, index })
            .collect()
    }

    /// Issues not tied to any node.
    pub fn form_level(&self) -> Vec<&Issue> {
        self.issues
            .iter()
            .filter(|issue| issue.owner == IssueOwner::Form)
            .collect()
    }

    /// OperationOutcome-shaped rendering of the report.
    pub fn to_operation_outcome(&self) -> Value {
        let issue: Vec<Value> = self
            .issues
            .iter()
            .map(|issue| {
                let mut entry = json!({
                    "severity": issue.severity,
                    "code": issue.code.as_str(),
                    "diagnostics": issue.diagnostics,
                });
                if let Some(location) = &issue.location {
                    entry["expression"] = json!([location]);
                }
                entry
            })
            .collect();
        json!({"resourceType": "OperationOutcome", "issue": issue})
    }
}

/// Walks enabled, visible nodes and collects required, bound, length, cardinality
/// and expression issues, plus form-level variable problems.
pub fn validate(engine: &FormEngine) -> ValidationReport {
    let mut issues = Vec::new();

    for duplicate in engine.tree().duplicate_variables() {
        issues.push(Issue {
            severity: Severity::Warning,
            code: IssueCode::Duplicate,
            diagnostics: duplicate.to_string(),
            owner: IssueOwner::Form,
            location: duplicate.owner.and_then(|node| location(engine, node)),
        });
    }
    for error in engine.form_errors() {
        issues.push(Issue {
            severity: Severity::Error,
            code: IssueCode::Invariant,
            diagnostics: error.to_string(),
            owner: IssueOwner::Form,
            location: None,
        });
    }

    for node in engine.tree().iter() {
        let id = node.id();
        if !engine.is_enabled(id) || engine.is_hidden(id) {
            continue;
        }
        let at = location(engine, id);
        let mut push = |severity, code, diagnostics: String, owner| {
            issues.push(Issue {
                severity,
                code,
                diagnostics,
                owner,
                location: at.clone(),
            });
        };

        for error in engine.slot_errors(id) {
            push(
                slot_severity(engine, &error),
                IssueCode::Invariant,
                error.to_string(),
                IssueOwner::Node { node: id },
            );
        }

        match node.kind() {
            NodeKind::Question => check_question(engine, node, &mut push),
            NodeKind::Group => {
                if engine.is_required(id) && !has_content(engine, node) {
                    push(
                        Severity::Error,
                        IssueCode::Required,
                        format!("group '{}' requires at least one answer", node.link_id()),
                        IssueOwner::Node { node: id },
                    );
                }
            }
            NodeKind::Display => {}
        }
    }

    ValidationReport { issues }
}

fn slot_severity(engine: &FormEngine, error: &SlotError) -> Severity {
    if error.purpose == ExpressionPurpose::Enablement
        && engine.config().enablement_fallback != VisibilityMode::Error
    {
        Severity::Warning
    } else {
        Severity::Error
    }
}

fn check_question(
    engine: &FormEngine,
    node: &Node,
    push: &mut impl FnMut(Severity, IssueCode, String, IssueOwner),
) {
    let id = node.id();
    let link_id = node.link_id();
    let answers = engine.answers(id);

    if answers.is_empty() {
        if engine.is_required(id) {
            push(
                Severity::Error,
                IssueCode::Required,
                format!("'{link_id}' is required"),
                IssueOwner::Node { node: id },
            );
        }
        return;
    }

    let count = answers.len();
    let minimum = engine.min_count(id);
    if count < minimum {
        push(
            Severity::Error,
            IssueCode::Structure,
            format!("'{link_id}' needs at least {minimum} answers, found {count}"),
            IssueOwner::Node { node: id },
        );
    }
    if let Some(maximum) = engine.max_count(id)
        && count > maximum
    {
        push(
            Severity::Error,
            IssueCode::Structure,
            format!("'{link_id}' allows at most {maximum} answers, found {count}"),
            IssueOwner::Node { node: id },
        );
    }

    let min_value = engine.min_value(id);
    let max_value = engine.max_value(id);
    let max_length = node.item().max_length.map(|max| max as usize);
    let min_length = node.item().min_length().map(|min| min as usize);

    for (index, answer) in answers.iter().enumerate() {
        let owner = IssueOwner::Answer { node: id, index };
        if let Some(bound) = &min_value
            && codec::compare(answer, bound) == Some(Ordering::Less)
        {
            push(
                Severity::Error,
                IssueCode::Value,
                format!(
                    "'{link_id}' must be at least {}, found {}",
                    codec::tokenize(bound),
                    codec::tokenize(answer)
                ),
                owner,
            );
        }
        if let Some(bound) = &max_value
            && codec::compare(answer, bound) == Some(Ordering::Greater)
        {
            push(
                Severity::Error,
                IssueCode::Value,
                format!(
                    "'{link_id}' must be at most {}, found {}",
                    codec::tokenize(bound),
                    codec::tokenize(answer)
                ),
                owner,
            );
        }
        if let Some(length) = text_length(answer) {
            if let Some(max) = max_length
                && length > max
            {
                push(
                    Severity::Error,
                    IssueCode::TooLong,
                    format!("'{link_id}' allows at most {max} characters, found {length}"),
                    owner,
                );
            }
            if let Some(min) = min_length
                && length < min
            {
                push(
                    Severity::Error,
                    IssueCode::Value,
                    format!("'{link_id}' needs at least {min} characters, found {length}"),
                    owner,
                );
            }
        }
    }
}

fn text_length(value: &AnswerValue) -> Option<usize> {
    match value {
        AnswerValue::String(text) | AnswerValue::Uri(text) => Some(text.chars().count()),
        _ => None,
    }
}

/// Whether any enabled question below `node` holds an answer.
fn has_content(engine: &FormEngine, node: &Node) -> bool {
    node.children().iter().any(|child| {
        engine.is_enabled(*child)
            && engine.node(*child).is_some_and(|child_node| match child_node.kind() {
                NodeKind::Question => !engine.answers(*child).is_empty(),
                NodeKind::Group => has_content(engine, child_node),
                NodeKind::Display => false,
            })
    })
}

fn location(engine: &FormEngine, id: NodeId) -> Option<String> {
    let node = engine.node(id)?;
    let path = engine.index().path(node.link_id())?;
    Some(
        path.iter()
            .map(|segment| segment.link_id())
            .collect::<Vec<_>>()
            .join("/"),
    )
}
