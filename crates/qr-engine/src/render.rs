use serde_json::{Map, Value, json};

use crate::codec;
use crate::engine::FormEngine;
use crate::tree::{NodeId, NodeKind};
use crate::validate::IssueCode;

/// Status labels returned by the renderers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderStatus {
    /// Required questions are still unanswered.
    NeedInput,
    /// Nothing blocks submission.
    Complete,
    /// Answers are present but some violate a constraint.
    Invalid,
}

impl RenderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RenderStatus::NeedInput => "need_input",
            RenderStatus::Complete => "complete",
            RenderStatus::Invalid => "invalid",
        }
    }
}

/// Progress counters over visible questions.
#[derive(Debug, Clone)]
pub struct RenderProgress {
    pub answered: usize,
    pub total: usize,
}

/// One node of the snapshot. Instances of repeating groups appear as siblings.
#[derive(Debug, Clone)]
pub struct RenderNode {
    pub link_id: String,
    pub kind: &'static str,
    pub text: Option<String>,
    pub occurrence: usize,
    pub required: bool,
    pub read_only: bool,
    pub repeats: bool,
    pub max_count: Option<usize>,
    pub visible: bool,
    pub answers: Vec<String>,
    pub options: Vec<String>,
    pub item_control: Option<String>,
    pub issues: Vec<String>,
    pub children: Vec<RenderNode>,
}

/// Renderer-agnostic snapshot of a form.
#[derive(Debug, Clone)]
pub struct RenderPayload {
    pub form_id: Option<String>,
    pub form_title: Option<String>,
    pub questionnaire: Option<String>,
    pub status: RenderStatus,
    pub next_question_id: Option<String>,
    pub progress: RenderProgress,
    pub nodes: Vec<RenderNode>,
    pub form_issues: Vec<String>,
}

pub fn build_render_payload(engine: &FormEngine) -> RenderPayload {
    let nodes: Vec<RenderNode> = engine
        .tree()
        .roots()
        .iter()
        .filter_map(|root| render_node(engine, *root))
        .collect();

    let mut answered = 0;
    let mut total = 0;
    let mut next_question_id = None;
    for node in engine.tree().iter() {
        let id = node.id();
        if node.kind() != NodeKind::Question || !is_visible(engine, id) {
            continue;
        }
        total += 1;
        if engine.answers(id).is_empty() {
            if next_question_id.is_none() && !engine.is_read_only(id) {
                next_question_id = Some(node.link_id().to_string());
            }
        } else {
            answered += 1;
        }
    }

    let report = engine.issues();
    let status = if report.is_valid() {
        RenderStatus::Complete
    } else if report
        .issues()
        .iter()
        .any(|issue| issue.code == IssueCode::Required)
    {
        RenderStatus::NeedInput
    } else {
        RenderStatus::Invalid
    };

    let definition = engine.definition();
    RenderPayload {
        form_id: definition.id.clone(),
        form_title: definition.title.clone(),
        questionnaire: engine.response().questionnaire.clone(),
        status,
        next_question_id,
        progress: RenderProgress { answered, total },
        nodes,
        form_issues: report
            .form_level()
            .into_iter()
            .map(|issue| issue.diagnostics.clone())
            .collect(),
    }
}

fn is_visible(engine: &FormEngine, id: NodeId) -> bool {
    engine.is_enabled(id) && !engine.is_hidden(id)
}

fn render_node(engine: &FormEngine, id: NodeId) -> Option<RenderNode> {
    let node = engine.node(id)?;
    let item = node.item();
    Some(RenderNode {
        link_id: node.link_id().to_string(),
        kind: item.kind.as_str(),
        text: engine.text(id),
        occurrence: node.occurrence(),
        required: engine.is_required(id),
        read_only: engine.is_read_only(id),
        repeats: engine.repeats(id),
        max_count: engine.max_count(id),
        visible: is_visible(engine, id),
        answers: engine.answers(id).iter().map(codec::tokenize).collect(),
        options: engine
            .options(id)
            .available()
            .iter()
            .map(codec::tokenize)
            .collect(),
        item_control: item.item_control().map(str::to_string),
        issues: engine
            .issues()
            .for_node(id)
            .into_iter()
            .map(|issue| issue.diagnostics.clone())
            .collect(),
        children: node
            .children()
            .iter()
            .filter_map(|child| render_node(engine, *child))
            .collect(),
    })
}

/// Render the payload as a structured JSON-friendly value.
pub fn render_json_ui(payload: &RenderPayload) -> Value {
    json!({
        "form_id": payload.form_id,
        "form_title": payload.form_title,
        "questionnaire": payload.questionnaire,
        "status": payload.status.as_str(),
        "next_question_id": payload.next_question_id,
        "progress": {
            "answered": payload.progress.answered,
            "total": payload.progress.total,
        },
        "issues": payload.form_issues,
        "items": payload.nodes.iter().map(node_json).collect::<Vec<_>>(),
    })
}

fn node_json(node: &RenderNode) -> Value {
    let mut map = Map::new();
    map.insert("link_id".into(), Value::String(node.link_id.clone()));
    map.insert("type".into(), Value::String(node.kind.to_string()));
    map.insert(
        "text".into(),
        node.text.clone().map(Value::String).unwrap_or(Value::Null),
    );
    if node.occurrence > 0 {
        map.insert("occurrence".into(), json!(node.occurrence));
    }
    map.insert("required".into(), Value::Bool(node.required));
    map.insert("read_only".into(), Value::Bool(node.read_only));
    map.insert("repeats".into(), Value::Bool(node.repeats));
    if let Some(max) = node.max_count {
        map.insert("max_count".into(), json!(max));
    }
    map.insert("visible".into(), Value::Bool(node.visible));
    if let Some(control) = &node.item_control {
        map.insert("item_control".into(), Value::String(control.clone()));
    }
    if !node.answers.is_empty() {
        map.insert("answers".into(), json!(node.answers));
    }
    if !node.options.is_empty() {
        map.insert("options".into(), json!(node.options));
    }
    if !node.issues.is_empty() {
        map.insert("issues".into(), json!(node.issues));
    }
    if !node.children.is_empty() {
        map.insert(
            "items".into(),
            Value::Array(node.children.iter().map(node_json).collect()),
        );
    }
    Value::Object(map)
}

/// Render the payload as human-friendly text.
pub fn render_text(payload: &RenderPayload) -> String {
    let mut lines = Vec::new();
    let title = payload.form_title.as_deref().unwrap_or("Untitled form");
    match &payload.form_id {
        Some(id) => lines.push(format!("Form: {title} ({id})")),
        None => lines.push(format!("Form: {title}")),
    }
    lines.push(format!(
        "Status: {} ({}/{})",
        payload.status.as_str(),
        payload.progress.answered,
        payload.progress.total
    ));
    if let Some(next_question) = &payload.next_question_id {
        lines.push(format!("Next question: {next_question}"));
    } else {
        lines.push("All visible questions are answered.".to_string());
    }
    for issue in &payload.form_issues {
        lines.push(format!("! {issue}"));
    }

    lines.push("Visible items:".to_string());
    for node in &payload.nodes {
        text_lines(node, 1, &mut lines);
    }
    lines.join("\n")
}

fn text_lines(node: &RenderNode, depth: usize, lines: &mut Vec<String>) {
    if !node.visible {
        return;
    }
    let indent = "  ".repeat(depth);
    let mut entry = format!("{indent}- {}", node.link_id);
    if let Some(text) = &node.text {
        entry.push_str(&format!(" ({text})"));
    }
    if node.required {
        entry.push_str(" [required]");
    }
    if node.read_only {
        entry.push_str(" [read-only]");
    }
    if !node.answers.is_empty() {
        entry.push_str(&format!(" = {}", node.answers.join(", ")));
    }
    lines.push(entry);
    for issue in &node.issues {
        lines.push(format!("{indent}  ! {issue}"));
    }
    for child in &node.children {
        text_lines(child, depth + 1, lines);
    }
}
