//! Response document model.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::datatypes::{AnswerValue, ValueChoice};
use crate::spec::Questionnaire;

fn response_resource_type() -> String {
    "QuestionnaireResponse".into()
}

fn default_status() -> String {
    "in-progress".into()
}

/// The answer document being built. Unknown top-level fields are carried through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionnaireResponse {
    #[serde(default = "response_resource_type")]
    pub resource_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub questionnaire: Option<String>,
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub item: Vec<ResponseItem>,
    #[serde(flatten)]
    pub other: BTreeMap<String, Value>,
}

impl QuestionnaireResponse {
    /// Empty response bound to `definition`.
    pub fn for_questionnaire(definition: &Questionnaire) -> Self {
        Self {
            resource_type: response_resource_type(),
            id: None,
            questionnaire: Some(definition.canonical_reference()),
            status: default_status(),
            item: Vec::new(),
            other: BTreeMap::new(),
        }
    }

    /// Fills defaulted top-level fields from the definition.
    pub fn normalize(&mut self, definition: &Questionnaire) {
        if self.resource_type.is_empty() {
            self.resource_type = response_resource_type();
        }
        if self.questionnaire.as_deref().is_none_or(str::is_empty) {
            self.questionnaire = Some(definition.canonical_reference());
        }
        if self.status.is_empty() {
            self.status = default_status();
        }
    }
}

/// One response item. Groups hold `item`, questions hold `answer`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseItem {
    #[serde(default)]
    pub link_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<Vec<Answer>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item: Option<Vec<ResponseItem>>,
}

impl ResponseItem {
    pub fn new(link_id: impl Into<String>, text: Option<String>) -> Self {
        Self {
            link_id: link_id.into(),
            text,
            answer: None,
            item: None,
        }
    }

    pub fn answers(&self) -> &[Answer] {
        self.answer.as_deref().unwrap_or_default()
    }

    pub fn children(&self) -> &[ResponseItem] {
        self.item.as_deref().unwrap_or_default()
    }

    /// Answer values in order, skipping answers that only carry nested items.
    pub fn values(&self) -> impl Iterator<Item = &AnswerValue> {
        self.answers().iter().filter_map(|answer| answer.value.as_ref())
    }
}

/// A single answer: exactly one typed value (or none) plus optional nested items.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(from = "AnswerWire", into = "AnswerWire")]
pub struct Answer {
    pub value: Option<AnswerValue>,
    pub item: Option<Vec<ResponseItem>>,
}

impl Answer {
    pub fn with_value(value: AnswerValue) -> Self {
        Self {
            value: Some(value),
            item: None,
        }
    }

    pub fn has_children(&self) -> bool {
        self.item.as_ref().is_some_and(|items| !items.is_empty())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct AnswerWire {
    #[serde(flatten)]
    value: ValueChoice,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    item: Option<Vec<ResponseItem>>,
}

impl From<AnswerWire> for Answer {
    fn from(wire: AnswerWire) -> Self {
        Self {
            value: wire.value.into_value(),
            item: wire.item,
        }
    }
}

impl From<Answer> for AnswerWire {
    fn from(answer: Answer) -> Self {
        Self {
            value: ValueChoice::from(answer.value),
            item: answer.item,
        }
    }
}
