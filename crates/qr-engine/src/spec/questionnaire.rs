use std::sync::Arc;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::datatypes::{AnswerValue, Coding, Expression, Quantity, Reference, ValueChoice};
use crate::spec::extensions;

fn questionnaire_resource_type() -> String {
    "Questionnaire".into()
}

/// Top-level questionnaire definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Questionnaire {
    #[serde(default = "questionnaire_resource_type")]
    pub resource_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contained: Vec<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extension: Vec<Extension>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub item: Vec<Arc<Item>>,
}

impl Questionnaire {
    /// Reference used in a response's `questionnaire` field.
    pub fn canonical_reference(&self) -> String {
        match (&self.url, &self.version) {
            (Some(url), Some(version)) => format!("{url}|{version}"),
            (Some(url), None) => url.clone(),
            (None, _) => match &self.id {
                Some(id) => format!("Questionnaire/{id}"),
                None => "#".into(),
            },
        }
    }

    /// Form-level named variables, in declaration order.
    pub fn variables(&self) -> impl Iterator<Item = &Expression> {
        extensions::variables(&self.extension)
    }
}

/// Kind of a definition item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum ItemType {
    Group,
    Display,
    Boolean,
    Integer,
    Decimal,
    String,
    Text,
    Url,
    Date,
    DateTime,
    Time,
    #[serde(alias = "choice", alias = "open-choice")]
    Coding,
    Attachment,
    Reference,
    Quantity,
}

impl ItemType {
    pub fn is_group(self) -> bool {
        matches!(self, ItemType::Group)
    }

    pub fn is_display(self) -> bool {
        matches!(self, ItemType::Display)
    }

    /// Items that hold answers.
    pub fn is_question(self) -> bool {
        !matches!(self, ItemType::Group | ItemType::Display)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ItemType::Group => "group",
            ItemType::Display => "display",
            ItemType::Boolean => "boolean",
            ItemType::Integer => "integer",
            ItemType::Decimal => "decimal",
            ItemType::String => "string",
            ItemType::Text => "text",
            ItemType::Url => "url",
            ItemType::Date => "date",
            ItemType::DateTime => "dateTime",
            ItemType::Time => "time",
            ItemType::Coding => "coding",
            ItemType::Attachment => "attachment",
            ItemType::Reference => "reference",
            ItemType::Quantity => "quantity",
        }
    }
}

/// Extension holder for a primitive element (`_text`, `_readOnly`, ...).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct Element {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extension: Vec<Extension>,
}

/// A generic extension. Nested extensions are kept so dynamic values can ride
/// along with their static counterpart.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Extension {
    pub url: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extension: Vec<Extension>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_expression: Option<Expression>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_codeable_concept: Option<Value>,
    #[serde(flatten)]
    pub value: ValueChoice,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum EnableWhenOperator {
    #[serde(rename = "exists")]
    Exists,
    #[serde(rename = "=")]
    Equal,
    #[serde(rename = "!=")]
    NotEqual,
    #[serde(rename = ">")]
    Greater,
    #[serde(rename = "<")]
    Less,
    #[serde(rename = ">=")]
    GreaterOrEqual,
    #[serde(rename = "<=")]
    LessOrEqual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum EnableBehavior {
    #[default]
    All,
    Any,
}

/// Static enablement condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EnableWhen {
    pub question: String,
    pub operator: EnableWhenOperator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer_boolean: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer_decimal: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer_integer: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer_date_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer_string: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer_coding: Option<Coding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer_quantity: Option<Quantity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer_reference: Option<Reference>,
}

impl EnableWhen {
    /// The comparison operand as an answer value.
    pub fn answer(&self) -> Option<AnswerValue> {
        if let Some(value) = self.answer_boolean {
            return Some(AnswerValue::Boolean(value));
        }
        if let Some(value) = self.answer_decimal {
            return Some(AnswerValue::Decimal(value));
        }
        if let Some(value) = self.answer_integer {
            return Some(AnswerValue::Integer(value));
        }
        if let Some(value) = &self.answer_date {
            return Some(AnswerValue::Date(value.clone()));
        }
        if let Some(value) = &self.answer_date_time {
            return Some(AnswerValue::DateTime(value.clone()));
        }
        if let Some(value) = &self.answer_time {
            return Some(AnswerValue::Time(value.clone()));
        }
        if let Some(value) = &self.answer_string {
            return Some(AnswerValue::String(value.clone()));
        }
        if let Some(value) = &self.answer_coding {
            return Some(AnswerValue::Coding(value.clone()));
        }
        if let Some(value) = &self.answer_quantity {
            return Some(AnswerValue::Quantity(value.clone()));
        }
        self.answer_reference.clone().map(AnswerValue::Reference)
    }
}

/// A permitted answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AnswerOption {
    #[serde(flatten)]
    pub value: ValueChoice,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_selected: Option<bool>,
}

/// A static initial value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Initial {
    #[serde(flatten)]
    pub value: ValueChoice,
}

/// One definition item. Items are shared behind `Arc` so the path index and the
/// live node tree can hold them without copying subtrees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(rename = "type")]
    pub kind: ItemType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeats: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_only: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub enable_when: Vec<EnableWhen>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_behavior: Option<EnableBehavior>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub answer_option: Vec<AnswerOption>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer_value_set: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub initial: Vec<Initial>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extension: Vec<Extension>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub item: Vec<Arc<Item>>,
    #[serde(default, rename = "_text", skip_serializing_if = "Option::is_none")]
    pub text_element: Option<Element>,
    #[serde(default, rename = "_readOnly", skip_serializing_if = "Option::is_none")]
    pub read_only_element: Option<Element>,
    #[serde(default, rename = "_repeats", skip_serializing_if = "Option::is_none")]
    pub repeats_element: Option<Element>,
    #[serde(default, rename = "_required", skip_serializing_if = "Option::is_none")]
    pub required_element: Option<Element>,
}

impl Item {
    /// Minimal item used by tests and builders.
    pub fn new(link_id: impl Into<String>, kind: ItemType) -> Self {
        Self {
            link_id: Some(link_id.into()),
            text: None,
            kind,
            required: None,
            repeats: None,
            read_only: None,
            max_length: None,
            enable_when: Vec::new(),
            enable_behavior: None,
            answer_option: Vec::new(),
            answer_value_set: None,
            initial: Vec::new(),
            extension: Vec::new(),
            item: Vec::new(),
            text_element: None,
            read_only_element: None,
            repeats_element: None,
            required_element: None,
        }
    }

    pub fn link_id(&self) -> Option<&str> {
        self.link_id.as_deref()
    }

    pub fn has_children(&self) -> bool {
        !self.item.is_empty()
    }

    pub fn is_required(&self) -> bool {
        self.required.unwrap_or(false)
    }

    pub fn is_repeating(&self) -> bool {
        self.repeats.unwrap_or(false)
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.unwrap_or(false)
    }

    pub fn is_hidden(&self) -> bool {
        extensions::find(&self.extension, extensions::HIDDEN)
            .and_then(|ext| ext.value.value_boolean)
            .unwrap_or(false)
    }

    pub fn min_occurs(&self) -> Option<u32> {
        extensions::find(&self.extension, extensions::MIN_OCCURS)
            .and_then(|ext| ext.value.value_integer)
            .and_then(|value| u32::try_from(value).ok())
    }

    pub fn max_occurs(&self) -> Option<u32> {
        extensions::find(&self.extension, extensions::MAX_OCCURS)
            .and_then(|ext| ext.value.value_integer)
            .and_then(|value| u32::try_from(value).ok())
    }

    pub fn min_length(&self) -> Option<u32> {
        extensions::find(&self.extension, extensions::MIN_LENGTH)
            .and_then(|ext| ext.value.value_integer)
            .and_then(|value| u32::try_from(value).ok())
    }

    pub fn variables(&self) -> impl Iterator<Item = &Expression> {
        extensions::variables(&self.extension)
    }

    pub fn initial_values(&self) -> Vec<AnswerValue> {
        self.initial
            .iter()
            .filter_map(|initial| initial.value.value())
            .collect()
    }

    /// Options marked `initialSelected`.
    pub fn initially_selected(&self) -> Vec<AnswerValue> {
        self.answer_option
            .iter()
            .filter(|option| option.initial_selected.unwrap_or(false))
            .filter_map(|option| option.value.value())
            .collect()
    }

    pub fn entry_format(&self) -> Option<&str> {
        extensions::find(&self.extension, extensions::ENTRY_FORMAT)
            .and_then(|ext| ext.value.value_string.as_deref())
    }

    pub fn item_control(&self) -> Option<&str> {
        let ext = extensions::find(&self.extension, extensions::ITEM_CONTROL)?;
        ext.value_codeable_concept
            .as_ref()
            .and_then(|concept| concept.pointer("/coding/0/code"))
            .and_then(Value::as_str)
    }

    pub fn step_value(&self) -> Option<f64> {
        let ext = extensions::find(&self.extension, extensions::SLIDER_STEP_VALUE)?;
        ext.value
            .value_decimal
            .or_else(|| ext.value.value_integer.map(|value| value as f64))
    }

    /// Unit catalog offered for quantity items.
    pub fn unit_options(&self) -> Vec<Coding> {
        self.extension
            .iter()
            .filter(|ext| ext.url == extensions::UNIT_OPTION || ext.url == extensions::UNIT)
            .filter_map(|ext| ext.value.value_coding.clone())
            .collect()
    }
}
