//! Complex datatypes shared by the definition and response documents.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Canonical system of the units-of-measure coding.
pub const UCUM_SYSTEM: &str = "http://unitsofmeasure.org";

/// A reference to a code defined by a terminology system.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Coding {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
}

impl Coding {
    pub fn new(system: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            system: Some(system.into()),
            code: Some(code.into()),
            ..Self::default()
        }
    }

    pub fn with_display(mut self, display: impl Into<String>) -> Self {
        self.display = Some(display.into());
        self
    }
}

/// A measured amount.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Quantity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comparator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl Quantity {
    /// Quantity coded on the units-of-measure system.
    pub fn ucum(value: f64, code: impl Into<String>) -> Self {
        let code = code.into();
        Self {
            value: Some(value),
            comparator: None,
            unit: Some(code.clone()),
            system: Some(UCUM_SYSTEM.into()),
            code: Some(code),
        }
    }
}

/// Content in a format defined elsewhere.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation: Option<String>,
}

/// A reference from one resource to another.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Reference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
}

/// An expression carried by an extension.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Expression {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
}

impl Expression {
    /// FHIRPath source text, when the expression is written in FHIRPath.
    pub fn fhirpath(&self) -> Option<&str> {
        let language_ok = match self.language.as_deref() {
            None => true,
            Some(language) => language == "text/fhirpath" || language == "fhirpath",
        };
        if language_ok {
            self.expression.as_deref().filter(|text| !text.trim().is_empty())
        } else {
            None
        }
    }
}

/// A single typed answer value. One variant per wire key of `value[x]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AnswerValue {
    #[serde(rename = "valueBoolean")]
    Boolean(bool),
    #[serde(rename = "valueInteger")]
    Integer(i64),
    #[serde(rename = "valueDecimal")]
    Decimal(f64),
    #[serde(rename = "valueString")]
    String(String),
    #[serde(rename = "valueUri")]
    Uri(String),
    #[serde(rename = "valueDate")]
    Date(String),
    #[serde(rename = "valueDateTime")]
    DateTime(String),
    #[serde(rename = "valueTime")]
    Time(String),
    #[serde(rename = "valueCoding")]
    Coding(Coding),
    #[serde(rename = "valueAttachment")]
    Attachment(Attachment),
    #[serde(rename = "valueReference")]
    Reference(Reference),
    #[serde(rename = "valueQuantity")]
    Quantity(Quantity),
}

impl AnswerValue {
    /// Name of the wire key (`valueString`, `valueCoding`, ...).
    pub fn wire_key(&self) -> &'static str {
        match self {
            AnswerValue::Boolean(_) => "valueBoolean",
            AnswerValue::Integer(_) => "valueInteger",
            AnswerValue::Decimal(_) => "valueDecimal",
            AnswerValue::String(_) => "valueString",
            AnswerValue::Uri(_) => "valueUri",
            AnswerValue::Date(_) => "valueDate",
            AnswerValue::DateTime(_) => "valueDateTime",
            AnswerValue::Time(_) => "valueTime",
            AnswerValue::Coding(_) => "valueCoding",
            AnswerValue::Attachment(_) => "valueAttachment",
            AnswerValue::Reference(_) => "valueReference",
            AnswerValue::Quantity(_) => "valueQuantity",
        }
    }
}

/// Wire carrier for the `value[x]` choice element. At most one field is set on
/// well-formed input; when several are present the first in declaration order wins.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ValueChoice {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_boolean: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_integer: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_decimal: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_string: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_date_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_coding: Option<Coding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_attachment: Option<Attachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_reference: Option<Reference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_quantity: Option<Quantity>,
}

impl ValueChoice {
    pub fn value(&self) -> Option<AnswerValue> {
        self.clone().into_value()
    }

    pub fn into_value(self) -> Option<AnswerValue> {
        if let Some(value) = self.value_boolean {
            return Some(AnswerValue::Boolean(value));
        }
        if let Some(value) = self.value_integer {
            return Some(AnswerValue::Integer(value));
        }
        if let Some(value) = self.value_decimal {
            return Some(AnswerValue::Decimal(value));
        }
        if let Some(value) = self.value_string {
            return Some(AnswerValue::String(value));
        }
        if let Some(value) = self.value_uri {
            return Some(AnswerValue::Uri(value));
        }
        if let Some(value) = self.value_date {
            return Some(AnswerValue::Date(value));
        }
        if let Some(value) = self.value_date_time {
            return Some(AnswerValue::DateTime(value));
        }
        if let Some(value) = self.value_time {
            return Some(AnswerValue::Time(value));
        }
        if let Some(value) = self.value_coding {
            return Some(AnswerValue::Coding(value));
        }
        if let Some(value) = self.value_attachment {
            return Some(AnswerValue::Attachment(value));
        }
        if let Some(value) = self.value_reference {
            return Some(AnswerValue::Reference(value));
        }
        self.value_quantity.map(AnswerValue::Quantity)
    }
}

impl From<Option<AnswerValue>> for ValueChoice {
    fn from(value: Option<AnswerValue>) -> Self {
        let mut choice = ValueChoice::default();
        match value {
            None => {}
            Some(AnswerValue::Boolean(value)) => choice.value_boolean = Some(value),
            Some(AnswerValue::Integer(value)) => choice.value_integer = Some(value),
            Some(AnswerValue::Decimal(value)) => choice.value_decimal = Some(value),
            Some(AnswerValue::String(value)) => choice.value_string = Some(value),
            Some(AnswerValue::Uri(value)) => choice.value_uri = Some(value),
            Some(AnswerValue::Date(value)) => choice.value_date = Some(value),
            Some(AnswerValue::DateTime(value)) => choice.value_date_time = Some(value),
            Some(AnswerValue::Time(value)) => choice.value_time = Some(value),
            Some(AnswerValue::Coding(value)) => choice.value_coding = Some(value),
            Some(AnswerValue::Attachment(value)) => choice.value_attachment = Some(value),
            Some(AnswerValue::Reference(value)) => choice.value_reference = Some(value),
            Some(AnswerValue::Quantity(value)) => choice.value_quantity = Some(value),
        }
        choice
    }
}
