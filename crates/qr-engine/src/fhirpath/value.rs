use rust_decimal::Decimal;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use serde_json::{Map, Value, json};

use crate::datatypes::{AnswerValue, Coding, Quantity, Reference, UCUM_SYSTEM};
use crate::spec::ItemType;

use super::error::{ExpressionError, ExpressionResult};

/// A single item of a FHIRPath collection.
#[derive(Debug, Clone, PartialEq)]
pub enum FhirPathValue {
    Boolean(bool),
    Integer(i64),
    Decimal(Decimal),
    String(String),
    Date(String),
    DateTime(String),
    Time(String),
    Quantity { value: Decimal, unit: Option<String> },
    /// Complex element or resource, navigated by member name.
    Object(Value),
}

pub type Collection = Vec<FhirPathValue>;

/// Calendar duration words and their units-of-measure codes.
pub(crate) const CALENDAR_CODES: &[(&str, &str)] = &[
    ("year", "a"),
    ("years", "a"),
    ("month", "mo"),
    ("months", "mo"),
    ("week", "wk"),
    ("weeks", "wk"),
    ("day", "d"),
    ("days", "d"),
    ("hour", "h"),
    ("hours", "h"),
    ("minute", "min"),
    ("minutes", "min"),
    ("second", "s"),
    ("seconds", "s"),
    ("millisecond", "ms"),
    ("milliseconds", "ms"),
];

pub(crate) fn calendar_code(unit: &str) -> Option<&'static str> {
    CALENDAR_CODES
        .iter()
        .find(|(word, _)| *word == unit)
        .map(|(_, code)| *code)
}

pub(crate) fn decimal_from_f64(value: f64) -> Option<Decimal> {
    Decimal::from_f64(value).map(|decimal| decimal.normalize())
}

impl FhirPathValue {
    /// Untyped JSON conversion; `null` has no representation.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::Bool(flag) => Some(FhirPathValue::Boolean(*flag)),
            Value::Number(number) => {
                if let Some(integer) = number.as_i64() {
                    Some(FhirPathValue::Integer(integer))
                } else {
                    number
                        .as_f64()
                        .and_then(decimal_from_f64)
                        .map(FhirPathValue::Decimal)
                }
            }
            Value::String(text) => Some(FhirPathValue::String(text.clone())),
            Value::Array(_) | Value::Object(_) => Some(FhirPathValue::Object(value.clone())),
        }
    }

    /// Conversion guided by the element name, so `valueDate` yields a date rather than
    /// a plain string.
    pub fn typed(key: &str, value: &Value) -> Option<Self> {
        let converted = Self::from_json(value)?;
        let typed = match converted {
            FhirPathValue::String(text) => {
                if key.ends_with("DateTime") || key == "authored" || key == "instant" {
                    FhirPathValue::DateTime(text)
                } else if key.ends_with("Date") || key == "date" || key == "birthDate" {
                    FhirPathValue::Date(text)
                } else if key.ends_with("Time") {
                    FhirPathValue::Time(text)
                } else {
                    FhirPathValue::String(text)
                }
            }
            FhirPathValue::Integer(number) if key.ends_with("Decimal") => {
                FhirPathValue::Decimal(Decimal::from(number))
            }
            other => other,
        };
        Some(typed)
    }

    pub fn to_json(&self) -> Value {
        match self {
            FhirPathValue::Boolean(flag) => Value::Bool(*flag),
            FhirPathValue::Integer(number) => json!(number),
            FhirPathValue::Decimal(number) => number
                .to_f64()
                .map(|number| json!(number))
                .unwrap_or(Value::Null),
            FhirPathValue::String(text)
            | FhirPathValue::Date(text)
            | FhirPathValue::DateTime(text)
            | FhirPathValue::Time(text) => Value::String(text.clone()),
            FhirPathValue::Quantity { value, unit } => {
                let mut map = Map::new();
                map.insert(
                    "value".into(),
                    value.to_f64().map(|number| json!(number)).unwrap_or(Value::Null),
                );
                if let Some(unit) = unit {
                    let code = calendar_code(unit).unwrap_or(unit);
                    map.insert("unit".into(), json!(unit));
                    map.insert("system".into(), json!(UCUM_SYSTEM));
                    map.insert("code".into(), json!(code));
                }
                Value::Object(map)
            }
            FhirPathValue::Object(value) => value.clone(),
        }
    }

    /// Type name as used by `is`, `as` and `ofType`.
    pub fn type_name(&self) -> &str {
        match self {
            FhirPathValue::Boolean(_) => "Boolean",
            FhirPathValue::Integer(_) => "Integer",
            FhirPathValue::Decimal(_) => "Decimal",
            FhirPathValue::String(_) => "String",
            FhirPathValue::Date(_) => "Date",
            FhirPathValue::DateTime(_) => "DateTime",
            FhirPathValue::Time(_) => "Time",
            FhirPathValue::Quantity { .. } => "Quantity",
            FhirPathValue::Object(value) => {
                if let Some(resource_type) = value.get("resourceType").and_then(Value::as_str) {
                    resource_type
                } else if value.get("value").is_some_and(Value::is_number)
                    && (value.get("code").is_some() || value.get("unit").is_some())
                {
                    "Quantity"
                } else if value.get("code").is_some() && value.get("system").is_some() {
                    "Coding"
                } else if value.get("reference").is_some() {
                    "Reference"
                } else if value.get("contentType").is_some() || value.get("data").is_some() {
                    "Attachment"
                } else {
                    "Element"
                }
            }
        }
    }

    /// Matches a possibly qualified type specifier (`String`, `System.String`,
    /// `FHIR.string`, `Coding`). Primitive names compare case-insensitively.
    pub fn is_type(&self, specifier: &str) -> bool {
        let name = specifier
            .strip_prefix("System.")
            .or_else(|| specifier.strip_prefix("FHIR."))
            .unwrap_or(specifier);
        let own = self.type_name();
        if own.eq_ignore_ascii_case(name) {
            return true;
        }
        matches!(
            (self, name),
            (FhirPathValue::String(_), "code" | "uri" | "url" | "canonical" | "id" | "markdown")
                | (FhirPathValue::Integer(_), "positiveInt" | "unsignedInt")
        )
    }

    /// Quantity view for comparison and arithmetic: literals, and objects that carry a
    /// numeric `value` and a unit.
    pub fn as_quantity(&self) -> Option<Quantity> {
        match self {
            FhirPathValue::Quantity { value, unit } => {
                let code = unit
                    .as_deref()
                    .map(|unit| calendar_code(unit).unwrap_or(unit).to_string());
                Some(Quantity {
                    value: value.to_f64(),
                    comparator: None,
                    unit: unit.clone(),
                    system: code.as_ref().map(|_| UCUM_SYSTEM.to_string()),
                    code,
                })
            }
            FhirPathValue::Object(value) if self.type_name() == "Quantity" => {
                serde_json::from_value(value.clone()).ok()
            }
            _ => None,
        }
    }

    pub fn as_string(&self) -> Option<&str> {
        match self {
            FhirPathValue::String(text) => Some(text),
            _ => None,
        }
    }

    /// Numeric view used by arithmetic and aggregates.
    pub fn as_decimal(&self) -> Option<Decimal> {
        match self {
            FhirPathValue::Integer(number) => Some(Decimal::from(*number)),
            FhirPathValue::Decimal(number) => Some(*number),
            _ => None,
        }
    }

    /// Converts an engine answer value into its expression representation.
    pub fn from_answer(value: &AnswerValue) -> Self {
        match value {
            AnswerValue::Boolean(flag) => FhirPathValue::Boolean(*flag),
            AnswerValue::Integer(number) => FhirPathValue::Integer(*number),
            AnswerValue::Decimal(number) => decimal_from_f64(*number)
                .map(FhirPathValue::Decimal)
                .unwrap_or(FhirPathValue::Object(json!(number))),
            AnswerValue::String(text) | AnswerValue::Uri(text) => {
                FhirPathValue::String(text.clone())
            }
            AnswerValue::Date(text) => FhirPathValue::Date(text.clone()),
            AnswerValue::DateTime(text) => FhirPathValue::DateTime(text.clone()),
            AnswerValue::Time(text) => FhirPathValue::Time(text.clone()),
            AnswerValue::Coding(coding) => FhirPathValue::Object(json!(coding)),
            AnswerValue::Attachment(attachment) => FhirPathValue::Object(json!(attachment)),
            AnswerValue::Reference(reference) => FhirPathValue::Object(json!(reference)),
            AnswerValue::Quantity(quantity) => FhirPathValue::Object(json!(quantity)),
        }
    }

    /// Converts an expression result into an answer value for an item of `kind`.
    /// `None` when the value has no sensible representation for that type.
    pub fn to_answer(&self, kind: ItemType) -> Option<AnswerValue> {
        let value = match (kind, self) {
            (ItemType::Boolean, FhirPathValue::Boolean(flag)) => AnswerValue::Boolean(*flag),
            (ItemType::Integer, FhirPathValue::Integer(number)) => AnswerValue::Integer(*number),
            (ItemType::Integer, FhirPathValue::Decimal(number)) => {
                AnswerValue::Integer(number.trunc().to_i64()?)
            }
            (ItemType::Decimal, FhirPathValue::Integer(number)) => {
                AnswerValue::Decimal(*number as f64)
            }
            (ItemType::Decimal, FhirPathValue::Decimal(number)) => {
                AnswerValue::Decimal(number.to_f64()?)
            }
            (ItemType::String | ItemType::Text, other) => {
                AnswerValue::String(other.to_display_string()?)
            }
            (ItemType::Url, FhirPathValue::String(text)) => AnswerValue::Uri(text.clone()),
            (ItemType::Date, FhirPathValue::Date(text) | FhirPathValue::String(text)) => {
                AnswerValue::Date(text.clone())
            }
            (ItemType::Date, FhirPathValue::DateTime(text)) => {
                AnswerValue::Date(text.chars().take(10).collect())
            }
            (
                ItemType::DateTime,
                FhirPathValue::DateTime(text) | FhirPathValue::Date(text) | FhirPathValue::String(text),
            ) => AnswerValue::DateTime(text.clone()),
            (ItemType::Time, FhirPathValue::Time(text) | FhirPathValue::String(text)) => {
                AnswerValue::Time(text.clone())
            }
            (ItemType::Coding, FhirPathValue::Object(value)) => {
                AnswerValue::Coding(serde_json::from_value::<Coding>(value.clone()).ok()?)
            }
            (ItemType::Coding, FhirPathValue::String(code)) => AnswerValue::Coding(Coding {
                code: Some(code.clone()),
                ..Coding::default()
            }),
            (ItemType::Reference, FhirPathValue::Object(value)) => {
                AnswerValue::Reference(serde_json::from_value::<Reference>(value.clone()).ok()?)
            }
            (ItemType::Reference, FhirPathValue::String(text)) => AnswerValue::Reference(Reference {
                reference: Some(text.clone()),
                ..Reference::default()
            }),
            (ItemType::Attachment, FhirPathValue::Object(value)) => {
                AnswerValue::Attachment(serde_json::from_value(value.clone()).ok()?)
            }
            (ItemType::Quantity, other) => AnswerValue::Quantity(other.as_quantity()?),
            _ => return None,
        };
        Some(value)
    }

    /// String form used by `toString()` and string-typed answers. Objects other than
    /// quantities have none.
    pub fn to_display_string(&self) -> Option<String> {
        match self {
            FhirPathValue::Boolean(flag) => Some(flag.to_string()),
            FhirPathValue::Integer(number) => Some(number.to_string()),
            FhirPathValue::Decimal(number) => Some(number.normalize().to_string()),
            FhirPathValue::String(text)
            | FhirPathValue::Date(text)
            | FhirPathValue::DateTime(text)
            | FhirPathValue::Time(text) => Some(text.clone()),
            FhirPathValue::Quantity { value, unit } => Some(match unit {
                Some(unit) if calendar_code(unit).is_some() => format!("{value} {unit}"),
                Some(unit) => format!("{value} '{unit}'"),
                None => value.to_string(),
            }),
            FhirPathValue::Object(_) => {
                let quantity = self.as_quantity()?;
                let value = quantity.value?;
                let unit = quantity.code.or(quantity.unit).unwrap_or_default();
                Some(format!("{value} '{unit}'"))
            }
        }
    }
}

/// Flattens a JSON value into a collection: arrays contribute their elements, `null`
/// contributes nothing.
pub fn collection_from_json(value: &Value) -> Collection {
    match value {
        Value::Array(values) => values.iter().filter_map(FhirPathValue::from_json).collect(),
        other => FhirPathValue::from_json(other).into_iter().collect(),
    }
}

/// Singleton evaluation of a collection as a boolean: empty is `None`, a single
/// boolean is itself, any other single item is `true`, several items are an error.
pub fn singleton_boolean(collection: &[FhirPathValue]) -> ExpressionResult<Option<bool>> {
    match collection {
        [] => Ok(None),
        [FhirPathValue::Boolean(flag)] => Ok(Some(*flag)),
        [_] => Ok(Some(true)),
        _ => Err(ExpressionError::evaluation(format!(
            "expected a single boolean but found {} items",
            collection.len()
        ))),
    }
}

/// Single item of a collection, or `None` when empty; more than one is an error.
pub fn singleton<'a>(
    collection: &'a [FhirPathValue],
    what: &str,
) -> ExpressionResult<Option<&'a FhirPathValue>> {
    match collection {
        [] => Ok(None),
        [only] => Ok(Some(only)),
        _ => Err(ExpressionError::evaluation(format!(
            "{what} expects a single item but found {}",
            collection.len()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn types_choice_elements_by_key() {
        assert_eq!(
            FhirPathValue::typed("valueDate", &json!("2024-01-02")),
            Some(FhirPathValue::Date("2024-01-02".into()))
        );
        assert_eq!(
            FhirPathValue::typed("valueDecimal", &json!(3)),
            Some(FhirPathValue::Decimal(Decimal::from(3)))
        );
        assert_eq!(FhirPathValue::typed("valueString", &Value::Null), None);
    }

    #[test]
    fn recognizes_quantity_objects() {
        let value = FhirPathValue::Object(json!({"value": 72, "unit": "kg", "code": "kg"}));
        assert!(value.is_type("Quantity"));
        let quantity = value.as_quantity().expect("quantity");
        assert_eq!(quantity.value, Some(72.0));
        assert_eq!(quantity.code.as_deref(), Some("kg"));
    }

    #[test]
    fn converts_results_to_answers_by_item_type() {
        assert_eq!(
            FhirPathValue::Decimal(Decimal::new(25, 1)).to_answer(ItemType::Decimal),
            Some(AnswerValue::Decimal(2.5))
        );
        assert_eq!(
            FhirPathValue::Integer(4).to_answer(ItemType::String),
            Some(AnswerValue::String("4".into()))
        );
        assert_eq!(FhirPathValue::Boolean(true).to_answer(ItemType::Integer), None);
    }
}
