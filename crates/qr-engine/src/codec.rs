//! Per-type read/write/clear of answer values, plus equality, ordering and
//! tokenization. Dispatch is a `match` on [`ItemType`] / [`AnswerValue`] so every
//! item type is covered exhaustively.

use std::cmp::Ordering;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};

use crate::datatypes::AnswerValue;
use crate::error::{StructuralError, StructuralResult};
use crate::quantity;
use crate::response::{Answer, ResponseItem};
use crate::spec::ItemType;

/// Whether `value` is a legal answer for an item of type `kind`.
pub fn accepts(kind: ItemType, value: &AnswerValue) -> bool {
    matches!(
        (kind, value),
        (ItemType::Boolean, AnswerValue::Boolean(_))
            | (ItemType::Integer, AnswerValue::Integer(_))
            | (ItemType::Decimal, AnswerValue::Decimal(_))
            | (ItemType::String | ItemType::Text, AnswerValue::String(_))
            | (ItemType::Url, AnswerValue::Uri(_))
            | (ItemType::Date, AnswerValue::Date(_))
            | (ItemType::DateTime, AnswerValue::DateTime(_))
            | (ItemType::Time, AnswerValue::Time(_))
            | (ItemType::Coding, AnswerValue::Coding(_))
            | (ItemType::Coding, AnswerValue::String(_))
            | (ItemType::Attachment, AnswerValue::Attachment(_))
            | (ItemType::Reference, AnswerValue::Reference(_))
            | (ItemType::Quantity, AnswerValue::Quantity(_))
    )
}

fn ensure_question(kind: ItemType, link_id: &str) -> StructuralResult<()> {
    if kind.is_question() {
        Ok(())
    } else {
        Err(StructuralError::NotAQuestion {
            link_id: link_id.to_string(),
            kind: kind.as_str(),
        })
    }
}

/// Rejects values that an item of `kind` can never hold, before anything is touched.
pub fn check(kind: ItemType, link_id: &str, value: &AnswerValue) -> StructuralResult<()> {
    ensure_question(kind, link_id)?;
    if !accepts(kind, value) {
        return Err(StructuralError::TypeMismatch {
            link_id: link_id.to_string(),
            kind: kind.as_str(),
            value: value.wire_key(),
        });
    }
    Ok(())
}

/// Value of answer `index`. Groups and display items never hold values.
pub fn read(kind: ItemType, item: &ResponseItem, index: usize) -> Option<&AnswerValue> {
    if !kind.is_question() {
        return None;
    }
    item.answers().get(index).and_then(|answer| answer.value.as_ref())
}

/// All values of the item, in answer order.
pub fn read_all(kind: ItemType, item: &ResponseItem) -> Vec<&AnswerValue> {
    if !kind.is_question() {
        return Vec::new();
    }
    item.values().collect()
}

/// Replaces answer `index` with a fresh answer holding `value`. Nested items of the
/// replaced answer are carried over. `index == len` appends.
pub fn write(
    kind: ItemType,
    item: &mut ResponseItem,
    index: usize,
    value: AnswerValue,
) -> StructuralResult<()> {
    check(kind, &item.link_id, &value)?;
    let link_id = item.link_id.clone();
    let answers = item.answer.get_or_insert_with(Vec::new);
    if index > answers.len() {
        return Err(StructuralError::NoSuchAnswer { link_id, index });
    }
    if index == answers.len() {
        answers.push(Answer::with_value(value));
    } else {
        let nested = answers[index].item.take();
        answers[index] = Answer {
            value: Some(value),
            item: nested,
        };
    }
    Ok(())
}

/// Replaces all values at once, keeping the nested items of surviving positions.
pub fn write_all(
    kind: ItemType,
    item: &mut ResponseItem,
    values: Vec<AnswerValue>,
) -> StructuralResult<()> {
    ensure_question(kind, &item.link_id)?;
    let count = values.len();
    for (index, value) in values.into_iter().enumerate() {
        write(kind, item, index, value)?;
    }
    if let Some(answers) = item.answer.as_mut() {
        answers.truncate(count);
        if answers.is_empty() {
            item.answer = None;
        }
    }
    Ok(())
}

/// Clears answer `index`. An answer that owns nested items is kept with its value
/// removed; otherwise it is dropped, and the `answer` field disappears once empty.
pub fn clear(kind: ItemType, item: &mut ResponseItem, index: usize) {
    if !kind.is_question() {
        return;
    }
    let Some(answers) = item.answer.as_mut() else {
        return;
    };
    if let Some(answer) = answers.get_mut(index) {
        if answer.has_children() {
            answer.value = None;
        } else {
            answers.remove(index);
        }
    }
    if answers.is_empty() {
        item.answer = None;
    }
}

/// Clears every answer, keeping those that own nested items.
pub fn clear_all(kind: ItemType, item: &mut ResponseItem) {
    let count = item.answers().len();
    for index in (0..count).rev() {
        clear(kind, item, index);
    }
}

/// Removes answer `index` together with any items nested under it.
pub fn remove(kind: ItemType, item: &mut ResponseItem, index: usize) -> StructuralResult<()> {
    ensure_question(kind, &item.link_id)?;
    let link_id = item.link_id.clone();
    let answers = item
        .answer
        .as_mut()
        .filter(|answers| index < answers.len())
        .ok_or(StructuralError::NoSuchAnswer { link_id, index })?;
    answers.remove(index);
    if answers.is_empty() {
        item.answer = None;
    }
    Ok(())
}

/// Keeps the first `max` answers that carry a value and drops the later ones.
/// Answers without a value stay when they own nested items.
pub fn truncate(kind: ItemType, item: &mut ResponseItem, max: usize) {
    if !kind.is_question() {
        return;
    }
    if let Some(answers) = item.answer.as_mut() {
        let mut kept = 0;
        answers.retain(|answer| {
            if answer.value.is_none() {
                return answer.has_children();
            }
            kept += 1;
            kept <= max
        });
        if answers.is_empty() {
            item.answer = None;
        }
    }
}

/// Type-aware equality. Values of unrelated types are never equal; quantities
/// that cannot be compared are not equal either.
pub fn equals(a: &AnswerValue, b: &AnswerValue) -> bool {
    match (a, b) {
        (AnswerValue::Coding(left), AnswerValue::Coding(right)) => {
            if left.code.is_some() || right.code.is_some() {
                left.code == right.code && left.system == right.system
            } else {
                left.display == right.display
            }
        }
        (AnswerValue::Quantity(left), AnswerValue::Quantity(right)) => {
            quantity::equals(left, right).unwrap_or(false)
        }
        (AnswerValue::Reference(left), AnswerValue::Reference(right)) => {
            left.reference == right.reference
        }
        (AnswerValue::Coding(coding), AnswerValue::String(text))
        | (AnswerValue::String(text), AnswerValue::Coding(coding)) => {
            coding.code.as_deref() == Some(text.as_str())
                || coding.display.as_deref() == Some(text.as_str())
        }
        _ => compare(a, b) == Some(Ordering::Equal) || a == b,
    }
}

/// Type-aware ordering. `None` when the pair has no meaningful order.
pub fn compare(a: &AnswerValue, b: &AnswerValue) -> Option<Ordering> {
    match (a, b) {
        (AnswerValue::Boolean(left), AnswerValue::Boolean(right)) => Some(left.cmp(right)),
        (AnswerValue::Integer(left), AnswerValue::Integer(right)) => Some(left.cmp(right)),
        (AnswerValue::Decimal(left), AnswerValue::Decimal(right)) => left.partial_cmp(right),
        (AnswerValue::Integer(left), AnswerValue::Decimal(right)) => {
            (*left as f64).partial_cmp(right)
        }
        (AnswerValue::Decimal(left), AnswerValue::Integer(right)) => {
            left.partial_cmp(&(*right as f64))
        }
        (AnswerValue::String(left), AnswerValue::String(right))
        | (AnswerValue::Uri(left), AnswerValue::Uri(right)) => Some(left.cmp(right)),
        (AnswerValue::Date(left), AnswerValue::Date(right)) => compare_dates(left, right),
        (AnswerValue::DateTime(left), AnswerValue::DateTime(right)) => {
            compare_date_times(left, right)
        }
        (AnswerValue::Date(left), AnswerValue::DateTime(right))
        | (AnswerValue::DateTime(left), AnswerValue::Date(right)) => {
            compare_date_times(left, right)
        }
        (AnswerValue::Time(left), AnswerValue::Time(right)) => compare_times(left, right),
        (AnswerValue::Quantity(left), AnswerValue::Quantity(right)) => {
            quantity::ordering(left, right)
        }
        _ => None,
    }
}

/// Stable textual token for a value; used for display, option matching and
/// string-length checks.
pub fn tokenize(value: &AnswerValue) -> String {
    match value {
        AnswerValue::Boolean(flag) => flag.to_string(),
        AnswerValue::Integer(number) => number.to_string(),
        AnswerValue::Decimal(number) => number.to_string(),
        AnswerValue::String(text)
        | AnswerValue::Uri(text)
        | AnswerValue::Date(text)
        | AnswerValue::DateTime(text)
        | AnswerValue::Time(text) => text.clone(),
        AnswerValue::Coding(coding) => coding
            .display
            .clone()
            .or_else(|| coding.code.clone())
            .unwrap_or_default(),
        AnswerValue::Attachment(attachment) => attachment
            .title
            .clone()
            .or_else(|| attachment.url.clone())
            .unwrap_or_default(),
        AnswerValue::Reference(reference) => reference
            .display
            .clone()
            .or_else(|| reference.reference.clone())
            .unwrap_or_default(),
        AnswerValue::Quantity(quantity) => {
            let number = quantity
                .value
                .map(|value| value.to_string())
                .unwrap_or_default();
            let unit = quantity
                .unit
                .as_deref()
                .or(quantity.code.as_deref())
                .unwrap_or_default();
            let comparator = quantity.comparator.as_deref().unwrap_or_default();
            format!("{comparator}{number} {unit}").trim().to_string()
        }
    }
}

/// Parses a possibly partial FHIR date (`YYYY`, `YYYY-MM`, `YYYY-MM-DD`).
fn date_parts(text: &str) -> Option<(usize, NaiveDate)> {
    let text = text.trim();
    match text.len() {
        4 => NaiveDate::parse_from_str(&format!("{text}-01-01"), "%Y-%m-%d")
            .ok()
            .map(|date| (1, date)),
        7 => NaiveDate::parse_from_str(&format!("{text}-01"), "%Y-%m-%d")
            .ok()
            .map(|date| (2, date)),
        _ => NaiveDate::parse_from_str(text, "%Y-%m-%d")
            .ok()
            .map(|date| (3, date)),
    }
}

pub(crate) fn compare_dates(left: &str, right: &str) -> Option<Ordering> {
    let (left_precision, left) = date_parts(left)?;
    let (right_precision, right) = date_parts(right)?;
    if left_precision == right_precision {
        Some(left.cmp(&right))
    } else {
        // Different precisions only order when they differ at the shared precision.
        let ordering = left.cmp(&right);
        let shared = left_precision.min(right_precision);
        let differs = match shared {
            1 => left.format("%Y").to_string() != right.format("%Y").to_string(),
            _ => left.format("%Y-%m").to_string() != right.format("%Y-%m").to_string(),
        };
        differs.then_some(ordering)
    }
}

fn parse_date_time(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Some(parsed.naive_utc());
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M"] {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(text, format) {
            return Some(parsed);
        }
    }
    date_parts(text).and_then(|(_, date)| date.and_hms_opt(0, 0, 0))
}

pub(crate) fn compare_date_times(left: &str, right: &str) -> Option<Ordering> {
    if !left.contains('T') && !right.contains('T') {
        return compare_dates(left, right);
    }
    Some(parse_date_time(left)?.cmp(&parse_date_time(right)?))
}

fn parse_time(text: &str) -> Option<NaiveTime> {
    let text = text.trim().trim_start_matches('T');
    ["%H:%M:%S%.f", "%H:%M:%S", "%H:%M"]
        .iter()
        .find_map(|format| NaiveTime::parse_from_str(text, format).ok())
}

pub(crate) fn compare_times(left: &str, right: &str) -> Option<Ordering> {
    Some(parse_time(left)?.cmp(&parse_time(right)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item(value: serde_json::Value) -> ResponseItem {
        serde_json::from_value(value).expect("item")
    }

    #[test]
    fn truncate_counts_values_and_keeps_answers_owning_items() {
        let mut stored = item(json!({
            "linkId": "q",
            "answer": [
                {"item": [{"linkId": "note", "answer": [{"valueString": "kept"}]}]},
                {"valueString": "A"},
                {"valueString": "B"}
            ]
        }));
        truncate(ItemType::String, &mut stored, 1);

        let values: Vec<&AnswerValue> = stored.values().collect();
        assert_eq!(values, vec![&AnswerValue::String("A".into())]);
        assert_eq!(stored.answers().len(), 2);
        assert!(stored.answers()[0].has_children());
    }

    #[test]
    fn write_all_replaces_every_answer() {
        let mut stored = item(json!({
            "linkId": "q",
            "answer": [{"valueString": "A"}, {"valueString": "B"}, {"valueString": "C"}]
        }));
        write_all(ItemType::String, &mut stored, vec![AnswerValue::String("X".into())])
            .expect("write");
        assert_eq!(stored.answers().len(), 1);
        assert_eq!(read(ItemType::String, &stored, 0), Some(&AnswerValue::String("X".into())));
    }
}
