//! Tree-walking evaluation of parsed expressions over JSON-backed collections.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Duration, Months, NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde_json::Value;

use crate::codec;
use crate::quantity;

use super::ast::{BinaryOperator, ExpressionNode, Literal, TypeOperator, UnaryOperator};
use super::error::{ExpressionError, ExpressionResult};
use super::value::{Collection, FhirPathValue, calendar_code, singleton, singleton_boolean};

/// Source of `%name` bindings.
///
/// `None` means the name is unknown; `Some(Err(..))` means it is known but its value
/// is currently unavailable.
pub trait Environment {
    fn constant(&self, name: &str) -> Option<ExpressionResult<Collection>>;
}

impl Environment for HashMap<String, Collection> {
    fn constant(&self, name: &str) -> Option<ExpressionResult<Collection>> {
        self.get(name).cloned().map(Ok)
    }
}

impl Environment for BTreeMap<String, Collection> {
    fn constant(&self, name: &str) -> Option<ExpressionResult<Collection>> {
        self.get(name).cloned().map(Ok)
    }
}

/// Iteration state visible through `$this`, `$index` and `$total`.
#[derive(Debug, Clone, Default)]
pub(super) struct Frame {
    pub this: Collection,
    pub index: Option<i64>,
    pub total: Option<Collection>,
}

impl Frame {
    fn root(input: &Collection) -> Self {
        Self {
            this: input.clone(),
            ..Self::default()
        }
    }
}

pub struct Evaluator<'env> {
    env: &'env dyn Environment,
}

impl<'env> Evaluator<'env> {
    pub fn new(env: &'env dyn Environment) -> Self {
        Self { env }
    }

    pub fn evaluate(
        &self,
        node: &ExpressionNode,
        input: &Collection,
    ) -> ExpressionResult<Collection> {
        self.eval(node, input, &Frame::root(input))
    }

    pub(super) fn eval(
        &self,
        node: &ExpressionNode,
        input: &Collection,
        frame: &Frame,
    ) -> ExpressionResult<Collection> {
        match node {
            ExpressionNode::Literal(literal) => Ok(vec![literal_value(literal)]),
            ExpressionNode::Empty => Ok(Vec::new()),
            ExpressionNode::Identifier(name) => Ok(navigate_root(input, name)),
            ExpressionNode::Constant(name) => self
                .env
                .constant(name)
                .unwrap_or_else(|| Err(ExpressionError::unresolved(name.clone()))),
            ExpressionNode::This => Ok(frame.this.clone()),
            ExpressionNode::Index => Ok(frame
                .index
                .map(FhirPathValue::Integer)
                .into_iter()
                .collect()),
            ExpressionNode::Total => Ok(frame.total.clone().unwrap_or_default()),
            ExpressionNode::Member { target, name } => {
                let base = self.eval(target, input, frame)?;
                Ok(navigate(&base, name))
            }
            ExpressionNode::Function { target, name, args } => {
                let focus = match target {
                    Some(target) => self.eval(target, input, frame)?,
                    None => input.clone(),
                };
                self.call(name, &focus, args, input, frame)
            }
            ExpressionNode::Indexer { target, index } => {
                let base = self.eval(target, input, frame)?;
                let index = self.eval(index, input, frame)?;
                match singleton(&index, "indexer")? {
                    None => Ok(Vec::new()),
                    Some(FhirPathValue::Integer(position)) => Ok(usize::try_from(*position)
                        .ok()
                        .and_then(|position| base.get(position).cloned())
                        .into_iter()
                        .collect()),
                    Some(other) => Err(ExpressionError::evaluation(format!(
                        "index must be an integer, found {}",
                        other.type_name()
                    ))),
                }
            }
            ExpressionNode::Unary { op, operand } => {
                let value = self.eval(operand, input, frame)?;
                match (op, singleton(&value, "unary operator")?) {
                    (_, None) => Ok(Vec::new()),
                    (UnaryOperator::Plus, Some(_)) => Ok(value),
                    (UnaryOperator::Minus, Some(item)) => Ok(vec![negate(item)?]),
                }
            }
            ExpressionNode::Binary { op, left, right } => {
                self.binary(*op, left, right, input, frame)
            }
            ExpressionNode::Type {
                op,
                operand,
                type_name,
            } => {
                let value = self.eval(operand, input, frame)?;
                match op {
                    TypeOperator::Is => Ok(singleton(&value, "is")?
                        .map(|item| FhirPathValue::Boolean(item.is_type(type_name)))
                        .into_iter()
                        .collect()),
                    TypeOperator::As => Ok(value
                        .into_iter()
                        .filter(|item| item.is_type(type_name))
                        .collect()),
                }
            }
        }
    }

    fn binary(
        &self,
        op: BinaryOperator,
        left: &ExpressionNode,
        right: &ExpressionNode,
        input: &Collection,
        frame: &Frame,
    ) -> ExpressionResult<Collection> {
        let lhs = self.eval(left, input, frame)?;

        // Boolean operators short-circuit once the left side decides the result.
        match op {
            BinaryOperator::And | BinaryOperator::Or | BinaryOperator::Implies => {
                let left_value = singleton_boolean(&lhs)?;
                let decided = match (op, left_value) {
                    (BinaryOperator::And, Some(false)) => Some(false),
                    (BinaryOperator::Or, Some(true)) => Some(true),
                    (BinaryOperator::Implies, Some(false)) => Some(true),
                    _ => None,
                };
                if let Some(result) = decided {
                    return Ok(vec![FhirPathValue::Boolean(result)]);
                }
                let right_value = singleton_boolean(&self.eval(right, input, frame)?)?;
                return Ok(boolean_result(logic(op, left_value, right_value)));
            }
            _ => {}
        }

        let rhs = self.eval(right, input, frame)?;
        match op {
            BinaryOperator::Xor => {
                let result = match (singleton_boolean(&lhs)?, singleton_boolean(&rhs)?) {
                    (Some(left), Some(right)) => Some(left != right),
                    _ => None,
                };
                Ok(boolean_result(result))
            }
            BinaryOperator::Union => Ok(union(lhs, rhs)),
            BinaryOperator::Equal => Ok(boolean_result(collection_equals(&lhs, &rhs))),
            BinaryOperator::NotEqual => Ok(boolean_result(
                collection_equals(&lhs, &rhs).map(|equal| !equal),
            )),
            BinaryOperator::Equivalent => {
                Ok(vec![FhirPathValue::Boolean(collection_equivalent(&lhs, &rhs))])
            }
            BinaryOperator::NotEquivalent => {
                Ok(vec![FhirPathValue::Boolean(!collection_equivalent(&lhs, &rhs))])
            }
            BinaryOperator::Less
            | BinaryOperator::LessOrEqual
            | BinaryOperator::Greater
            | BinaryOperator::GreaterOrEqual => {
                let (Some(left), Some(right)) =
                    (singleton(&lhs, "comparison")?, singleton(&rhs, "comparison")?)
                else {
                    return Ok(Vec::new());
                };
                let result = compare(left, right)?.map(|ordering| match op {
                    BinaryOperator::Less => ordering == Ordering::Less,
                    BinaryOperator::LessOrEqual => ordering != Ordering::Greater,
                    BinaryOperator::Greater => ordering == Ordering::Greater,
                    _ => ordering != Ordering::Less,
                });
                Ok(boolean_result(result))
            }
            BinaryOperator::In => membership(&lhs, &rhs),
            BinaryOperator::Contains => membership(&rhs, &lhs),
            BinaryOperator::Concatenate => {
                let text = |collection: &Collection| -> ExpressionResult<String> {
                    Ok(singleton(collection, "&")?
                        .and_then(FhirPathValue::to_display_string)
                        .unwrap_or_default())
                };
                Ok(vec![FhirPathValue::String(format!(
                    "{}{}",
                    text(&lhs)?,
                    text(&rhs)?
                ))])
            }
            BinaryOperator::Multiply
            | BinaryOperator::Divide
            | BinaryOperator::IntegerDivide
            | BinaryOperator::Modulo
            | BinaryOperator::Add
            | BinaryOperator::Subtract => {
                let (Some(left), Some(right)) =
                    (singleton(&lhs, "arithmetic")?, singleton(&rhs, "arithmetic")?)
                else {
                    return Ok(Vec::new());
                };
                Ok(arithmetic(op, left, right)?.into_iter().collect())
            }
            BinaryOperator::And | BinaryOperator::Or | BinaryOperator::Implies => Ok(
                boolean_result(logic(op, singleton_boolean(&lhs)?, singleton_boolean(&rhs)?)),
            ),
        }
    }
}

fn literal_value(literal: &Literal) -> FhirPathValue {
    match literal {
        Literal::Boolean(flag) => FhirPathValue::Boolean(*flag),
        Literal::String(text) => FhirPathValue::String(text.clone()),
        Literal::Integer(number) => FhirPathValue::Integer(*number),
        Literal::Decimal(number) => FhirPathValue::Decimal(*number),
        Literal::Date(text) => FhirPathValue::Date(text.clone()),
        Literal::DateTime(text) => FhirPathValue::DateTime(text.clone()),
        Literal::Time(text) => FhirPathValue::Time(text.clone()),
        Literal::Quantity { value, unit } => FhirPathValue::Quantity {
            value: *value,
            unit: Some(unit.clone()),
        },
    }
}

fn boolean_result(result: Option<bool>) -> Collection {
    result.map(FhirPathValue::Boolean).into_iter().collect()
}

fn logic(op: BinaryOperator, left: Option<bool>, right: Option<bool>) -> Option<bool> {
    match op {
        BinaryOperator::And => match (left, right) {
            (Some(false), _) | (_, Some(false)) => Some(false),
            (Some(true), Some(true)) => Some(true),
            _ => None,
        },
        BinaryOperator::Or => match (left, right) {
            (Some(true), _) | (_, Some(true)) => Some(true),
            (Some(false), Some(false)) => Some(false),
            _ => None,
        },
        BinaryOperator::Implies => match (left, right) {
            (Some(false), _) | (_, Some(true)) => Some(true),
            (Some(true), right) => right,
            _ => None,
        },
        _ => None,
    }
}

/// Identifier at the start of a path: a type name matching the focus resource selects
/// the focus itself, anything else is a member of it.
fn navigate_root(input: &Collection, name: &str) -> Collection {
    let mut output = Vec::new();
    for item in input {
        if let FhirPathValue::Object(value) = item
            && value.get("resourceType").and_then(Value::as_str) == Some(name)
        {
            output.push(item.clone());
            continue;
        }
        output.extend(navigate(std::slice::from_ref(item), name));
    }
    output
}

/// Member access. `value` also matches choice elements such as `valueCoding`.
pub(super) fn navigate(input: &[FhirPathValue], name: &str) -> Collection {
    let mut output = Vec::new();
    for item in input {
        let FhirPathValue::Object(Value::Object(map)) = item else {
            continue;
        };
        if let Some(child) = map.get(name) {
            push_typed(&mut output, name, child);
            continue;
        }
        for (key, child) in map {
            let is_choice = key
                .strip_prefix(name)
                .and_then(|rest| rest.chars().next())
                .is_some_and(|first| first.is_ascii_uppercase());
            if is_choice {
                push_typed(&mut output, key, child);
            }
        }
    }
    output
}

fn push_typed(output: &mut Collection, key: &str, value: &Value) {
    match value {
        Value::Array(values) => {
            output.extend(values.iter().filter_map(|value| FhirPathValue::typed(key, value)))
        }
        other => output.extend(FhirPathValue::typed(key, other)),
    }
}

/// All direct child values of the objects in `input`.
pub(super) fn children(input: &[FhirPathValue]) -> Collection {
    let mut output = Vec::new();
    for item in input {
        if let FhirPathValue::Object(Value::Object(map)) = item {
            for (key, child) in map {
                if key != "resourceType" {
                    push_typed(&mut output, key, child);
                }
            }
        }
    }
    output
}

fn negate(value: &FhirPathValue) -> ExpressionResult<FhirPathValue> {
    match value {
        FhirPathValue::Integer(number) => Ok(FhirPathValue::Integer(-*number)),
        FhirPathValue::Decimal(number) => Ok(FhirPathValue::Decimal(-*number)),
        FhirPathValue::Quantity { value, unit } => Ok(FhirPathValue::Quantity {
            value: -*value,
            unit: unit.clone(),
        }),
        other => Err(ExpressionError::evaluation(format!(
            "cannot negate {}",
            other.type_name()
        ))),
    }
}

pub(super) fn union(left: Collection, right: Collection) -> Collection {
    let mut output: Collection = Vec::new();
    for item in left.into_iter().chain(right) {
        if !output.iter().any(|seen| equals(seen, &item) == Some(true)) {
            output.push(item);
        }
    }
    output
}

fn membership(needle: &Collection, haystack: &Collection) -> ExpressionResult<Collection> {
    let Some(item) = singleton(needle, "membership")? else {
        return Ok(Vec::new());
    };
    let found = haystack
        .iter()
        .any(|candidate| equals(item, candidate) == Some(true));
    Ok(vec![FhirPathValue::Boolean(found)])
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Temporal {
    Date,
    DateTime,
    Time,
}

fn temporal(value: &FhirPathValue) -> Option<(Temporal, &str)> {
    match value {
        FhirPathValue::Date(text) => Some((Temporal::Date, text)),
        FhirPathValue::DateTime(text) => Some((Temporal::DateTime, text)),
        FhirPathValue::Time(text) => Some((Temporal::Time, text)),
        _ => None,
    }
}

fn compare_temporal(left: &FhirPathValue, right: &FhirPathValue) -> Option<Option<Ordering>> {
    let (left_kind, left_text, right_kind, right_text) = match (temporal(left), temporal(right)) {
        (Some((lk, lt)), Some((rk, rt))) => (lk, lt, rk, rt),
        (Some((lk, lt)), None) => (lk, lt, lk, right.as_string()?),
        (None, Some((rk, rt))) => (rk, left.as_string()?, rk, rt),
        (None, None) => return None,
    };
    let ordering = match (left_kind, right_kind) {
        (Temporal::Date, Temporal::Date) => codec::compare_dates(left_text, right_text),
        (Temporal::Time, Temporal::Time) => codec::compare_times(left_text, right_text),
        (Temporal::Time, _) | (_, Temporal::Time) => None,
        _ => codec::compare_date_times(left_text, right_text),
    };
    Some(ordering)
}

/// Item equality. `None` means the pair is not comparable (mismatched precision or
/// units), which propagates as an empty result.
pub(super) fn equals(left: &FhirPathValue, right: &FhirPathValue) -> Option<bool> {
    if let (Some(a), Some(b)) = (left.as_decimal(), right.as_decimal()) {
        return Some(a == b);
    }
    if let Some(ordering) = compare_temporal(left, right) {
        return ordering.map(|ordering| ordering == Ordering::Equal);
    }
    if let (Some(a), Some(b)) = (left.as_quantity(), right.as_quantity()) {
        return quantity::equals(&a, &b);
    }
    match (left, right) {
        (FhirPathValue::Boolean(a), FhirPathValue::Boolean(b)) => Some(a == b),
        (FhirPathValue::String(a), FhirPathValue::String(b)) => Some(a == b),
        (FhirPathValue::Object(a), FhirPathValue::Object(b)) => Some(a == b),
        _ => Some(false),
    }
}

fn collection_equals(left: &Collection, right: &Collection) -> Option<bool> {
    if left.is_empty() || right.is_empty() {
        return None;
    }
    if left.len() != right.len() {
        return Some(false);
    }
    let mut result = Some(true);
    for (a, b) in left.iter().zip(right) {
        match equals(a, b) {
            Some(false) => return Some(false),
            None => result = None,
            Some(true) => {}
        }
    }
    result
}

fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

pub(super) fn equivalent(left: &FhirPathValue, right: &FhirPathValue) -> bool {
    match (left, right) {
        (FhirPathValue::String(a), FhirPathValue::String(b)) => {
            normalize_text(a) == normalize_text(b)
        }
        (FhirPathValue::Object(a), FhirPathValue::Object(b))
            if left.type_name() == "Coding" && right.type_name() == "Coding" =>
        {
            a.get("system") == b.get("system") && a.get("code") == b.get("code")
        }
        _ => equals(left, right) == Some(true),
    }
}

fn collection_equivalent(left: &Collection, right: &Collection) -> bool {
    left.len() == right.len()
        && left
            .iter()
            .all(|a| right.iter().any(|b| equivalent(a, b)))
}

/// Ordering for `<`, `<=`, `>`, `>=`. `Ok(None)` when the values are of comparable
/// types but cannot be ordered; an error when the types never order.
pub(super) fn compare(
    left: &FhirPathValue,
    right: &FhirPathValue,
) -> ExpressionResult<Option<Ordering>> {
    if let (Some(a), Some(b)) = (left.as_decimal(), right.as_decimal()) {
        return Ok(Some(a.cmp(&b)));
    }
    if let Some(ordering) = compare_temporal(left, right) {
        return Ok(ordering);
    }
    if let (Some(a), Some(b)) = (left.as_quantity(), right.as_quantity()) {
        return Ok(quantity::ordering(&a, &b));
    }
    if let (FhirPathValue::String(a), FhirPathValue::String(b)) = (left, right) {
        return Ok(Some(a.cmp(b)));
    }
    Err(ExpressionError::evaluation(format!(
        "cannot compare {} with {}",
        left.type_name(),
        right.type_name()
    )))
}

fn arithmetic(
    op: BinaryOperator,
    left: &FhirPathValue,
    right: &FhirPathValue,
) -> ExpressionResult<Option<FhirPathValue>> {
    if let (FhirPathValue::Integer(a), FhirPathValue::Integer(b)) = (left, right) {
        let result = match op {
            BinaryOperator::Add => a.checked_add(*b).map(FhirPathValue::Integer),
            BinaryOperator::Subtract => a.checked_sub(*b).map(FhirPathValue::Integer),
            BinaryOperator::Multiply => a.checked_mul(*b).map(FhirPathValue::Integer),
            BinaryOperator::IntegerDivide => a.checked_div(*b).map(FhirPathValue::Integer),
            BinaryOperator::Modulo => a.checked_rem(*b).map(FhirPathValue::Integer),
            _ => Decimal::from(*a)
                .checked_div(Decimal::from(*b))
                .map(FhirPathValue::Decimal),
        };
        return Ok(result);
    }

    if let (Some(a), Some(b)) = (left.as_decimal(), right.as_decimal()) {
        let result = match op {
            BinaryOperator::Add => a.checked_add(b),
            BinaryOperator::Subtract => a.checked_sub(b),
            BinaryOperator::Multiply => a.checked_mul(b),
            BinaryOperator::Divide => a.checked_div(b),
            BinaryOperator::IntegerDivide => {
                return Ok(a
                    .checked_div(b)
                    .and_then(|quotient| quotient.trunc().to_i64())
                    .map(FhirPathValue::Integer));
            }
            _ => a.checked_rem(b),
        };
        return Ok(result.map(|number| FhirPathValue::Decimal(number.normalize())));
    }

    if let (FhirPathValue::String(a), FhirPathValue::String(b), BinaryOperator::Add) =
        (left, right, op)
    {
        return Ok(Some(FhirPathValue::String(format!("{a}{b}"))));
    }

    if let (Some((kind, text)), FhirPathValue::Quantity { value, unit }) = (temporal(left), right)
        && matches!(op, BinaryOperator::Add | BinaryOperator::Subtract)
    {
        let amount = if op == BinaryOperator::Subtract { -*value } else { *value };
        let unit = unit.as_deref().unwrap_or("1");
        return shift_temporal(kind, text, amount, unit).map(Some);
    }

    if let FhirPathValue::Quantity { value, unit } = left {
        if let Some(factor) = right.as_decimal() {
            let scaled = match op {
                BinaryOperator::Multiply => value.checked_mul(factor),
                BinaryOperator::Divide => value.checked_div(factor),
                _ => None,
            };
            if let Some(scaled) = scaled {
                return Ok(Some(FhirPathValue::Quantity {
                    value: scaled.normalize(),
                    unit: unit.clone(),
                }));
            }
        }
        if let FhirPathValue::Quantity {
            value: other,
            unit: other_unit,
        } = right
            && matches!(op, BinaryOperator::Add | BinaryOperator::Subtract)
        {
            if unit != other_unit {
                return Ok(None);
            }
            let result = if op == BinaryOperator::Add {
                value.checked_add(*other)
            } else {
                value.checked_sub(*other)
            };
            return Ok(result.map(|value| FhirPathValue::Quantity {
                value,
                unit: unit.clone(),
            }));
        }
    }

    Err(ExpressionError::evaluation(format!(
        "operator {op:?} is not defined for {} and {}",
        left.type_name(),
        right.type_name()
    )))
}

enum Step {
    Months(i64),
    Span(Duration),
}

fn step(amount: Decimal, unit: &str) -> ExpressionResult<Step> {
    let code = calendar_code(unit).unwrap_or(unit);
    let whole = amount
        .trunc()
        .to_i64()
        .ok_or_else(|| ExpressionError::evaluation("duration out of range"))?;
    let millis = |per_unit: i64| -> ExpressionResult<Step> {
        (amount * Decimal::from(per_unit))
            .trunc()
            .to_i64()
            .map(|millis| Step::Span(Duration::milliseconds(millis)))
            .ok_or_else(|| ExpressionError::evaluation("duration out of range"))
    };
    match code {
        "a" => Ok(Step::Months(whole * 12)),
        "mo" => Ok(Step::Months(whole)),
        "wk" => Ok(Step::Span(Duration::weeks(whole))),
        "d" => Ok(Step::Span(Duration::days(whole))),
        "h" => millis(3_600_000),
        "min" => millis(60_000),
        "s" => millis(1_000),
        "ms" => millis(1),
        other => Err(ExpressionError::evaluation(format!(
            "'{other}' is not a calendar duration"
        ))),
    }
}

fn shift_months<T>(
    value: T,
    months: i64,
    add: impl Fn(T, Months) -> Option<T>,
    sub: impl Fn(T, Months) -> Option<T>,
) -> Option<T> {
    let magnitude = Months::new(u32::try_from(months.unsigned_abs()).ok()?);
    if months >= 0 {
        add(value, magnitude)
    } else {
        sub(value, magnitude)
    }
}

fn overflow() -> ExpressionError {
    ExpressionError::evaluation("date arithmetic overflowed")
}

/// Date/time plus or minus a calendar duration. Partial dates keep their precision.
fn shift_temporal(
    kind: Temporal,
    text: &str,
    amount: Decimal,
    unit: &str,
) -> ExpressionResult<FhirPathValue> {
    let step = step(amount, unit)?;
    match kind {
        Temporal::Date => {
            let padded = match text.len() {
                4 => format!("{text}-01-01"),
                7 => format!("{text}-01"),
                _ => text.to_string(),
            };
            let date = NaiveDate::parse_from_str(&padded, "%Y-%m-%d")
                .map_err(|err| ExpressionError::evaluation(format!("invalid date '{text}': {err}")))?;
            let shifted = match step {
                Step::Months(months) => shift_months(
                    date,
                    months,
                    |date, m| date.checked_add_months(m),
                    |date, m| date.checked_sub_months(m),
                ),
                Step::Span(span) => date.checked_add_signed(span),
            }
            .ok_or_else(overflow)?;
            let formatted = shifted.format("%Y-%m-%d").to_string();
            Ok(FhirPathValue::Date(
                formatted.chars().take(text.len().max(4)).collect(),
            ))
        }
        Temporal::DateTime => {
            let fraction = if text.contains('.') { "%.3f" } else { "" };
            if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
                let shifted = match step {
                    Step::Months(months) => shift_months(
                        parsed,
                        months,
                        |value, m| value.checked_add_months(m),
                        |value, m| value.checked_sub_months(m),
                    ),
                    Step::Span(span) => parsed.checked_add_signed(span),
                }
                .ok_or_else(overflow)?;
                let zone = if text.ends_with('Z') { "Z" } else { "%:z" };
                let pattern = format!("%Y-%m-%dT%H:%M:%S{fraction}{zone}");
                return Ok(FhirPathValue::DateTime(shifted.format(&pattern).to_string()));
            }
            let parsed = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M"]
                .iter()
                .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
                .ok_or_else(|| ExpressionError::evaluation(format!("invalid dateTime '{text}'")))?;
            let shifted = match step {
                Step::Months(months) => shift_months(
                    parsed,
                    months,
                    |value, m| value.checked_add_months(m),
                    |value, m| value.checked_sub_months(m),
                ),
                Step::Span(span) => parsed.checked_add_signed(span),
            }
            .ok_or_else(overflow)?;
            let pattern = format!("%Y-%m-%dT%H:%M:%S{fraction}");
            Ok(FhirPathValue::DateTime(shifted.format(&pattern).to_string()))
        }
        Temporal::Time => {
            let Step::Span(span) = step else {
                return Err(ExpressionError::evaluation(
                    "only time-of-day units apply to a time",
                ));
            };
            let parsed = ["%H:%M:%S%.f", "%H:%M:%S", "%H:%M"]
                .iter()
                .find_map(|format| NaiveTime::parse_from_str(text, format).ok())
                .ok_or_else(|| ExpressionError::evaluation(format!("invalid time '{text}'")))?;
            let (shifted, _) = parsed.overflowing_add_signed(span);
            let pattern = if text.len() <= 5 { "%H:%M" } else { "%H:%M:%S" };
            Ok(FhirPathValue::Time(shifted.format(pattern).to_string()))
        }
    }
}
