//! Function library. Lambda arguments (`where`, `select`, `all`, ...) are evaluated once
//! per focus item with `$this` and `$index` bound; other arguments are evaluated
//! against the invocation's input.

use chrono::{Local, SecondsFormat};
use regex::Regex;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};

use super::ast::ExpressionNode;
use super::error::{ExpressionError, ExpressionResult};
use super::evaluator::{Evaluator, Frame, children, compare, equals, union};
use super::value::{Collection, FhirPathValue, singleton, singleton_boolean};

/// Upper bound on `repeat()` and `descendants()` expansion.
const MAX_REPEAT_ITEMS: usize = 10_000;

fn arity(name: &str, args: &[ExpressionNode], min: usize, max: usize) -> ExpressionResult<()> {
    if args.len() < min || args.len() > max {
        let expected = if min == max {
            min.to_string()
        } else {
            format!("{min} to {max}")
        };
        return Err(ExpressionError::evaluation(format!(
            "{name}() takes {expected} argument(s) but {} were given",
            args.len()
        )));
    }
    Ok(())
}

fn boolean(flag: bool) -> ExpressionResult<Collection> {
    Ok(vec![FhirPathValue::Boolean(flag)])
}

fn one(value: Option<FhirPathValue>) -> ExpressionResult<Collection> {
    Ok(value.into_iter().collect())
}

/// Type specifier argument of `ofType(...)`, written as a bare or dotted name.
fn type_specifier(node: &ExpressionNode) -> ExpressionResult<String> {
    match node {
        ExpressionNode::Identifier(name) => Ok(name.clone()),
        ExpressionNode::Member { target, name } => {
            Ok(format!("{}.{}", type_specifier(target)?, name))
        }
        _ => Err(ExpressionError::evaluation("ofType() expects a type name")),
    }
}

fn string_focus<'a>(focus: &'a Collection, name: &str) -> ExpressionResult<Option<&'a str>> {
    match singleton(focus, name)? {
        None => Ok(None),
        Some(FhirPathValue::String(text)) => Ok(Some(text)),
        Some(other) => Err(ExpressionError::evaluation(format!(
            "{name}() expects a string but found {}",
            other.type_name()
        ))),
    }
}

fn integer_of(collection: &Collection, name: &str) -> ExpressionResult<Option<i64>> {
    match singleton(collection, name)? {
        None => Ok(None),
        Some(FhirPathValue::Integer(number)) => Ok(Some(*number)),
        Some(other) => Err(ExpressionError::evaluation(format!(
            "{name}() expects an integer argument but found {}",
            other.type_name()
        ))),
    }
}

fn numeric(focus: &Collection, name: &str) -> ExpressionResult<Option<FhirPathValue>> {
    match singleton(focus, name)? {
        None => Ok(None),
        Some(value @ (FhirPathValue::Integer(_) | FhirPathValue::Decimal(_))) => {
            Ok(Some(value.clone()))
        }
        Some(FhirPathValue::Quantity { .. }) | Some(FhirPathValue::Object(_)) => {
            Err(ExpressionError::evaluation(format!(
                "{name}() is only defined for numbers"
            )))
        }
        Some(other) => Err(ExpressionError::evaluation(format!(
            "{name}() is not defined for {}",
            other.type_name()
        ))),
    }
}

fn regex(pattern: &str) -> ExpressionResult<Regex> {
    Regex::new(pattern)
        .map_err(|err| ExpressionError::evaluation(format!("invalid regular expression: {err}")))
}

impl Evaluator<'_> {
    fn argument(
        &self,
        node: &ExpressionNode,
        input: &Collection,
        frame: &Frame,
    ) -> ExpressionResult<Collection> {
        self.eval(node, input, frame)
    }

    fn string_argument(
        &self,
        name: &str,
        node: &ExpressionNode,
        input: &Collection,
        frame: &Frame,
    ) -> ExpressionResult<Option<String>> {
        let value = self.argument(node, input, frame)?;
        match singleton(&value, name)? {
            None => Ok(None),
            Some(FhirPathValue::String(text)) => Ok(Some(text.clone())),
            Some(other) => Err(ExpressionError::evaluation(format!(
                "{name}() expects a string argument but found {}",
                other.type_name()
            ))),
        }
    }

    /// Evaluates `node` once per focus item.
    fn each(
        &self,
        node: &ExpressionNode,
        focus: &Collection,
        frame: &Frame,
    ) -> ExpressionResult<Vec<(FhirPathValue, Collection)>> {
        let mut results = Vec::with_capacity(focus.len());
        for (index, item) in focus.iter().enumerate() {
            let scope = vec![item.clone()];
            let item_frame = Frame {
                this: scope.clone(),
                index: i64::try_from(index).ok(),
                total: frame.total.clone(),
            };
            let result = self.eval(node, &scope, &item_frame)?;
            results.push((item.clone(), result));
        }
        Ok(results)
    }

    fn criteria(
        &self,
        node: &ExpressionNode,
        focus: &Collection,
        frame: &Frame,
    ) -> ExpressionResult<Vec<(FhirPathValue, Option<bool>)>> {
        self.each(node, focus, frame)?
            .into_iter()
            .map(|(item, result)| Ok((item, singleton_boolean(&result)?)))
            .collect()
    }

    pub(super) fn call(
        &self,
        name: &str,
        focus: &Collection,
        args: &[ExpressionNode],
        input: &Collection,
        frame: &Frame,
    ) -> ExpressionResult<Collection> {
        match name {
            // existence
            "empty" => {
                arity(name, args, 0, 0)?;
                boolean(focus.is_empty())
            }
            "exists" => {
                arity(name, args, 0, 1)?;
                match args.first() {
                    None => boolean(!focus.is_empty()),
                    Some(criteria) => boolean(
                        self.criteria(criteria, focus, frame)?
                            .iter()
                            .any(|(_, result)| *result == Some(true)),
                    ),
                }
            }
            "all" => {
                arity(name, args, 1, 1)?;
                boolean(
                    self.criteria(&args[0], focus, frame)?
                        .iter()
                        .all(|(_, result)| *result == Some(true)),
                )
            }
            "allTrue" | "anyTrue" | "allFalse" | "anyFalse" => {
                arity(name, args, 0, 0)?;
                let mut flags = Vec::with_capacity(focus.len());
                for item in focus {
                    match item {
                        FhirPathValue::Boolean(flag) => flags.push(*flag),
                        other => {
                            return Err(ExpressionError::evaluation(format!(
                                "{name}() expects booleans but found {}",
                                other.type_name()
                            )));
                        }
                    }
                }
                boolean(match name {
                    "allTrue" => flags.iter().all(|flag| *flag),
                    "anyTrue" => flags.iter().any(|flag| *flag),
                    "allFalse" => flags.iter().all(|flag| !*flag),
                    _ => flags.iter().any(|flag| !*flag),
                })
            }
            "hasValue" => {
                arity(name, args, 0, 0)?;
                boolean(matches!(
                    focus.as_slice(),
                    [item] if !matches!(item, FhirPathValue::Object(_))
                ))
            }
            "count" => {
                arity(name, args, 0, 0)?;
                Ok(vec![FhirPathValue::Integer(
                    i64::try_from(focus.len()).unwrap_or(i64::MAX),
                )])
            }
            "isDistinct" => {
                arity(name, args, 0, 0)?;
                boolean(distinct(focus).len() == focus.len())
            }

            // filtering and projection
            "where" => {
                arity(name, args, 1, 1)?;
                Ok(self
                    .criteria(&args[0], focus, frame)?
                    .into_iter()
                    .filter(|(_, result)| *result == Some(true))
                    .map(|(item, _)| item)
                    .collect())
            }
            "select" => {
                arity(name, args, 1, 1)?;
                Ok(self
                    .each(&args[0], focus, frame)?
                    .into_iter()
                    .flat_map(|(_, result)| result)
                    .collect())
            }
            "repeat" => {
                arity(name, args, 1, 1)?;
                let mut output: Collection = Vec::new();
                let mut pending = focus.clone();
                while !pending.is_empty() && output.len() < MAX_REPEAT_ITEMS {
                    let mut next = Vec::new();
                    for (_, result) in self.each(&args[0], &pending, frame)? {
                        for item in result {
                            if !output.iter().any(|seen| equals(seen, &item) == Some(true)) {
                                output.push(item.clone());
                                next.push(item);
                            }
                        }
                    }
                    pending = next;
                }
                Ok(output)
            }
            "ofType" => {
                arity(name, args, 1, 1)?;
                let type_name = type_specifier(&args[0])?;
                Ok(focus
                    .iter()
                    .filter(|item| item.is_type(&type_name))
                    .cloned()
                    .collect())
            }
            "children" => {
                arity(name, args, 0, 0)?;
                Ok(children(focus))
            }
            "descendants" => {
                arity(name, args, 0, 0)?;
                let mut output = Vec::new();
                let mut level = children(focus);
                while !level.is_empty() && output.len() < MAX_REPEAT_ITEMS {
                    let next = children(&level);
                    output.extend(level);
                    level = next;
                }
                Ok(output)
            }

            // subsetting
            "first" => {
                arity(name, args, 0, 0)?;
                one(focus.first().cloned())
            }
            "last" => {
                arity(name, args, 0, 0)?;
                one(focus.last().cloned())
            }
            "tail" => {
                arity(name, args, 0, 0)?;
                Ok(focus.iter().skip(1).cloned().collect())
            }
            "skip" | "take" => {
                arity(name, args, 1, 1)?;
                let count = integer_of(&self.argument(&args[0], input, frame)?, name)?
                    .unwrap_or(0)
                    .max(0);
                let count = usize::try_from(count).unwrap_or(usize::MAX);
                Ok(if name == "skip" {
                    focus.iter().skip(count).cloned().collect()
                } else {
                    focus.iter().take(count).cloned().collect()
                })
            }
            "single" => {
                arity(name, args, 0, 0)?;
                one(singleton(focus, name)?.cloned())
            }
            "distinct" => {
                arity(name, args, 0, 0)?;
                Ok(distinct(focus))
            }
            "union" => {
                arity(name, args, 1, 1)?;
                let other = self.argument(&args[0], input, frame)?;
                Ok(union(focus.clone(), other))
            }
            "combine" => {
                arity(name, args, 1, 1)?;
                let mut output = focus.clone();
                output.extend(self.argument(&args[0], input, frame)?);
                Ok(output)
            }

            // boolean
            "not" => {
                arity(name, args, 0, 0)?;
                one(singleton_boolean(focus)?.map(|flag| FhirPathValue::Boolean(!flag)))
            }
            "iif" => {
                arity(name, args, 2, 3)?;
                let condition_frame = Frame {
                    this: focus.clone(),
                    index: frame.index,
                    total: frame.total.clone(),
                };
                let condition =
                    singleton_boolean(&self.eval(&args[0], focus, &condition_frame)?)?;
                if condition == Some(true) {
                    self.argument(&args[1], input, frame)
                } else if let Some(otherwise) = args.get(2) {
                    self.argument(otherwise, input, frame)
                } else {
                    Ok(Vec::new())
                }
            }

            // conversion
            "toString" => {
                arity(name, args, 0, 0)?;
                one(singleton(focus, name)?
                    .and_then(FhirPathValue::to_display_string)
                    .map(FhirPathValue::String))
            }
            "toInteger" => {
                arity(name, args, 0, 0)?;
                one(match singleton(focus, name)? {
                    Some(FhirPathValue::Integer(number)) => Some(FhirPathValue::Integer(*number)),
                    Some(FhirPathValue::Boolean(flag)) => Some(FhirPathValue::Integer(i64::from(*flag))),
                    Some(FhirPathValue::String(text)) => {
                        text.trim().parse::<i64>().ok().map(FhirPathValue::Integer)
                    }
                    _ => None,
                })
            }
            "toDecimal" => {
                arity(name, args, 0, 0)?;
                one(match singleton(focus, name)? {
                    Some(FhirPathValue::Integer(number)) => {
                        Some(FhirPathValue::Decimal(Decimal::from(*number)))
                    }
                    Some(FhirPathValue::Decimal(number)) => Some(FhirPathValue::Decimal(*number)),
                    Some(FhirPathValue::Boolean(flag)) => {
                        Some(FhirPathValue::Decimal(Decimal::from(i64::from(*flag))))
                    }
                    Some(FhirPathValue::String(text)) => text
                        .trim()
                        .parse::<Decimal>()
                        .ok()
                        .map(FhirPathValue::Decimal),
                    _ => None,
                })
            }
            "toBoolean" => {
                arity(name, args, 0, 0)?;
                one(match singleton(focus, name)? {
                    Some(FhirPathValue::Boolean(flag)) => Some(*flag),
                    Some(FhirPathValue::Integer(1)) => Some(true),
                    Some(FhirPathValue::Integer(0)) => Some(false),
                    Some(FhirPathValue::Decimal(number)) if *number == Decimal::ONE => Some(true),
                    Some(FhirPathValue::Decimal(number)) if number.is_zero() => Some(false),
                    Some(FhirPathValue::String(text)) => {
                        match text.trim().to_ascii_lowercase().as_str() {
                            "true" | "t" | "yes" | "y" | "1" | "1.0" => Some(true),
                            "false" | "f" | "no" | "n" | "0" | "0.0" => Some(false),
                            _ => None,
                        }
                    }
                    _ => None,
                }
                .map(FhirPathValue::Boolean))
            }

            // strings
            "length" => {
                arity(name, args, 0, 0)?;
                one(string_focus(focus, name)?.map(|text| {
                    FhirPathValue::Integer(i64::try_from(text.chars().count()).unwrap_or(i64::MAX))
                }))
            }
            "upper" | "lower" | "trim" => {
                arity(name, args, 0, 0)?;
                one(string_focus(focus, name)?.map(|text| {
                    FhirPathValue::String(match name {
                        "upper" => text.to_uppercase(),
                        "lower" => text.to_lowercase(),
                        _ => text.trim().to_string(),
                    })
                }))
            }
            "contains" | "startsWith" | "endsWith" | "indexOf" | "matches" => {
                arity(name, args, 1, 1)?;
                let Some(text) = string_focus(focus, name)? else {
                    return Ok(Vec::new());
                };
                let Some(needle) = self.string_argument(name, &args[0], input, frame)? else {
                    return Ok(Vec::new());
                };
                Ok(vec![match name {
                    "contains" => FhirPathValue::Boolean(text.contains(&needle)),
                    "startsWith" => FhirPathValue::Boolean(text.starts_with(&needle)),
                    "endsWith" => FhirPathValue::Boolean(text.ends_with(&needle)),
                    "matches" => FhirPathValue::Boolean(regex(&needle)?.is_match(text)),
                    _ => FhirPathValue::Integer(
                        text.find(&needle)
                            .map(|offset| text[..offset].chars().count())
                            .and_then(|position| i64::try_from(position).ok())
                            .unwrap_or(-1),
                    ),
                }])
            }
            "substring" => {
                arity(name, args, 1, 2)?;
                let Some(text) = string_focus(focus, name)? else {
                    return Ok(Vec::new());
                };
                let Some(start) = integer_of(&self.argument(&args[0], input, frame)?, name)?
                else {
                    return Ok(Vec::new());
                };
                let length = match args.get(1) {
                    Some(node) => integer_of(&self.argument(node, input, frame)?, name)?,
                    None => None,
                };
                let chars: Vec<char> = text.chars().collect();
                let Ok(start) = usize::try_from(start) else {
                    return Ok(Vec::new());
                };
                if start >= chars.len() {
                    return Ok(Vec::new());
                }
                let end = match length {
                    Some(length) => start
                        .saturating_add(usize::try_from(length.max(0)).unwrap_or(0))
                        .min(chars.len()),
                    None => chars.len(),
                };
                Ok(vec![FhirPathValue::String(chars[start..end].iter().collect())])
            }
            "replace" | "replaceMatches" => {
                arity(name, args, 2, 2)?;
                let Some(text) = string_focus(focus, name)? else {
                    return Ok(Vec::new());
                };
                let (Some(pattern), Some(substitution)) = (
                    self.string_argument(name, &args[0], input, frame)?,
                    self.string_argument(name, &args[1], input, frame)?,
                ) else {
                    return Ok(Vec::new());
                };
                let replaced = if name == "replace" {
                    text.replace(&pattern, &substitution)
                } else {
                    regex(&pattern)?
                        .replace_all(text, substitution.as_str())
                        .into_owned()
                };
                Ok(vec![FhirPathValue::String(replaced)])
            }
            "join" => {
                arity(name, args, 0, 1)?;
                let separator = match args.first() {
                    Some(node) => self
                        .string_argument(name, node, input, frame)?
                        .unwrap_or_default(),
                    None => String::new(),
                };
                let parts: Vec<String> = focus
                    .iter()
                    .filter_map(FhirPathValue::to_display_string)
                    .collect();
                Ok(vec![FhirPathValue::String(parts.join(&separator))])
            }

            // aggregates
            "sum" | "avg" => {
                arity(name, args, 0, 0)?;
                if focus.is_empty() {
                    return Ok(Vec::new());
                }
                let mut all_integers = true;
                let mut total = Decimal::ZERO;
                for item in focus {
                    all_integers &= matches!(item, FhirPathValue::Integer(_));
                    let number = item.as_decimal().ok_or_else(|| {
                        ExpressionError::evaluation(format!(
                            "{name}() expects numbers but found {}",
                            item.type_name()
                        ))
                    })?;
                    total = total
                        .checked_add(number)
                        .ok_or_else(|| ExpressionError::evaluation("numeric overflow"))?;
                }
                if name == "sum" {
                    if all_integers && let Some(total) = total.to_i64() {
                        return Ok(vec![FhirPathValue::Integer(total)]);
                    }
                    return Ok(vec![FhirPathValue::Decimal(total)]);
                }
                let count = Decimal::from(focus.len() as u64);
                one(total
                    .checked_div(count)
                    .map(|mean| FhirPathValue::Decimal(mean.normalize())))
            }
            "min" | "max" => {
                arity(name, args, 0, 0)?;
                let mut best: Option<&FhirPathValue> = None;
                for item in focus {
                    best = match best {
                        None => Some(item),
                        Some(current) => {
                            let ordering = compare(item, current)?;
                            let better = match ordering {
                                Some(std::cmp::Ordering::Less) => name == "min",
                                Some(std::cmp::Ordering::Greater) => name == "max",
                                _ => false,
                            };
                            if better { Some(item) } else { Some(current) }
                        }
                    };
                }
                one(best.cloned())
            }

            // math
            "abs" => {
                arity(name, args, 0, 0)?;
                one(match numeric(focus, name)? {
                    Some(FhirPathValue::Integer(number)) => {
                        number.checked_abs().map(FhirPathValue::Integer)
                    }
                    Some(FhirPathValue::Decimal(number)) => Some(FhirPathValue::Decimal(number.abs())),
                    _ => None,
                })
            }
            "round" => {
                arity(name, args, 0, 1)?;
                let precision = match args.first() {
                    Some(node) => integer_of(&self.argument(node, input, frame)?, name)?.unwrap_or(0),
                    None => 0,
                };
                let precision = u32::try_from(precision).map_err(|_| {
                    ExpressionError::evaluation("round() precision must not be negative")
                })?;
                one(numeric(focus, name)?
                    .and_then(|value| value.as_decimal())
                    .map(|number| {
                        FhirPathValue::Decimal(number.round_dp_with_strategy(
                            precision,
                            RoundingStrategy::MidpointAwayFromZero,
                        ))
                    }))
            }
            "floor" | "ceiling" => {
                arity(name, args, 0, 0)?;
                one(numeric(focus, name)?
                    .and_then(|value| value.as_decimal())
                    .and_then(|number| {
                        let rounded = if name == "floor" { number.floor() } else { number.ceil() };
                        rounded.to_i64()
                    })
                    .map(FhirPathValue::Integer))
            }

            // utility
            "today" => {
                arity(name, args, 0, 0)?;
                Ok(vec![FhirPathValue::Date(
                    Local::now().date_naive().format("%Y-%m-%d").to_string(),
                )])
            }
            "now" => {
                arity(name, args, 0, 0)?;
                Ok(vec![FhirPathValue::DateTime(
                    Local::now().to_rfc3339_opts(SecondsFormat::Millis, false),
                )])
            }

            other => Err(ExpressionError::evaluation(format!(
                "unknown function '{other}'"
            ))),
        }
    }
}

fn distinct(focus: &Collection) -> Collection {
    union(focus.clone(), Vec::new())
}
