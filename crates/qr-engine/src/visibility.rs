use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::codec;
use crate::datatypes::AnswerValue;
use crate::spec::{EnableBehavior, EnableWhen, EnableWhenOperator};

/// How an enablement expression that fails to evaluate is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VisibilityMode {
    /// The item stays enabled; the failure is reported as a warning.
    #[default]
    Visible,
    /// The item is disabled; the failure is reported as a warning.
    Hidden,
    /// The item stays enabled and the failure is reported as an error that blocks
    /// submission.
    Error,
}

impl VisibilityMode {
    pub fn fallback(self) -> bool {
        match self {
            VisibilityMode::Visible => true,
            VisibilityMode::Hidden => false,
            VisibilityMode::Error => true,
        }
    }
}

/// Evaluates one static condition against the answers of the referenced question.
/// Without answers only `exists` can hold.
pub fn condition_holds(condition: &EnableWhen, answers: &[&AnswerValue]) -> bool {
    if condition.operator == EnableWhenOperator::Exists {
        let expected = condition.answer_boolean.unwrap_or(true);
        return answers.is_empty() != expected;
    }
    let Some(expected) = condition.answer() else {
        return false;
    };
    if answers.is_empty() {
        return false;
    }
    match condition.operator {
        EnableWhenOperator::Equal => answers.iter().any(|answer| codec::equals(answer, &expected)),
        EnableWhenOperator::NotEqual => {
            !answers.iter().any(|answer| codec::equals(answer, &expected))
        }
        operator => answers.iter().any(|answer| {
            let Some(ordering) = codec::compare(answer, &expected) else {
                return false;
            };
            match operator {
                EnableWhenOperator::Greater => ordering == Ordering::Greater,
                EnableWhenOperator::Less => ordering == Ordering::Less,
                EnableWhenOperator::GreaterOrEqual => ordering != Ordering::Less,
                EnableWhenOperator::LessOrEqual => ordering != Ordering::Greater,
                _ => false,
            }
        }),
    }
}

/// Combines static conditions per `enableBehavior`. `lookup` returns the answers of
/// the question a condition refers to.
pub fn conditions_hold<'a>(
    conditions: &[EnableWhen],
    behavior: EnableBehavior,
    mut lookup: impl FnMut(&str) -> Vec<&'a AnswerValue>,
) -> bool {
    if conditions.is_empty() {
        return true;
    }
    let mut results = conditions
        .iter()
        .map(|condition| condition_holds(condition, &lookup(&condition.question)));
    match behavior {
        EnableBehavior::All => results.all(|holds| holds),
        EnableBehavior::Any => results.any(|holds| holds),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datatypes::Coding;
    use serde_json::json;

    fn condition(value: serde_json::Value) -> EnableWhen {
        serde_json::from_value(value).expect("enableWhen")
    }

    #[test]
    fn exists_checks_presence() {
        let present = condition(json!({"question": "q", "operator": "exists", "answerBoolean": true}));
        let absent = condition(json!({"question": "q", "operator": "exists", "answerBoolean": false}));
        let value = AnswerValue::Integer(1);
        assert!(condition_holds(&present, &[&value]));
        assert!(!condition_holds(&present, &[]));
        assert!(condition_holds(&absent, &[]));
    }

    #[test]
    fn codings_match_on_system_and_code() {
        let when = condition(json!({
            "question": "q",
            "operator": "=",
            "answerCoding": {"system": "http://loinc.org", "code": "LA33-6"}
        }));
        let answer = AnswerValue::Coding(Coding::new("http://loinc.org", "LA33-6").with_display("Yes"));
        assert!(condition_holds(&when, &[&answer]));
    }

    #[test]
    fn any_behavior_needs_one_condition() {
        let conditions = vec![
            condition(json!({"question": "a", "operator": ">", "answerInteger": 5})),
            condition(json!({"question": "b", "operator": "exists", "answerBoolean": true})),
        ];
        let seven = AnswerValue::Integer(7);
        let lookup = |question: &str| {
            if question == "a" {
                vec![&seven]
            } else {
                Vec::new()
            }
        };
        assert!(conditions_hold(&conditions, EnableBehavior::Any, lookup));
        assert!(!conditions_hold(&conditions, EnableBehavior::All, lookup));
    }
}
