use pretty_assertions::assert_eq;
use serde_json::{Value, json};

use qr_engine::spec::extensions::{MIN_LENGTH, MIN_OCCURS, VARIABLE};
use qr_engine::{
    AnswerValue, Coding, EngineConfig, FormEngine, IssueCode, IssueOwner, Questionnaire, Severity,
};

fn fixture(name: &str) -> &'static str {
    match name {
        "follow_up" => include_str!("fixtures/follow_up.json"),
        "medications" => include_str!("fixtures/medications.json"),
        _ => panic!("unknown fixture {name}"),
    }
}

fn open_fixture(name: &str) -> FormEngine {
    let definition: Questionnaire = serde_json::from_str(fixture(name)).expect("definition");
    FormEngine::open(definition, None, EngineConfig::default())
}

fn open(definition: Value) -> FormEngine {
    let definition = serde_json::from_value(definition).expect("definition");
    FormEngine::open(definition, None, EngineConfig::default())
}

fn text(value: &str) -> AnswerValue {
    AnswerValue::String(value.to_string())
}

#[test]
fn unanswered_required_question_blocks_submission() {
    let form = open_fixture("follow_up");
    let report = form.issues();
    assert!(!report.is_valid());

    let question = form.find("follow-up").expect("follow-up");
    let issues = report.for_node(question);
    assert_eq!(issues.len(), 1);
    assert_eq!(issues[0].code, IssueCode::Required);
    assert_eq!(issues[0].severity, Severity::Error);
    assert_eq!(issues[0].location.as_deref(), Some("follow-up"));
}

#[test]
fn answering_the_required_question_clears_the_issue() {
    let mut form = open_fixture("follow_up");
    let question = form.find("follow-up").expect("follow-up");
    form.set_answer(
        question,
        0,
        AnswerValue::Coding(Coding::new("http://loinc.org", "LA32-8")),
    )
    .expect("answer");

    assert!(form.issues().is_valid());
    assert!(form.issues().issues().is_empty());
}

#[test]
fn too_long_text_is_reported_on_the_answer() {
    let mut form = open_fixture("follow_up");
    let reason = form.find("visit-reason").expect("visit-reason");
    form.set_answer(reason, 0, text("Routine post-operative check"))
        .expect("answer");

    let issues = form.issues().for_answer(reason, 0);
    assert_eq!(issues.len(), 1);
    assert_eq!(issues[0].code, IssueCode::TooLong);
    assert_eq!(
        issues[0].diagnostics,
        "'visit-reason' allows at most 20 characters, found 28"
    );
    assert_eq!(issues[0].location.as_deref(), Some("visit/visit-reason"));
    assert_eq!(
        issues[0].owner,
        IssueOwner::Answer {
            node: reason,
            index: 0
        }
    );
}

#[test]
fn short_text_and_missing_occurrences_are_reported() {
    let mut form = open(json!({
        "resourceType": "Questionnaire",
        "status": "active",
        "item": [{
            "linkId": "alias",
            "type": "string",
            "repeats": true,
            "extension": [
                {"url": MIN_LENGTH, "valueInteger": 3},
                {"url": MIN_OCCURS, "valueInteger": 2}
            ]
        }]
    }));
    let alias = form.find("alias").expect("alias");
    form.set_answer(alias, 0, text("Al")).expect("answer");

    let codes: Vec<IssueCode> = form
        .issues()
        .for_node(alias)
        .iter()
        .map(|issue| issue.code)
        .collect();
    assert_eq!(codes, vec![IssueCode::Structure, IssueCode::Value]);

    form.add_answer(alias, text("Alfred")).expect("add");
    let codes: Vec<IssueCode> = form
        .issues()
        .for_node(alias)
        .iter()
        .map(|issue| issue.code)
        .collect();
    assert_eq!(codes, vec![IssueCode::Value]);
    assert!(form.issues().for_answer(alias, 1).is_empty());
}

#[test]
fn disabled_items_are_not_validated() {
    let mut form = open(json!({
        "resourceType": "Questionnaire",
        "status": "active",
        "item": [
            {"linkId": "smoker", "type": "boolean"},
            {
                "linkId": "packs",
                "type": "integer",
                "required": true,
                "enableWhen": [{"question": "smoker", "operator": "=", "answerBoolean": true}]
            }
        ]
    }));
    assert!(form.issues().is_valid());

    let smoker = form.find("smoker").expect("smoker");
    form.set_answer(smoker, 0, AnswerValue::Boolean(true))
        .expect("answer");
    assert!(!form.issues().is_valid());

    form.set_answer(smoker, 0, AnswerValue::Boolean(false))
        .expect("answer");
    assert!(form.issues().is_valid());
}

#[test]
fn required_group_needs_some_content() {
    let mut form = open(json!({
        "resourceType": "Questionnaire",
        "status": "active",
        "item": [{
            "linkId": "contact",
            "type": "group",
            "required": true,
            "item": [
                {"linkId": "phone", "type": "string"},
                {"linkId": "email", "type": "string"}
            ]
        }]
    }));
    let group = form.find("contact").expect("group");
    let issues = form.issues().for_node(group);
    assert_eq!(issues.len(), 1);
    assert_eq!(
        issues[0].diagnostics,
        "group 'contact' requires at least one answer"
    );

    let email = form.find("email").expect("email");
    form.set_answer(email, 0, text("a@example.org"))
        .expect("answer");
    assert!(form.issues().for_node(group).is_empty());
}

#[test]
fn operation_outcome_lists_every_issue() {
    let mut form = open_fixture("medications");
    let drug = form.find("drug").expect("drug");
    let dose = form.find("dose").expect("dose");
    form.set_answer(dose, 0, AnswerValue::Integer(1))
        .expect("dose");

    let outcome = form.issues().to_operation_outcome();
    assert_eq!(outcome["resourceType"], "OperationOutcome");
    assert_eq!(
        outcome["issue"],
        json!([{
            "severity": "error",
            "code": "required",
            "diagnostics": "'drug' is required",
            "expression": ["medication/drug"]
        }])
    );

    form.set_answer(drug, 0, text("Metformin")).expect("drug");
    assert_eq!(form.issues().to_operation_outcome()["issue"], json!([]));
}

#[test]
fn duplicate_group_variables_point_at_the_declaring_group() {
    let form = open(json!({
        "item": [{
            "linkId": "section",
            "type": "group",
            "extension": [
                {"url": VARIABLE, "valueExpression": {"name": "total", "language": "text/fhirpath", "expression": "1"}},
                {"url": VARIABLE, "valueExpression": {"name": "total", "language": "text/fhirpath", "expression": "2"}}
            ],
            "item": [{"linkId": "inner", "type": "string"}]
        }]
    }));

    let duplicates = form.issues().form_level();
    assert_eq!(duplicates.len(), 1);
    assert_eq!(duplicates[0].code, IssueCode::Duplicate);
    assert_eq!(duplicates[0].owner, IssueOwner::Form);
    assert_eq!(duplicates[0].location.as_deref(), Some("section"));
}
