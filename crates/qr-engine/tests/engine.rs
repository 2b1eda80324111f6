use pretty_assertions::assert_eq;
use rstest::rstest;
use serde_json::{Value, json};

use qr_engine::spec::extensions::{
    CQF_CALCULATED_VALUE, CQF_EXPRESSION, INITIAL_EXPRESSION, MAX_OCCURS, MAX_VALUE, MIN_VALUE,
    VARIABLE,
};
use qr_engine::{
    AnswerValue, Attachment, Coding, EngineConfig, FormEngine, IssueCode, Quantity, Questionnaire,
    QuestionnaireResponse, Reference, Severity, VisibilityMode,
};

fn fixture(name: &str) -> &'static str {
    match name {
        "follow_up" => include_str!("fixtures/follow_up.json"),
        "follow_up_response" => include_str!("fixtures/follow_up_response.json"),
        "medications" => include_str!("fixtures/medications.json"),
        _ => panic!("unknown fixture {name}"),
    }
}

fn definition(name: &str) -> Questionnaire {
    serde_json::from_str(fixture(name)).expect("definition")
}

fn open(definition: Value) -> FormEngine {
    let definition = serde_json::from_value(definition).expect("definition");
    FormEngine::open(definition, None, EngineConfig::default())
}

fn fhirpath(expression: &str) -> Value {
    json!({"language": "text/fhirpath", "expression": expression})
}

fn yes() -> AnswerValue {
    AnswerValue::Coding(Coding::new("http://loinc.org", "LA33-6").with_display("Yes"))
}

fn no() -> AnswerValue {
    AnswerValue::Coding(Coding::new("http://loinc.org", "LA32-8").with_display("No"))
}

#[test]
fn fresh_response_carries_defaulted_top_level_fields() {
    let form = FormEngine::open(definition("follow_up"), None, EngineConfig::default());
    let document = serde_json::to_value(form.response()).expect("serialize");
    assert_eq!(
        document,
        json!({
            "resourceType": "QuestionnaireResponse",
            "questionnaire": "http://example.org/Questionnaire/follow-up|1.0.0",
            "status": "in-progress"
        })
    );
}

#[test]
fn replacing_or_clearing_a_coding_keeps_nested_answers() {
    let saved: QuestionnaireResponse =
        serde_json::from_str(fixture("follow_up_response")).expect("response");
    let mut form = FormEngine::open(definition("follow_up"), Some(saved), EngineConfig::default());
    let follow_up = form.find("follow-up").expect("follow-up");
    let notes = form.find("follow-up-notes").expect("notes");
    let expected_notes = vec![AnswerValue::String("Call in the afternoon".into())];

    form.set_answer(follow_up, 0, no()).expect("replace");
    assert_eq!(form.answers(follow_up), vec![no()]);
    assert_eq!(form.answers(notes), expected_notes);

    form.clear_answer(follow_up, 0).expect("clear");
    assert!(form.answers(follow_up).is_empty());
    assert_eq!(form.answers(notes), expected_notes);

    let document = serde_json::to_value(form.response()).expect("serialize");
    assert_eq!(
        document["item"][0]["answer"][0]["item"][0]["answer"][0]["valueString"],
        "Call in the afternoon"
    );
    assert!(document["item"][0]["answer"][0].get("valueCoding").is_none());
}

#[test]
fn clearing_twice_is_the_same_as_clearing_once() {
    let mut form = FormEngine::open(definition("follow_up"), None, EngineConfig::default());
    let reason = form.find("visit-reason").expect("reason");
    form.set_answer(reason, 0, AnswerValue::String("Checkup".into()))
        .expect("write");

    form.clear_answer(reason, 0).expect("first clear");
    let once = form.response().clone();
    form.clear_answer(reason, 0).expect("second clear");
    assert_eq!(form.response(), &once);
    assert!(once.item[0].item.as_ref().expect("visit children")[0].answer.is_none());
}

#[test]
fn quantity_answers_round_trip() {
    let mut form = FormEngine::open(definition("follow_up"), None, EngineConfig::default());
    let weight = form.find("weight").expect("weight");
    let value = AnswerValue::Quantity(Quantity::ucum(72.0, "kg"));

    form.set_answer(weight, 0, value.clone()).expect("write");
    assert_eq!(form.answers(weight), vec![value]);

    let document = serde_json::to_value(form.response()).expect("serialize");
    assert_eq!(
        document["item"][0]["answer"][0]["valueQuantity"],
        json!({"value": 72.0, "unit": "kg", "system": "http://unitsofmeasure.org", "code": "kg"})
    );
}

#[test]
fn writes_create_items_in_definition_order() {
    let mut form = FormEngine::open(definition("follow_up"), None, EngineConfig::default());
    let reason = form.find("visit-reason").expect("reason");
    let date = form.find("visit-date").expect("date");
    form.set_answer(reason, 0, AnswerValue::String("Checkup".into()))
        .expect("reason");
    form.set_answer(date, 0, AnswerValue::Date("2024-03-01".into()))
        .expect("date");

    let visit = &form.response().item[0];
    assert_eq!(visit.link_id, "visit");
    let children: Vec<&str> = visit
        .children()
        .iter()
        .map(|item| item.link_id.as_str())
        .collect();
    assert_eq!(children, vec!["visit-date", "visit-reason"]);
}

#[test]
fn type_mismatches_are_rejected_without_touching_the_document() {
    let mut form = FormEngine::open(definition("follow_up"), None, EngineConfig::default());
    let weight = form.find("weight").expect("weight");
    let error = form
        .set_answer(weight, 0, AnswerValue::Boolean(true))
        .unwrap_err();
    assert_eq!(
        error.to_string(),
        "valueBoolean cannot be stored on item 'weight' of type quantity"
    );
    assert!(form.response().item.is_empty());
}

#[test]
fn expression_bounds_flag_out_of_range_answers() {
    let mut form = open(json!({
        "resourceType": "Questionnaire",
        "extension": [
            {"url": VARIABLE, "valueExpression": {"name": "low", "language": "text/fhirpath", "expression": "10"}}
        ],
        "item": [{
            "linkId": "score",
            "type": "integer",
            "extension": [
                {"url": MIN_VALUE, "valueInteger": 0, "extension": [
                    {"url": CQF_CALCULATED_VALUE, "valueExpression": fhirpath("%low")}
                ]},
                {"url": MAX_VALUE, "extension": [
                    {"url": CQF_CALCULATED_VALUE, "valueExpression": fhirpath("%low * 2")}
                ]}
            ]
        }]
    }));
    let score = form.find("score").expect("score");
    assert_eq!(form.min_value(score), Some(AnswerValue::Integer(10)));
    assert_eq!(form.max_value(score), Some(AnswerValue::Integer(20)));

    form.set_answer(score, 0, AnswerValue::Integer(5)).expect("write");
    let issues = form.issues().for_answer(score, 0);
    assert_eq!(issues.len(), 1);
    assert_eq!(issues[0].code, IssueCode::Value);
    assert!(!form.issues().is_valid());

    form.set_answer(score, 0, AnswerValue::Integer(15)).expect("write");
    assert!(form.issues().for_answer(score, 0).is_empty());
    assert!(form.issues().is_valid());

    form.set_answer(score, 0, AnswerValue::Integer(25)).expect("write");
    let issues = form.issues().for_answer(score, 0);
    assert_eq!(issues.len(), 1);
    assert!(issues[0].diagnostics.contains("at most 20"));
}

#[test]
fn incomparable_quantity_bounds_are_not_enforced() {
    let mut form = open(json!({
        "item": [{
            "linkId": "dose",
            "type": "quantity",
            "extension": [
                {"url": MAX_VALUE, "valueQuantity": {"value": 5, "system": "http://unitsofmeasure.org", "code": "g"}}
            ]
        }]
    }));
    let dose = form.find("dose").expect("dose");

    form.set_answer(dose, 0, AnswerValue::Quantity(Quantity::ucum(6000.0, "mg")))
        .expect("write");
    assert_eq!(form.issues().for_answer(dose, 0).len(), 1);

    form.set_answer(dose, 0, AnswerValue::Quantity(Quantity::ucum(6000.0, "invalid")))
        .expect("write");
    assert!(form.issues().for_answer(dose, 0).is_empty());
}

#[test]
fn repeats_expression_controls_answer_cardinality() {
    let mut form = open(json!({
        "item": [
            {"linkId": "multi", "type": "boolean"},
            {"linkId": "phone", "type": "string", "_repeats": {"extension": [
                {"url": CQF_EXPRESSION, "valueExpression": fhirpath("%resource.item.where(linkId = 'multi').answer.value")}
            ]}}
        ]
    }));
    let multi = form.find("multi").expect("multi");
    let phone = form.find("phone").expect("phone");

    form.set_answer(multi, 0, AnswerValue::Boolean(false)).expect("off");
    assert_eq!(form.max_count(phone), Some(1));
    assert!(form.add_answer(phone, AnswerValue::String("555-0100".into())).expect("first"));
    assert!(!form.add_answer(phone, AnswerValue::String("555-0101".into())).expect("full"));

    form.set_answer(multi, 0, AnswerValue::Boolean(true)).expect("on");
    assert_eq!(form.max_count(phone), None);
    assert!(form.add_answer(phone, AnswerValue::String("555-0101".into())).expect("second"));
    assert_eq!(form.answers(phone).len(), 2);

    form.set_answer(multi, 0, AnswerValue::Boolean(false)).expect("off again");
    assert_eq!(
        form.answers(phone),
        vec![AnswerValue::String("555-0100".into())]
    );
    assert!(!form.add_answer(phone, AnswerValue::String("555-0102".into())).expect("capped"));
    assert_eq!(form.answers(phone).len(), 1);
}

fn consent_form() -> FormEngine {
    open(json!({
        "item": [
            {"linkId": "consent", "type": "boolean"},
            {
                "linkId": "details",
                "type": "string",
                "enableWhen": [{"question": "consent", "operator": "=", "answerBoolean": true}],
                "extension": [{"url": INITIAL_EXPRESSION, "valueExpression": fhirpath("'Standard terms'")}]
            }
        ]
    }))
}

#[test]
fn initial_expression_runs_when_an_item_becomes_enabled() {
    let mut form = consent_form();
    let consent = form.find("consent").expect("consent");
    let details = form.find("details").expect("details");
    assert!(!form.is_enabled(details));
    assert!(form.answers(details).is_empty());

    form.set_answer(consent, 0, AnswerValue::Boolean(true)).expect("enable");
    assert!(form.is_enabled(details));
    assert_eq!(
        form.answers(details),
        vec![AnswerValue::String("Standard terms".into())]
    );
}

#[test]
fn user_edits_survive_a_disable_enable_cycle() {
    let mut form = consent_form();
    let consent = form.find("consent").expect("consent");
    let details = form.find("details").expect("details");
    form.set_answer(consent, 0, AnswerValue::Boolean(true)).expect("enable");
    form.set_answer(details, 0, AnswerValue::String("Custom terms".into()))
        .expect("edit");

    form.set_answer(consent, 0, AnswerValue::Boolean(false)).expect("disable");
    assert!(!form.is_enabled(details));
    form.set_answer(consent, 0, AnswerValue::Boolean(true)).expect("re-enable");
    assert_eq!(
        form.answers(details),
        vec![AnswerValue::String("Custom terms".into())]
    );

    form.clear_answer(details, 0).expect("clear");
    form.set_answer(consent, 0, AnswerValue::Boolean(false)).expect("disable");
    form.set_answer(consent, 0, AnswerValue::Boolean(true)).expect("re-enable");
    assert_eq!(
        form.answers(details),
        vec![AnswerValue::String("Standard terms".into())]
    );
}

#[test]
fn submission_drops_disabled_items() {
    let mut form = consent_form();
    let consent = form.find("consent").expect("consent");
    let details = form.find("details").expect("details");
    form.set_answer(consent, 0, AnswerValue::Boolean(true)).expect("enable");
    form.set_answer(consent, 0, AnswerValue::Boolean(false)).expect("disable");

    assert_eq!(form.answers(details).len(), 1);
    let submitted = form.submission();
    let link_ids: Vec<&str> = submitted
        .item
        .iter()
        .map(|item| item.link_id.as_str())
        .collect();
    assert_eq!(link_ids, vec!["consent"]);
}

#[test]
fn failing_expressions_name_their_purpose_and_reason() {
    let form = open(json!({
        "item": [{
            "linkId": "locked",
            "type": "string",
            "_readOnly": {"extension": [{"url": CQF_EXPRESSION, "valueExpression": fhirpath("%missing")}]}
        }]
    }));
    let locked = form.find("locked").expect("locked");
    assert!(!form.is_read_only(locked));

    let errors = form.slot_errors(locked);
    assert_eq!(errors.len(), 1);
    assert_eq!(
        errors[0].to_string(),
        "Failed to evaluate read-only expression \"%missing\" because it references unavailable data (%missing)"
    );
    let issues = form.issues().for_node(locked);
    assert_eq!(issues.len(), 1);
    assert_eq!(issues[0].code, IssueCode::Invariant);
    assert!(issues[0].diagnostics.starts_with("Failed to evaluate read-only expression"));
}

#[test]
fn enablement_failures_follow_the_configured_fallback() {
    let definition: Questionnaire = serde_json::from_value(json!({
        "item": [{
            "linkId": "gated",
            "type": "string",
            "extension": [{
                "url": "http://hl7.org/fhir/uv/sdc/StructureDefinition/sdc-questionnaire-enableWhenExpression",
                "valueExpression": fhirpath("%unknown")
            }]
        }]
    }))
    .expect("definition");

    let visible = FormEngine::open(definition.clone(), None, EngineConfig::default());
    let gated = visible.find("gated").expect("gated");
    assert!(visible.is_enabled(gated));
    assert_eq!(visible.issues().for_node(gated)[0].severity, Severity::Warning);

    let hidden = FormEngine::open(
        definition.clone(),
        None,
        EngineConfig {
            enablement_fallback: VisibilityMode::Hidden,
            ..EngineConfig::default()
        },
    );
    assert!(!hidden.is_enabled(gated));

    let strict = FormEngine::open(
        definition,
        None,
        EngineConfig {
            enablement_fallback: VisibilityMode::Error,
            ..EngineConfig::default()
        },
    );
    assert!(strict.is_enabled(gated));
    assert_eq!(strict.issues().for_node(gated)[0].severity, Severity::Error);
    assert!(!strict.issues().is_valid());
}

#[test]
fn duplicate_variables_are_reported_at_the_form_root() {
    let form = open(json!({
        "extension": [
            {"url": VARIABLE, "valueExpression": {"name": "score", "language": "text/fhirpath", "expression": "1"}},
            {"url": VARIABLE, "valueExpression": {"name": "score", "language": "text/fhirpath", "expression": "2"}}
        ],
        "item": [{"linkId": "q", "type": "integer"}]
    }));

    let form_issues = form.issues().form_level();
    assert_eq!(form_issues.len(), 1);
    assert_eq!(form_issues[0].code, IssueCode::Duplicate);
    assert_eq!(form_issues[0].severity, Severity::Warning);

    let value = form.variable(None, "score").expect("declared").expect("value");
    assert_eq!(value, vec![qr_engine::FhirPathValue::Integer(1)]);
}

#[test]
fn shadowed_variables_resolve_to_the_nearest_scope() {
    let form = open(json!({
        "extension": [
            {"url": VARIABLE, "valueExpression": {"name": "label", "language": "text/fhirpath", "expression": "'form'"}}
        ],
        "item": [{
            "linkId": "section",
            "type": "group",
            "extension": [
                {"url": VARIABLE, "valueExpression": {"name": "label", "language": "text/fhirpath", "expression": "'section'"}}
            ],
            "item": [{"linkId": "inner", "type": "string"}]
        }]
    }));
    let inner = form.find("inner").expect("inner");
    assert_eq!(
        form.evaluate(Some(inner), "%label").expect("inner"),
        vec![qr_engine::FhirPathValue::String("section".into())]
    );
    assert_eq!(
        form.evaluate(None, "%label").expect("root"),
        vec![qr_engine::FhirPathValue::String("form".into())]
    );
    assert!(form.issues().form_level().is_empty());
}

#[test]
fn repeating_group_instances_get_their_own_variables() {
    let mut form = FormEngine::open(definition("medications"), None, EngineConfig::default());
    let total = form.find("total").expect("total");
    assert_eq!(form.answers(total), vec![AnswerValue::Integer(0)]);

    let first_dose = form.find("dose").expect("dose");
    form.set_answer(first_dose, 0, AnswerValue::Integer(1)).expect("dose");
    assert_eq!(form.answers(total), vec![AnswerValue::Integer(1)]);

    let first = form.find("medication").expect("medication");
    let second = form
        .add_group_instance(first)
        .expect("add")
        .expect("second instance");
    assert_eq!(form.tree().instances("medication"), vec![first, second]);

    let doses = form.tree().instances("dose");
    form.set_answer(doses[1], 0, AnswerValue::Integer(3)).expect("dose");

    let daily: Vec<Vec<AnswerValue>> = form
        .tree()
        .instances("daily")
        .into_iter()
        .map(|node| form.answers(node))
        .collect();
    assert_eq!(
        daily,
        vec![vec![AnswerValue::Integer(2)], vec![AnswerValue::Integer(6)]]
    );
    assert_eq!(form.answers(total), vec![AnswerValue::Integer(2)]);
}

#[test]
fn group_instances_respect_max_occurs() {
    let mut form = FormEngine::open(definition("medications"), None, EngineConfig::default());
    let first = form.find("medication").expect("medication");
    assert!(form.add_group_instance(first).expect("second").is_some());
    assert!(form.add_group_instance(first).expect("third").is_some());
    assert_eq!(form.add_group_instance(first).expect("fourth"), None);
    assert_eq!(form.tree().instances("medication").len(), 3);

    let instances = form.tree().instances("medication");
    form.remove_group_instance(instances[1]).expect("remove");
    assert_eq!(form.tree().instances("medication").len(), 2);
    assert_eq!(form.response().item.iter().filter(|item| item.link_id == "medication").count(), 2);
}

#[test]
fn required_questions_are_reported_per_instance() {
    let mut form = FormEngine::open(definition("medications"), None, EngineConfig::default());
    let first = form.find("medication").expect("medication");
    form.add_group_instance(first).expect("second");

    let required: Vec<_> = form
        .issues()
        .issues()
        .iter()
        .filter(|issue| issue.code == IssueCode::Required)
        .collect();
    assert_eq!(required.len(), 2);
    assert_eq!(required[0].location.as_deref(), Some("medication/drug"));

    let drugs = form.tree().instances("drug");
    form.set_answer(drugs[0], 0, AnswerValue::String("Aspirin".into()))
        .expect("drug");
    form.set_answer(drugs[1], 0, AnswerValue::String("Ibuprofen".into()))
        .expect("drug");
    assert!(form.issues().is_valid());
}

#[test]
fn answering_again_after_a_clear_reuses_the_emptied_answer() {
    let saved: QuestionnaireResponse =
        serde_json::from_str(fixture("follow_up_response")).expect("response");
    let mut form = FormEngine::open(definition("follow_up"), Some(saved), EngineConfig::default());
    let follow_up = form.find("follow-up").expect("follow-up");
    let notes = form.find("follow-up-notes").expect("notes");

    form.clear_answer(follow_up, 0).expect("clear");
    assert!(form.answers(follow_up).is_empty());
    assert!(form.add_answer(follow_up, yes()).expect("add"));
    assert_eq!(form.answers(follow_up), vec![yes()]);
    assert_eq!(
        form.answers(notes),
        vec![AnswerValue::String("Call in the afternoon".into())]
    );
    assert_eq!(form.response().item[0].answers().len(), 1);
    assert!(!form.add_answer(follow_up, no()).expect("full"));
}

#[test]
fn repeating_answers_fill_an_emptied_answer_before_appending() {
    let definition: Questionnaire = serde_json::from_value(json!({
        "item": [{
            "linkId": "allergy",
            "type": "string",
            "repeats": true,
            "item": [{"linkId": "reaction", "type": "string"}]
        }]
    }))
    .expect("definition");
    let saved: QuestionnaireResponse = serde_json::from_value(json!({
        "item": [{"linkId": "allergy", "answer": [
            {"item": [{"linkId": "reaction", "answer": [{"valueString": "rash"}]}]}
        ]}]
    }))
    .expect("response");
    let mut form = FormEngine::open(definition, Some(saved), EngineConfig::default());
    let allergy = form.find("allergy").expect("allergy");

    assert!(form.add_answer(allergy, AnswerValue::String("latex".into())).expect("first"));
    assert!(form.add_answer(allergy, AnswerValue::String("pollen".into())).expect("second"));

    let document = serde_json::to_value(form.response()).expect("serialize");
    assert_eq!(
        document["item"][0]["answer"],
        json!([
            {"valueString": "latex", "item": [{"linkId": "reaction", "answer": [{"valueString": "rash"}]}]},
            {"valueString": "pollen"}
        ])
    );
}

fn switchable_group() -> FormEngine {
    open(json!({
        "item": [
            {"linkId": "multi", "type": "boolean"},
            {
                "linkId": "meds",
                "type": "group",
                "_repeats": {"extension": [
                    {"url": CQF_EXPRESSION, "valueExpression": fhirpath("%resource.item.where(linkId = 'multi').answer.value")}
                ]},
                "item": [{"linkId": "med-name", "type": "string"}]
            }
        ]
    }))
}

#[test]
fn computed_repeats_drive_group_instances() {
    let mut form = switchable_group();
    let multi = form.find("multi").expect("multi");
    let meds = form.find("meds").expect("meds");
    assert!(form.add_group_instance(meds).is_err());

    form.set_answer(multi, 0, AnswerValue::Boolean(true)).expect("on");
    let second = form
        .add_group_instance(meds)
        .expect("add")
        .expect("second instance");
    assert_eq!(form.tree().instances("meds"), vec![meds, second]);
    assert_eq!(form.tree().instances("med-name").len(), 2);

    let names = form.tree().instances("med-name");
    form.set_answer(names[1], 0, AnswerValue::String("Ibuprofen".into()))
        .expect("name");
    assert_eq!(
        form.answers(names[1]),
        vec![AnswerValue::String("Ibuprofen".into())]
    );

    form.set_answer(multi, 0, AnswerValue::Boolean(false)).expect("off");
    assert_eq!(form.tree().instances("meds"), vec![meds]);
    let stored = form
        .response()
        .item
        .iter()
        .filter(|item| item.link_id == "meds")
        .count();
    assert_eq!(stored, 1);
}

#[test]
fn shrinking_repeats_keeps_the_first_value_and_nested_answers() {
    let definition: Questionnaire = serde_json::from_value(json!({
        "item": [
            {"linkId": "multi", "type": "boolean"},
            {
                "linkId": "q",
                "type": "string",
                "_repeats": {"extension": [
                    {"url": CQF_EXPRESSION, "valueExpression": fhirpath("%resource.item.where(linkId = 'multi').answer.value")}
                ]},
                "item": [{"linkId": "note", "type": "string"}]
            }
        ]
    }))
    .expect("definition");
    let saved: QuestionnaireResponse = serde_json::from_value(json!({
        "item": [
            {"linkId": "multi", "answer": [{"valueBoolean": true}]},
            {"linkId": "q", "answer": [
                {"item": [{"linkId": "note", "answer": [{"valueString": "kept"}]}]},
                {"valueString": "A"},
                {"valueString": "B"}
            ]}
        ]
    }))
    .expect("response");
    let mut form = FormEngine::open(definition, Some(saved), EngineConfig::default());
    let multi = form.find("multi").expect("multi");
    let q = form.find("q").expect("q");
    assert_eq!(
        form.answers(q),
        vec![AnswerValue::String("A".into()), AnswerValue::String("B".into())]
    );

    form.set_answer(multi, 0, AnswerValue::Boolean(false)).expect("off");
    assert_eq!(form.answers(q), vec![AnswerValue::String("A".into())]);
    let document = serde_json::to_value(form.response()).expect("serialize");
    assert_eq!(
        document["item"][1]["answer"][0]["item"][0]["answer"][0]["valueString"],
        "kept"
    );
}

#[test]
fn computed_read_only_on_a_group_overrides_static_child_flags() {
    let form = open(json!({
        "item": [{
            "linkId": "section",
            "type": "group",
            "_readOnly": {"extension": [{"url": CQF_EXPRESSION, "valueExpression": fhirpath("true")}]},
            "item": [{"linkId": "field", "type": "string", "readOnly": false}]
        }]
    }));
    let section = form.find("section").expect("section");
    let field = form.find("field").expect("field");
    assert!(form.is_read_only(section));
    assert!(form.is_read_only(field));
}

#[test]
fn read_only_questions_do_not_lock_items_under_their_answers() {
    let form = open(json!({
        "item": [{
            "linkId": "smoker",
            "type": "boolean",
            "readOnly": true,
            "item": [{"linkId": "packs", "type": "integer"}]
        }]
    }));
    let smoker = form.find("smoker").expect("smoker");
    let packs = form.find("packs").expect("packs");
    assert!(form.is_read_only(smoker));
    assert!(!form.is_read_only(packs));
}

#[test]
fn text_expression_replaces_static_text_when_it_yields_a_value() {
    let mut form = open(json!({
        "item": [
            {"linkId": "name", "type": "string"},
            {
                "linkId": "greeting",
                "type": "display",
                "text": "Welcome",
                "_text": {"extension": [
                    {"url": CQF_EXPRESSION, "valueExpression": fhirpath("%resource.item.where(linkId = 'name').answer.value")}
                ]}
            }
        ]
    }));
    let name = form.find("name").expect("name");
    let greeting = form.find("greeting").expect("greeting");
    assert_eq!(form.text(greeting).as_deref(), Some("Welcome"));

    form.set_answer(name, 0, AnswerValue::String("Ada".into())).expect("name");
    assert_eq!(form.text(greeting).as_deref(), Some("Ada"));
}

#[test]
fn initial_values_are_capped_at_max_count() {
    let form = open(json!({
        "item": [
            {
                "linkId": "colors",
                "type": "string",
                "repeats": true,
                "extension": [{"url": MAX_OCCURS, "valueInteger": 2}],
                "initial": [{"valueString": "red"}, {"valueString": "green"}, {"valueString": "blue"}]
            },
            {
                "linkId": "shape",
                "type": "string",
                "initial": [{"valueString": "circle"}, {"valueString": "square"}]
            }
        ]
    }));
    let colors = form.find("colors").expect("colors");
    let shape = form.find("shape").expect("shape");
    assert_eq!(
        form.answers(colors),
        vec![AnswerValue::String("red".into()), AnswerValue::String("green".into())]
    );
    assert_eq!(form.answers(shape), vec![AnswerValue::String("circle".into())]);
}

#[rstest]
#[case::boolean("boolean", AnswerValue::Boolean(true), json!(true))]
#[case::integer("integer", AnswerValue::Integer(7), json!(7))]
#[case::decimal("decimal", AnswerValue::Decimal(1.5), json!(1.5))]
#[case::string("string", AnswerValue::String("short".into()), json!("short"))]
#[case::text("text", AnswerValue::String("a longer note".into()), json!("a longer note"))]
#[case::url("url", AnswerValue::Uri("http://example.org/a".into()), json!("http://example.org/a"))]
#[case::date("date", AnswerValue::Date("2024-03-01".into()), json!("2024-03-01"))]
#[case::date_time(
    "dateTime",
    AnswerValue::DateTime("2024-03-01T10:30:00Z".into()),
    json!("2024-03-01T10:30:00Z")
)]
#[case::time("time", AnswerValue::Time("10:30:00".into()), json!("10:30:00"))]
#[case::coding(
    "coding",
    AnswerValue::Coding(Coding::new("http://loinc.org", "LA33-6").with_display("Yes")),
    json!({"system": "http://loinc.org", "code": "LA33-6", "display": "Yes"})
)]
#[case::attachment(
    "attachment",
    AnswerValue::Attachment(Attachment {
        content_type: Some("text/plain".into()),
        url: Some("http://example.org/report.txt".into()),
        title: Some("Report".into()),
        ..Attachment::default()
    }),
    json!({"contentType": "text/plain", "url": "http://example.org/report.txt", "title": "Report"})
)]
#[case::reference(
    "reference",
    AnswerValue::Reference(Reference {
        reference: Some("Patient/1".into()),
        display: Some("Pat".into()),
        ..Reference::default()
    }),
    json!({"reference": "Patient/1", "display": "Pat"})
)]
fn answers_survive_a_save_and_reload(
    #[case] kind: &str,
    #[case] value: AnswerValue,
    #[case] wire: Value,
) {
    let definition: Questionnaire =
        serde_json::from_value(json!({"item": [{"linkId": "q", "type": kind}]})).expect("definition");
    let mut form = FormEngine::open(definition.clone(), None, EngineConfig::default());
    let q = form.find("q").expect("q");
    form.set_answer(q, 0, value.clone()).expect("write");
    assert_eq!(form.answers(q), vec![value.clone()]);

    let document = serde_json::to_value(form.response()).expect("serialize");
    assert_eq!(document["item"][0]["answer"][0][value.wire_key()], wire);

    let saved: QuestionnaireResponse = serde_json::from_value(document).expect("reparse");
    let reopened = FormEngine::open(definition, Some(saved), EngineConfig::default());
    let q = reopened.find("q").expect("q");
    assert_eq!(reopened.answers(q), vec![value]);
}
