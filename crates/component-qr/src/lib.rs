use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::debug;

use qr_engine::datatypes::ValueChoice;
use qr_engine::{
    AnswerValue, EngineConfig, ExpressionError, FormEngine, Questionnaire, QuestionnaireResponse,
    StructuralError, build_render_payload, render_json_ui as qr_render_json_ui,
    render_text as qr_render_text,
};

const DEFAULT_QUESTIONNAIRE: &str =
    include_str!("../../qr-engine/tests/fixtures/follow_up.json");

#[derive(Debug, Error)]
enum ComponentError {
    #[error("failed to parse config: {0}")]
    ConfigParse(#[source] serde_json::Error),
    #[error("failed to parse questionnaire: {0}")]
    DefinitionParse(#[source] serde_json::Error),
    #[error("failed to parse response: {0}")]
    ResponseParse(#[source] serde_json::Error),
    #[error("failed to parse answer: {0}")]
    AnswerParse(#[source] serde_json::Error),
    #[error("form '{0}' is not available")]
    FormUnavailable(String),
    #[error("item '{0}' is not part of the form")]
    UnknownItem(String),
    #[error("answer for '{0}' carries no value")]
    EmptyAnswer(String),
    #[error("json encode error: {0}")]
    JsonEncode(#[source] serde_json::Error),
    #[error(transparent)]
    Structural(#[from] StructuralError),
    #[error("expression failed: {0}")]
    Expression(#[from] ExpressionError),
}

#[derive(Debug, Deserialize, Serialize, Default)]
struct ComponentConfig {
    #[serde(default)]
    questionnaire_json: Option<String>,
    #[serde(default)]
    engine: EngineConfig,
}

fn load_config(config_json: &str) -> Result<ComponentConfig, ComponentError> {
    if config_json.trim().is_empty() {
        return Ok(ComponentConfig::default());
    }
    serde_json::from_str(config_json).map_err(ComponentError::ConfigParse)
}

fn load_definition(config: &ComponentConfig) -> Result<Questionnaire, ComponentError> {
    let source = config
        .questionnaire_json
        .as_deref()
        .unwrap_or(DEFAULT_QUESTIONNAIRE);
    serde_json::from_str(source).map_err(ComponentError::DefinitionParse)
}

fn ensure_form(form_id: &str, definition: &Questionnaire) -> Result<(), ComponentError> {
    if definition.id.as_deref() == Some(form_id) {
        Ok(())
    } else {
        Err(ComponentError::FormUnavailable(form_id.to_string()))
    }
}

fn parse_response(response_json: &str) -> Result<Option<QuestionnaireResponse>, ComponentError> {
    if response_json.trim().is_empty() {
        return Ok(None);
    }
    serde_json::from_str(response_json)
        .map(Some)
        .map_err(ComponentError::ResponseParse)
}

/// Opens the engine for `form_id` over the response carried by the caller.
fn open(form_id: &str, config_json: &str, response_json: &str) -> Result<FormEngine, ComponentError> {
    let config = load_config(config_json)?;
    let definition = load_definition(&config)?;
    ensure_form(form_id, &definition)?;
    let response = parse_response(response_json)?;
    Ok(FormEngine::open(definition, response, config.engine))
}

/// Accepts a single `{"valueX": ...}` answer object or an array of them.
fn parse_answers(link_id: &str, value_json: &str) -> Result<Vec<AnswerValue>, ComponentError> {
    let value: Value = serde_json::from_str(value_json).map_err(ComponentError::AnswerParse)?;
    let entries = match value {
        Value::Array(entries) => entries,
        other => vec![other],
    };
    entries
        .into_iter()
        .map(|entry| {
            let choice: ValueChoice =
                serde_json::from_value(entry).map_err(ComponentError::AnswerParse)?;
            choice
                .into_value()
                .ok_or_else(|| ComponentError::EmptyAnswer(link_id.to_string()))
        })
        .collect()
}

fn response_value(engine: &FormEngine) -> Result<Value, ComponentError> {
    serde_json::to_value(engine.response()).map_err(ComponentError::JsonEncode)
}

fn respond(result: Result<Value, ComponentError>) -> String {
    match result {
        Ok(value) => serde_json::to_string(&value).unwrap_or_else(|error| {
            json!({"error": format!("json encode: {}", error)}).to_string()
        }),
        Err(err) => json!({ "error": err.to_string() }).to_string(),
    }
}

fn respond_string(result: Result<String, ComponentError>) -> String {
    match result {
        Ok(value) => value,
        Err(err) => json!({ "error": err.to_string() }).to_string(),
    }
}

pub fn describe(form_id: &str, config_json: &str) -> String {
    respond(load_config(config_json).and_then(|config| {
        let definition = load_definition(&config)?;
        ensure_form(form_id, &definition)?;
        serde_json::to_value(definition).map_err(ComponentError::JsonEncode)
    }))
}

/// The response with defaulted fields, initial and calculated values settled.
pub fn open_response(form_id: &str, config_json: &str, response_json: &str) -> String {
    respond(open(form_id, config_json, response_json).and_then(|engine| response_value(&engine)))
}

/// Replaces the answers of the first instance of `link_id`.
pub fn set_answer(
    form_id: &str,
    config_json: &str,
    response_json: &str,
    link_id: &str,
    value_json: &str,
) -> String {
    respond(open(form_id, config_json, response_json).and_then(|mut engine| {
        let node = engine
            .find(link_id)
            .ok_or_else(|| ComponentError::UnknownItem(link_id.to_string()))?;
        let values = parse_answers(link_id, value_json)?;
        debug!(link_id, count = values.len(), "setting answers");
        engine.set_answers(node, values)?;
        response_value(&engine)
    }))
}

pub fn clear_answer(form_id: &str, config_json: &str, response_json: &str, link_id: &str) -> String {
    respond(open(form_id, config_json, response_json).and_then(|mut engine| {
        let node = engine
            .find(link_id)
            .ok_or_else(|| ComponentError::UnknownItem(link_id.to_string()))?;
        engine.clear_answers(node)?;
        response_value(&engine)
    }))
}

/// `{"valid": bool, "outcome": OperationOutcome, "submission": response}`.
pub fn validate_response(form_id: &str, config_json: &str, response_json: &str) -> String {
    respond(open(form_id, config_json, response_json).and_then(|engine| {
        let submission =
            serde_json::to_value(engine.submission()).map_err(ComponentError::JsonEncode)?;
        Ok(json!({
            "valid": engine.issues().is_valid(),
            "outcome": engine.issues().to_operation_outcome(),
            "submission": submission,
        }))
    }))
}

/// Evaluates a FHIRPath expression at the form root.
pub fn evaluate(form_id: &str, config_json: &str, response_json: &str, expression: &str) -> String {
    respond(open(form_id, config_json, response_json).and_then(|engine| {
        let collection = engine.evaluate(None, expression)?;
        let values: Vec<Value> = collection.iter().map(|value| value.to_json()).collect();
        Ok(json!({ "result": values }))
    }))
}

pub fn render_text(form_id: &str, config_json: &str, response_json: &str) -> String {
    respond_string(
        open(form_id, config_json, response_json)
            .map(|engine| qr_render_text(&build_render_payload(&engine))),
    )
}

pub fn render_json_ui(form_id: &str, config_json: &str, response_json: &str) -> String {
    respond(
        open(form_id, config_json, response_json)
            .map(|engine| qr_render_json_ui(&build_render_payload(&engine))),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const FORM: &str = "follow-up-form";

    fn parse(output: &str) -> Value {
        serde_json::from_str(output).expect("json")
    }

    fn answered() -> String {
        parse(&set_answer(
            FORM,
            "",
            "",
            "follow-up",
            r#"{"valueCoding": {"system": "http://loinc.org", "code": "LA33-6", "display": "Yes"}}"#,
        ))
        .to_string()
    }

    #[test]
    fn describe_returns_definition_json() {
        let definition = parse(&describe(FORM, ""));
        assert_eq!(definition["id"], FORM);
        assert_eq!(definition["item"][0]["linkId"], "follow-up");
    }

    #[test]
    fn unknown_form_is_an_error() {
        let output = parse(&describe("other", ""));
        assert_eq!(output["error"], "form 'other' is not available");
    }

    #[test]
    fn open_response_fills_defaults() {
        let response = parse(&open_response(FORM, "", ""));
        assert_eq!(
            response,
            json!({
                "resourceType": "QuestionnaireResponse",
                "questionnaire": "http://example.org/Questionnaire/follow-up|1.0.0",
                "status": "in-progress"
            })
        );
    }

    #[test]
    fn set_answer_stores_typed_value() {
        let response = parse(&answered());
        assert_eq!(response["item"][0]["linkId"], "follow-up");
        assert_eq!(response["item"][0]["answer"][0]["valueCoding"]["code"], "LA33-6");
    }

    #[test]
    fn set_answer_rejects_mismatched_types() {
        let output = parse(&set_answer(FORM, "", "", "weight", r#"{"valueBoolean": true}"#));
        assert_eq!(
            output["error"],
            "valueBoolean cannot be stored on item 'weight' of type quantity"
        );
        let output = parse(&set_answer(FORM, "", "", "nope", r#"{"valueString": "x"}"#));
        assert_eq!(output["error"], "item 'nope' is not part of the form");
    }

    #[test]
    fn clear_answer_drops_value() {
        let response = parse(&clear_answer(FORM, "", &answered(), "follow-up"));
        assert!(response["item"][0]["answer"].is_null());
    }

    #[test]
    fn validate_response_reports_outcome() {
        let empty = parse(&validate_response(FORM, "", ""));
        assert_eq!(empty["valid"], false);
        assert_eq!(empty["outcome"]["issue"][0]["code"], "required");

        let complete = parse(&validate_response(FORM, "", &answered()));
        assert_eq!(complete["valid"], true);
        assert_eq!(complete["outcome"]["issue"], json!([]));
        assert_eq!(complete["submission"]["item"][0]["linkId"], "follow-up");
    }

    #[test]
    fn evaluate_runs_against_the_response() {
        let output = parse(&evaluate(
            FORM,
            "",
            &answered(),
            "%resource.item.where(linkId = 'follow-up').answer.value.code",
        ));
        assert_eq!(output["result"], json!(["LA33-6"]));

        let output = parse(&evaluate(FORM, "", "", "1 +"));
        assert!(output["error"].as_str().is_some_and(|error| error.starts_with("expression failed")));
    }

    #[test]
    fn custom_questionnaire_and_engine_config() {
        let definition = json!({
            "resourceType": "Questionnaire",
            "id": "custom",
            "status": "active",
            "item": [{
                "linkId": "broken",
                "type": "string",
                "extension": [{
                    "url": "http://hl7.org/fhir/uv/sdc/StructureDefinition/sdc-questionnaire-enableWhenExpression",
                    "valueExpression": {"language": "text/fhirpath", "expression": "%missing"}
                }]
            }]
        });
        let config = json!({
            "questionnaire_json": definition.to_string(),
            "engine": {"enablement_fallback": "hidden"}
        });
        let ui = parse(&render_json_ui("custom", &config.to_string(), ""));
        assert_eq!(ui["items"][0]["visible"], false);
        assert_eq!(ui["progress"]["total"], 0);
    }

    #[test]
    fn render_text_outputs_summary() {
        let output = render_text(FORM, "", "");
        assert!(output.starts_with("Form: Discharge follow-up"));
        assert!(output.contains("Visible items:"));
    }
}
