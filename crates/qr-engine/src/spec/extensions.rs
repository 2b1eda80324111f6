//! Recognized extension URLs and lookups over extension lists.

use crate::datatypes::{AnswerValue, Expression};
use crate::spec::questionnaire::{Element, Extension};

pub const MIN_VALUE: &str = "http://hl7.org/fhir/StructureDefinition/minValue";
pub const MAX_VALUE: &str = "http://hl7.org/fhir/StructureDefinition/maxValue";
pub const MIN_LENGTH: &str = "http://hl7.org/fhir/StructureDefinition/minLength";
pub const MIN_OCCURS: &str = "http://hl7.org/fhir/StructureDefinition/questionnaire-minOccurs";
pub const MAX_OCCURS: &str = "http://hl7.org/fhir/StructureDefinition/questionnaire-maxOccurs";
pub const VARIABLE: &str = "http://hl7.org/fhir/StructureDefinition/variable";
pub const INITIAL_EXPRESSION: &str =
    "http://hl7.org/fhir/uv/sdc/StructureDefinition/sdc-questionnaire-initialExpression";
pub const CALCULATED_EXPRESSION: &str =
    "http://hl7.org/fhir/uv/sdc/StructureDefinition/sdc-questionnaire-calculatedExpression";
pub const ENABLE_WHEN_EXPRESSION: &str =
    "http://hl7.org/fhir/uv/sdc/StructureDefinition/sdc-questionnaire-enableWhenExpression";
pub const HIDDEN: &str = "http://hl7.org/fhir/StructureDefinition/questionnaire-hidden";
pub const ITEM_CONTROL: &str = "http://hl7.org/fhir/StructureDefinition/questionnaire-itemControl";
pub const SLIDER_STEP_VALUE: &str =
    "http://hl7.org/fhir/StructureDefinition/questionnaire-sliderStepValue";
pub const ENTRY_FORMAT: &str = "http://hl7.org/fhir/StructureDefinition/entryFormat";
pub const UNIT: &str = "http://hl7.org/fhir/StructureDefinition/questionnaire-unit";
pub const UNIT_OPTION: &str = "http://hl7.org/fhir/StructureDefinition/questionnaire-unitOption";
/// Dynamic value for a primitive element (`_text`, `_readOnly`, ...).
pub const CQF_EXPRESSION: &str = "http://hl7.org/fhir/StructureDefinition/cqf-expression";
/// Dynamic value nested inside a bound extension.
pub const CQF_CALCULATED_VALUE: &str =
    "http://hl7.org/fhir/StructureDefinition/cqf-calculatedValue";

pub fn find<'a>(extensions: &'a [Extension], url: &str) -> Option<&'a Extension> {
    extensions.iter().find(|ext| ext.url == url)
}

/// FHIRPath source of the first extension with `url` carrying an expression.
pub fn expression<'a>(extensions: &'a [Extension], url: &str) -> Option<&'a str> {
    extensions
        .iter()
        .filter(|ext| ext.url == url)
        .find_map(|ext| ext.value_expression.as_ref().and_then(Expression::fhirpath))
}

/// Expression attached to a primitive element through `cqf-expression`.
pub fn element_expression(element: Option<&Element>) -> Option<&str> {
    element.and_then(|element| expression(&element.extension, CQF_EXPRESSION))
}

/// Named variable declarations.
pub fn variables(extensions: &[Extension]) -> impl Iterator<Item = &Expression> {
    extensions
        .iter()
        .filter(|ext| ext.url == VARIABLE)
        .filter_map(|ext| ext.value_expression.as_ref())
}

/// Where a min/max bound comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum BoundSource<'a> {
    Static(AnswerValue),
    Expression(&'a str),
}

/// Reads a `minValue` / `maxValue` style extension. A nested `cqf-calculatedValue`
/// expression takes precedence over the static value.
pub fn bound<'a>(extensions: &'a [Extension], url: &str) -> Option<BoundSource<'a>> {
    let ext = find(extensions, url)?;
    if let Some(source) = expression(&ext.extension, CQF_CALCULATED_VALUE)
        .or_else(|| ext.value_expression.as_ref().and_then(Expression::fhirpath))
    {
        return Some(BoundSource::Expression(source));
    }
    ext.value.value().map(BoundSource::Static)
}
