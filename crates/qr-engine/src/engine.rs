//! The live form: response document, node tree and computed properties.
//!
//! Reads are pull-based. Every computed property evaluates its expression slot on
//! demand and memoizes the result against the current revision; every write bumps
//! the revision, resynchronizes the tree, settles calculated and initial values and
//! re-runs validation before listeners see the new document.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Value, json};
use tracing::{debug, trace, warn};

use crate::codec;
use crate::config::EngineConfig;
use crate::datatypes::{AnswerValue, Coding, UCUM_SYSTEM};
use crate::error::{StructuralError, StructuralResult};
use crate::expr::{ExpressionSlot, SlotError};
use crate::fhirpath::{
    self, Collection, Environment, Evaluator, ExpressionError, ExpressionResult, FhirPathValue,
    singleton_boolean,
};
use crate::locator::{self, Selector};
use crate::path_index::PathIndex;
use crate::response::{QuestionnaireResponse, ResponseItem};
use crate::scope::{ScopeId, Variable};
use crate::spec::{BoundSource, ItemType, Questionnaire, extensions};
use crate::tree::{GroupRepeats, Node, NodeId, NodeKind, NodeTree};
use crate::validate::{self, ValidationReport};
use crate::valueset::ExpansionError;
use crate::visibility;

const SNOMED_SYSTEM: &str = "http://snomed.info/sct";
const LOINC_SYSTEM: &str = "http://loinc.org";

/// Answer-option list of one question.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum OptionsState {
    #[default]
    Idle,
    Loading,
    Ready(Vec<AnswerValue>),
    /// Expansion failed; the last good list stays available for retry.
    Failed {
        reason: String,
        previous: Vec<AnswerValue>,
    },
}

impl OptionsState {
    /// Options a renderer can offer right now.
    pub fn available(&self) -> &[AnswerValue] {
        match self {
            OptionsState::Ready(values) => values,
            OptionsState::Failed { previous, .. } => previous,
            OptionsState::Idle | OptionsState::Loading => &[],
        }
    }
}

/// Identifies one expansion request. Only the latest ticket per question is honored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OptionsTicket {
    pub node: NodeId,
    serial: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionsRequest {
    pub ticket: OptionsTicket,
    pub url: String,
}

#[derive(Debug, Default)]
struct OptionsEntry {
    state: OptionsState,
    pending: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Listener = Box<dyn FnMut(&QuestionnaireResponse)>;

enum Action {
    Replace { node: NodeId, values: Vec<AnswerValue> },
    Truncate { node: NodeId, max: usize },
    TruncateInstances { node: NodeId, max: usize },
}

pub struct FormEngine {
    definition: Arc<Questionnaire>,
    definition_json: Value,
    index: PathIndex,
    response: QuestionnaireResponse,
    tree: NodeTree,
    group_repeats: GroupRepeats,
    config: EngineConfig,
    revision: u64,
    snapshot: RefCell<Option<(u64, Value)>>,
    issues: ValidationReport,
    options: HashMap<NodeId, OptionsEntry>,
    next_serial: u64,
    listeners: Vec<(SubscriptionId, Listener)>,
    next_subscription: u64,
}

impl FormEngine {
    /// Opens a form instance. A missing response starts empty; a saved one has its
    /// defaulted top-level fields filled in.
    pub fn open(
        definition: Questionnaire,
        response: Option<QuestionnaireResponse>,
        config: EngineConfig,
    ) -> Self {
        let response = match response {
            Some(mut response) => {
                response.normalize(&definition);
                response
            }
            None => QuestionnaireResponse::for_questionnaire(&definition),
        };
        let definition_json = serde_json::to_value(&definition).unwrap_or_default();
        let index = PathIndex::build(&definition);
        debug!(items = index.len(), "opening form");
        let mut engine = Self {
            definition: Arc::new(definition),
            definition_json,
            index,
            response,
            tree: NodeTree::default(),
            group_repeats: GroupRepeats::new(),
            config,
            revision: 0,
            snapshot: RefCell::new(None),
            issues: ValidationReport::default(),
            options: HashMap::new(),
            next_serial: 0,
            listeners: Vec::new(),
            next_subscription: 0,
        };
        engine.refresh();
        engine
    }

    pub fn definition(&self) -> &Questionnaire {
        &self.definition
    }

    pub fn index(&self) -> &PathIndex {
        &self.index
    }

    pub fn tree(&self) -> &NodeTree {
        &self.tree
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// The live response document.
    pub fn response(&self) -> &QuestionnaireResponse {
        &self.response
    }

    /// Issues from the most recent validation pass.
    pub fn issues(&self) -> &ValidationReport {
        &self.issues
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.tree.get(id)
    }

    /// First node for `link_id` in document order.
    pub fn find(&self, link_id: &str) -> Option<NodeId> {
        self.tree.first(link_id)
    }

    fn require(&self, id: NodeId) -> StructuralResult<&Node> {
        self.tree
            .get(id)
            .ok_or(StructuralError::UnknownNode(id.index()))
    }

    // ----- computed properties -----

    /// Whether the node is active: its parent chain is enabled and its own
    /// enablement expression (or static conditions) hold.
    pub fn is_enabled(&self, id: NodeId) -> bool {
        let Some(node) = self.tree.get(id) else {
            return false;
        };
        if let Some(parent) = node.parent()
            && !self.is_enabled(parent)
        {
            return false;
        }
        self.enabled_locally(node)
    }

    fn enabled_locally(&self, node: &Node) -> bool {
        if let Some(slot) = &node.slots.enablement {
            return match self.slot_flag(node, slot) {
                Ok(flag) => flag.unwrap_or(false),
                Err(_) => self.config.enablement_fallback.fallback(),
            };
        }
        let item = node.item();
        visibility::conditions_hold(
            &item.enable_when,
            item.enable_behavior.unwrap_or_default(),
            |question| self.related_answers(node, question),
        )
    }

    /// Display text, from the text expression when one evaluates to a value.
    pub fn text(&self, id: NodeId) -> Option<String> {
        let node = self.tree.get(id)?;
        if let Some(slot) = &node.slots.text
            && let Ok(values) = self.slot_value(node, slot)
            && let Some(text) = values.first().and_then(FhirPathValue::to_display_string)
        {
            return Some(text);
        }
        node.item().text.clone()
    }

    /// Read-only state. A group's read-only state applies to everything below it; a
    /// question's does not reach the items nested under its answers.
    pub fn is_read_only(&self, id: NodeId) -> bool {
        let Some(node) = self.tree.get(id) else {
            return false;
        };
        if self.read_only_locally(node) {
            return true;
        }
        let mut current = node.parent();
        while let Some(ancestor) = current.and_then(|parent| self.tree.get(parent)) {
            if ancestor.kind() == NodeKind::Group && self.read_only_locally(ancestor) {
                return true;
            }
            current = ancestor.parent();
        }
        false
    }

    fn read_only_locally(&self, node: &Node) -> bool {
        self.dynamic_flag(node, node.slots.read_only.as_ref())
            .unwrap_or_else(|| node.item().is_read_only())
    }

    pub fn repeats(&self, id: NodeId) -> bool {
        self.tree.get(id).is_some_and(|node| {
            self.dynamic_flag(node, node.slots.repeats.as_ref())
                .unwrap_or_else(|| node.item().is_repeating())
        })
    }

    /// Most answers (or group instances) the node may hold; `None` is unbounded.
    pub fn max_count(&self, id: NodeId) -> Option<usize> {
        if !self.repeats(id) {
            return Some(1);
        }
        let node = self.tree.get(id)?;
        node.item().max_occurs().map(|max| max as usize)
    }

    pub fn min_count(&self, id: NodeId) -> usize {
        self.tree
            .get(id)
            .and_then(|node| node.item().min_occurs())
            .map(|min| min as usize)
            .unwrap_or(0)
    }

    pub fn is_required(&self, id: NodeId) -> bool {
        self.tree.get(id).is_some_and(|node| {
            self.dynamic_flag(node, node.slots.required.as_ref())
                .unwrap_or_else(|| node.item().is_required())
        })
    }

    pub fn is_hidden(&self, id: NodeId) -> bool {
        self.tree.get(id).is_some_and(|node| node.item().is_hidden())
    }

    pub fn min_value(&self, id: NodeId) -> Option<AnswerValue> {
        let node = self.tree.get(id)?;
        self.bound(node, node.slots.min_value.as_ref(), extensions::MIN_VALUE)
    }

    pub fn max_value(&self, id: NodeId) -> Option<AnswerValue> {
        let node = self.tree.get(id)?;
        self.bound(node, node.slots.max_value.as_ref(), extensions::MAX_VALUE)
    }

    /// A bound that fails to evaluate, or cannot be expressed in the item's type, is
    /// not enforced.
    fn bound(&self, node: &Node, slot: Option<&ExpressionSlot>, url: &str) -> Option<AnswerValue> {
        if let Some(slot) = slot {
            let values = self.slot_value(node, slot).ok()?;
            return values.first()?.to_answer(node.item().kind);
        }
        match extensions::bound(&node.item().extension, url)? {
            BoundSource::Static(value) => Some(value),
            BoundSource::Expression(_) => None,
        }
    }

    /// Stored answer values of a question, in order.
    pub fn answers(&self, id: NodeId) -> Vec<AnswerValue> {
        self.tree
            .get(id)
            .map(|node| self.stored(node))
            .unwrap_or_default()
    }

    /// Options for a question: static `answerOption` values, or the state of the
    /// value-set expansion.
    pub fn options(&self, id: NodeId) -> OptionsState {
        if let Some(entry) = self.options.get(&id) {
            return entry.state.clone();
        }
        match self.tree.get(id) {
            Some(node) if !node.item().answer_option.is_empty() => {
                OptionsState::Ready(static_options(node))
            }
            _ => OptionsState::Idle,
        }
    }

    // ----- expressions -----

    /// Evaluates `source` in the context of `node` (the form root when `None`).
    pub fn evaluate(&self, node: Option<NodeId>, source: &str) -> ExpressionResult<Collection> {
        let parsed = fhirpath::parse(source)?;
        let scope = node
            .and_then(|id| self.tree.get(id))
            .map(|node| node.scope)
            .unwrap_or(ScopeId::ROOT);
        let bindings = Bindings {
            engine: self,
            node,
            scope,
        };
        Evaluator::new(&bindings).evaluate(&parsed, &self.context_of(node))
    }

    /// Value of the variable `name` as seen from `node`.
    pub fn variable(&self, node: Option<NodeId>, name: &str) -> Option<Result<Collection, SlotError>> {
        let scope = node
            .and_then(|id| self.tree.get(id))
            .map(|node| node.scope)
            .unwrap_or(ScopeId::ROOT);
        let (owner, variable) = self.tree.scopes().resolve(scope, name)?;
        Some(self.variable_value(owner, variable))
    }

    /// Current failures of the node's own slots, including the variables it declares.
    pub fn slot_errors(&self, id: NodeId) -> Vec<SlotError> {
        let Some(node) = self.tree.get(id) else {
            return Vec::new();
        };
        let slots = &node.slots;
        let mut errors = Vec::new();
        for slot in [&slots.enablement, &slots.read_only, &slots.repeats, &slots.required]
            .into_iter()
            .flatten()
        {
            if let Err(error) = self.slot_flag(node, slot) {
                errors.push(error);
            }
        }
        for slot in [&slots.calculated, &slots.text, &slots.min_value, &slots.max_value]
            .into_iter()
            .flatten()
        {
            if let Err(error) = self.slot_value(node, slot) {
                errors.push(error);
            }
        }
        if let Some(error) = slots.initial.as_ref().and_then(ExpressionSlot::last_error) {
            errors.push(error);
        }
        for (scope_id, scope) in self.tree.scopes().iter() {
            if scope.owner != Some(id) {
                continue;
            }
            for variable in scope.variables() {
                if let Err(error) = self.variable_value(scope_id, variable) {
                    errors.push(error);
                }
            }
        }
        errors
    }

    /// Failures of form-level variables.
    pub fn form_errors(&self) -> Vec<SlotError> {
        self.tree
            .scopes()
            .scope(ScopeId::ROOT)
            .map(|root| {
                root.variables()
                    .iter()
                    .filter_map(|variable| self.variable_value(ScopeId::ROOT, variable).err())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn slot_value(&self, node: &Node, slot: &ExpressionSlot) -> Result<Collection, SlotError> {
        slot.get(self.revision, |parsed| {
            let bindings = Bindings {
                engine: self,
                node: Some(node.id()),
                scope: node.scope,
            };
            Evaluator::new(&bindings).evaluate(parsed, &self.context_of(Some(node.id())))
        })
    }

    fn slot_flag(&self, node: &Node, slot: &ExpressionSlot) -> Result<Option<bool>, SlotError> {
        let values = self.slot_value(node, slot)?;
        singleton_boolean(&values).map_err(|error| SlotError {
            purpose: slot.purpose(),
            source: slot.source().to_string(),
            error,
        })
    }

    /// Boolean from an optional slot; `None` when there is no slot, it yields nothing,
    /// or it fails.
    fn dynamic_flag(&self, node: &Node, slot: Option<&ExpressionSlot>) -> Option<bool> {
        slot.and_then(|slot| self.slot_flag(node, slot).ok().flatten())
    }

    fn variable_value(&self, scope: ScopeId, variable: &Variable) -> Result<Collection, SlotError> {
        let owner = self.tree.scopes().scope(scope).and_then(|entry| entry.owner);
        variable.slot.get(self.revision, |parsed| {
            let bindings = Bindings {
                engine: self,
                node: owner,
                scope,
            };
            Evaluator::new(&bindings).evaluate(parsed, &self.context_of(owner))
        })
    }

    /// The whole response as JSON, cached per revision.
    fn resource_json(&self) -> Value {
        let mut cache = self.snapshot.borrow_mut();
        if let Some((revision, value)) = cache.as_ref()
            && *revision == self.revision
        {
            return value.clone();
        }
        let value = serde_json::to_value(&self.response).unwrap_or_default();
        *cache = Some((self.revision, value.clone()));
        value
    }

    /// `%context` of a node: its response item, or a bare stub when nothing is stored
    /// yet. The form root's context is the whole response.
    fn context_of(&self, node: Option<NodeId>) -> Collection {
        let Some(node) = node.and_then(|id| self.tree.get(id)) else {
            return vec![FhirPathValue::Object(self.resource_json())];
        };
        let value = match self.response_item(node) {
            Some(item) => serde_json::to_value(item).unwrap_or_default(),
            None => json!({ "linkId": node.link_id() }),
        };
        vec![FhirPathValue::Object(value)]
    }

    fn response_item(&self, node: &Node) -> Option<&ResponseItem> {
        locator::locate_at(&self.index, &self.response, node.link_id(), node.selectors())
    }

    fn stored(&self, node: &Node) -> Vec<AnswerValue> {
        self.response_item(node)
            .map(|item| {
                codec::read_all(node.item().kind, item)
                    .into_iter()
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn answer_count(&self, node: &Node) -> usize {
        self.response_item(node)
            .map(|item| item.answers().len())
            .unwrap_or(0)
    }

    /// Answers carrying a value; capacity is measured in these.
    fn value_count(&self, node: &Node) -> usize {
        self.response_item(node)
            .map(|item| item.values().count())
            .unwrap_or(0)
    }

    /// First answer kept only for its nested items.
    fn first_vacant(&self, node: &Node) -> Option<usize> {
        self.response_item(node)?
            .answers()
            .iter()
            .position(|answer| answer.value.is_none())
    }

    fn at_capacity(&self, id: NodeId, node: &Node) -> bool {
        self.max_count(id)
            .is_some_and(|max| self.value_count(node) >= max)
    }

    /// Answers of `question` as seen from `node`: hops shared with the node's own
    /// path reuse its selectors, so conditions stay inside the same group instance.
    fn related_answers(&self, node: &Node, question: &str) -> Vec<&AnswerValue> {
        let (Some(target), Some(own)) = (self.index.path(question), self.index.path(node.link_id()))
        else {
            return Vec::new();
        };
        let shared = target
            .iter()
            .zip(own)
            .take_while(|(left, right)| left.link_id() == right.link_id())
            .count();
        let mut selectors: Vec<Selector> =
            node.selectors().iter().take(shared).copied().collect();
        if shared < target.len()
            && let Some(next) = node.selectors().get(shared)
        {
            selectors.push(Selector::answer(next.answer));
        }
        let kind = target[target.len() - 1].item.kind;
        locator::locate_at(&self.index, &self.response, question, &selectors)
            .map(|item| codec::read_all(kind, item))
            .unwrap_or_default()
    }

    // ----- writes -----

    fn address(&self, id: NodeId) -> StructuralResult<(String, Vec<Selector>, ItemType)> {
        let node = self.require(id)?;
        Ok((
            node.link_id().to_string(),
            node.selectors().to_vec(),
            node.item().kind,
        ))
    }

    fn question(&self, id: NodeId) -> StructuralResult<(String, Vec<Selector>, ItemType)> {
        let (link_id, selectors, kind) = self.address(id)?;
        if !kind.is_question() {
            return Err(StructuralError::NotAQuestion {
                link_id,
                kind: kind.as_str(),
            });
        }
        Ok((link_id, selectors, kind))
    }

    /// Stores `value` as answer `index`; `index` equal to the answer count appends.
    /// An append fills the first answer left without a value before adding a new
    /// one, and is ignored once the item holds as many values as it may.
    pub fn set_answer(&mut self, id: NodeId, index: usize, value: AnswerValue) -> StructuralResult<()> {
        let (link_id, selectors, kind) = self.question(id)?;
        codec::check(kind, &link_id, &value)?;
        let node = self.require(id)?;
        let count = self.answer_count(node);
        if index > count {
            return Err(StructuralError::NoSuchAnswer { link_id, index });
        }
        let index = if index == count {
            if self.at_capacity(id, node) {
                debug!(%link_id, count, "answer ignored, item is at capacity");
                return Ok(());
            }
            self.first_vacant(node).unwrap_or(count)
        } else {
            index
        };
        let item = locator::locate_or_create(&self.index, &mut self.response, &link_id, &selectors)?;
        codec::write(kind, item, index, value)?;
        self.commit("set_answer", &link_id);
        Ok(())
    }

    /// Replaces every answer. Values beyond the item's capacity are dropped.
    pub fn set_answers(&mut self, id: NodeId, mut values: Vec<AnswerValue>) -> StructuralResult<()> {
        let (link_id, selectors, kind) = self.question(id)?;
        for value in &values {
            codec::check(kind, &link_id, value)?;
        }
        if values.is_empty() {
            return self.clear_answers(id);
        }
        if let Some(max) = self.max_count(id) {
            values.truncate(max);
        }
        let item = locator::locate_or_create(&self.index, &mut self.response, &link_id, &selectors)?;
        codec::write_all(kind, item, values)?;
        self.commit("set_answers", &link_id);
        Ok(())
    }

    /// Adds an answer value, reusing an answer left without one. Returns `false`
    /// when the item is already full.
    pub fn add_answer(&mut self, id: NodeId, value: AnswerValue) -> StructuralResult<bool> {
        let (link_id, _, kind) = self.question(id)?;
        codec::check(kind, &link_id, &value)?;
        let node = self.require(id)?;
        if self.at_capacity(id, node) {
            debug!(%link_id, "add ignored, item is at capacity");
            return Ok(false);
        }
        let count = self.answer_count(node);
        self.set_answer(id, count, value)?;
        Ok(true)
    }

    /// Clears answer `index`, keeping the answer when it owns nested items.
    pub fn clear_answer(&mut self, id: NodeId, index: usize) -> StructuralResult<()> {
        let (link_id, selectors, kind) = self.question(id)?;
        let Some(item) = locator::locate_mut(&self.index, &mut self.response, &link_id, &selectors)
        else {
            return Ok(());
        };
        if index >= item.answers().len() {
            return Ok(());
        }
        codec::clear(kind, item, index);
        self.commit("clear_answer", &link_id);
        Ok(())
    }

    pub fn clear_answers(&mut self, id: NodeId) -> StructuralResult<()> {
        let (link_id, selectors, kind) = self.question(id)?;
        let Some(item) = locator::locate_mut(&self.index, &mut self.response, &link_id, &selectors)
        else {
            return Ok(());
        };
        if item.answer.is_none() {
            return Ok(());
        }
        codec::clear_all(kind, item);
        self.commit("clear_answers", &link_id);
        Ok(())
    }

    /// Removes answer `index` along with the items nested under it.
    pub fn remove_answer(&mut self, id: NodeId, index: usize) -> StructuralResult<()> {
        let (link_id, selectors, kind) = self.question(id)?;
        let item = locator::locate_mut(&self.index, &mut self.response, &link_id, &selectors)
            .ok_or_else(|| StructuralError::NoSuchAnswer {
                link_id: link_id.clone(),
                index,
            })?;
        codec::remove(kind, item, index)?;
        self.commit("remove_answer", &link_id);
        Ok(())
    }

    fn repeating_group(&self, id: NodeId) -> StructuralResult<(String, Vec<Selector>)> {
        let (link_id, selectors, kind) = self.address(id)?;
        if !kind.is_group() || !self.repeats(id) {
            return Err(StructuralError::NotRepeatingGroup(link_id));
        }
        Ok((link_id, selectors))
    }

    /// Appends an instance of the repeating group `id` belongs to. Returns the new
    /// instance, or `None` when max-occurs is reached.
    pub fn add_group_instance(&mut self, id: NodeId) -> StructuralResult<Option<NodeId>> {
        let (link_id, mut selectors) = self.repeating_group(id)?;
        let stored = locator::count_at(&self.index, &self.response, &link_id, &selectors);
        let visible = stored.max(1);
        if self.max_count(id).is_some_and(|max| visible >= max) {
            debug!(%link_id, visible, "group instance ignored, max occurs reached");
            return Ok(None);
        }
        let hop = selectors.len() - 1;
        for occurrence in stored..=visible {
            selectors[hop].occurrence = occurrence;
            locator::locate_or_create(&self.index, &mut self.response, &link_id, &selectors)?;
        }
        self.commit("add_group_instance", &link_id);
        Ok(self.tree.find(&link_id, &selectors))
    }

    /// Removes the stored instance `id` addresses. An instance with nothing stored is
    /// left alone.
    pub fn remove_group_instance(&mut self, id: NodeId) -> StructuralResult<()> {
        let (link_id, selectors) = self.repeating_group(id)?;
        if locator::remove_at(&self.index, &mut self.response, &link_id, &selectors).is_some() {
            self.commit("remove_group_instance", &link_id);
        }
        Ok(())
    }

    fn commit(&mut self, operation: &str, link_id: &str) {
        self.revision += 1;
        debug!(operation, link_id, revision = self.revision, "response updated");
        self.refresh();
    }

    // ----- settling -----

    /// Resynchronizes the tree and settles calculated and initial values, then
    /// re-validates and notifies listeners.
    fn refresh(&mut self) {
        let passes = self.config.max_calculation_passes.max(1);
        let mut settled = false;
        for pass in 0..passes {
            self.sync_tree();
            let (transitions, actions) = self.plan();
            for (id, enabled) in transitions {
                if let Some(node) = self.tree.get_mut(id) {
                    node.last_enabled = Some(enabled);
                }
            }
            if actions.is_empty() {
                settled = true;
                break;
            }
            trace!(pass, actions = actions.len(), "applying computed values");
            self.apply(actions);
        }
        if !settled {
            warn!(passes, "calculated values did not settle");
            self.sync_tree();
        }
        let report = validate::validate(self);
        self.issues = report;
        self.notify();
    }

    /// Syncs the tree until the computed repeats of every repeating-group sequence
    /// agree with the instance layout they were built from.
    fn sync_tree(&mut self) {
        let passes = self.config.max_calculation_passes.max(1);
        for _ in 0..passes {
            self.tree
                .sync(&self.definition, &self.index, &self.response, &self.group_repeats);
            let computed = self.computed_group_repeats();
            if computed == self.group_repeats {
                return;
            }
            self.group_repeats = computed;
        }
        self.tree
            .sync(&self.definition, &self.index, &self.response, &self.group_repeats);
    }

    fn computed_group_repeats(&self) -> GroupRepeats {
        self.tree
            .iter()
            .filter(|node| {
                node.kind() == NodeKind::Group
                    && node.occurrence() == 0
                    && node.slots.repeats.is_some()
            })
            .map(|node| {
                (
                    (node.link_id().to_string(), node.selectors().to_vec()),
                    self.repeats(node.id()),
                )
            })
            .collect()
    }

    /// Decides which stored values change. Nothing is mutated here.
    fn plan(&self) -> (Vec<(NodeId, bool)>, Vec<Action>) {
        let mut transitions = Vec::new();
        let mut actions = Vec::new();
        for node in self.tree.iter() {
            let id = node.id();
            let enabled = self.is_enabled(id);
            transitions.push((id, enabled));
            if enabled && node.kind() == NodeKind::Group && node.occurrence() == 0 {
                let stored = locator::count_at(
                    &self.index,
                    &self.response,
                    node.link_id(),
                    node.selectors(),
                );
                if let Some(max) = self.max_count(id)
                    && stored > max
                {
                    actions.push(Action::TruncateInstances { node: id, max });
                }
            }
            if !enabled || node.kind() != NodeKind::Question {
                continue;
            }
            let kind = node.item().kind;
            let stored = self.stored(node);
            let max = self.max_count(id);
            let cap = |mut values: Vec<AnswerValue>| {
                if let Some(max) = max {
                    values.truncate(max);
                }
                values
            };

            if let Some(slot) = &node.slots.calculated {
                if let Ok(result) = self.slot_value(node, slot) {
                    let values =
                        cap(result.iter().filter_map(|value| value.to_answer(kind)).collect());
                    if values != stored {
                        actions.push(Action::Replace { node: id, values });
                        continue;
                    }
                }
            } else if node.last_enabled != Some(true) && stored.is_empty() {
                let seeds = cap(self.seeds(node));
                if !seeds.is_empty() {
                    trace!(link_id = node.link_id(), count = seeds.len(), "seeding initial values");
                    actions.push(Action::Replace {
                        node: id,
                        values: seeds,
                    });
                    continue;
                }
            }

            if let Some(max) = max
                && stored.len() > max
            {
                actions.push(Action::Truncate { node: id, max });
            }
        }
        (transitions, actions)
    }

    fn seeds(&self, node: &Node) -> Vec<AnswerValue> {
        let item = node.item();
        if let Some(slot) = &node.slots.initial {
            return self
                .slot_value(node, slot)
                .map(|values| {
                    values
                        .iter()
                        .filter_map(|value| value.to_answer(item.kind))
                        .collect()
                })
                .unwrap_or_default();
        }
        let initial = item.initial_values();
        if initial.is_empty() {
            item.initially_selected()
        } else {
            initial
        }
    }

    fn apply(&mut self, actions: Vec<Action>) {
        for action in actions {
            let (node, values) = match action {
                Action::Replace { node, values } => (node, Some(values)),
                Action::Truncate { node, max } => {
                    if let Ok((link_id, selectors, kind)) = self.address(node)
                        && let Some(item) =
                            locator::locate_mut(&self.index, &mut self.response, &link_id, &selectors)
                    {
                        codec::truncate(kind, item, max);
                    }
                    continue;
                }
                Action::TruncateInstances { node, max } => {
                    if let Ok((link_id, mut selectors, _)) = self.address(node) {
                        let stored =
                            locator::count_at(&self.index, &self.response, &link_id, &selectors);
                        let hop = selectors.len() - 1;
                        for occurrence in (max..stored).rev() {
                            selectors[hop].occurrence = occurrence;
                            locator::remove_at(&self.index, &mut self.response, &link_id, &selectors);
                        }
                        trace!(%link_id, stored, max, "group instances truncated");
                    }
                    continue;
                }
            };
            let Ok((link_id, selectors, kind)) = self.address(node) else {
                continue;
            };
            let outcome = match values {
                Some(values) if !values.is_empty() => {
                    locator::locate_or_create(&self.index, &mut self.response, &link_id, &selectors)
                        .map_err(StructuralError::from)
                        .and_then(|item| codec::write_all(kind, item, values))
                }
                _ => {
                    if let Some(item) =
                        locator::locate_mut(&self.index, &mut self.response, &link_id, &selectors)
                    {
                        codec::clear_all(kind, item);
                    }
                    Ok(())
                }
            };
            if let Err(error) = outcome {
                warn!(%error, %link_id, "computed value could not be stored");
            }
        }
        self.revision += 1;
    }

    // ----- answer options -----

    /// Starts loading the options of a question. Static `answerOption` lists are
    /// ready immediately and need no request.
    pub fn request_options(&mut self, id: NodeId) -> Option<OptionsRequest> {
        let node = self.tree.get(id)?;
        let item = node.item();
        if !item.answer_option.is_empty() {
            let values = static_options(node);
            self.options.insert(
                id,
                OptionsEntry {
                    state: OptionsState::Ready(values),
                    pending: None,
                },
            );
            return None;
        }
        let url = item.answer_value_set.clone()?;
        self.next_serial += 1;
        let serial = self.next_serial;
        let entry = self.options.entry(id).or_default();
        entry.pending = Some(serial);
        if !matches!(entry.state, OptionsState::Ready(_) | OptionsState::Failed { .. }) {
            entry.state = OptionsState::Loading;
        }
        trace!(node = id.index(), %url, serial, "options requested");
        Some(OptionsRequest {
            ticket: OptionsTicket { node: id, serial },
            url,
        })
    }

    /// Delivers an expansion result. Results for superseded or cancelled tickets are
    /// dropped; returns whether the result was applied.
    pub fn resolve_options(
        &mut self,
        ticket: OptionsTicket,
        result: Result<Vec<Coding>, ExpansionError>,
    ) -> bool {
        let Some(entry) = self.options.get_mut(&ticket.node) else {
            warn!(node = ticket.node.index(), "options result for an unknown request dropped");
            return false;
        };
        if entry.pending != Some(ticket.serial) {
            warn!(node = ticket.node.index(), serial = ticket.serial, "stale options result dropped");
            return false;
        }
        entry.pending = None;
        entry.state = match result {
            Ok(codings) => OptionsState::Ready(codings.into_iter().map(AnswerValue::Coding).collect()),
            Err(error) => OptionsState::Failed {
                reason: error.to_string(),
                previous: entry.state.available().to_vec(),
            },
        };
        true
    }

    /// Forgets the pending request of a question; its eventual result is ignored.
    pub fn cancel_options(&mut self, id: NodeId) {
        if let Some(entry) = self.options.get_mut(&id)
            && entry.pending.take().is_some()
            && entry.state == OptionsState::Loading
        {
            entry.state = OptionsState::Idle;
        }
    }

    // ----- output -----

    /// Registers a listener called with the document after every write.
    pub fn subscribe(&mut self, listener: impl FnMut(&QuestionnaireResponse) + 'static) -> SubscriptionId {
        self.next_subscription += 1;
        let id = SubscriptionId(self.next_subscription);
        self.listeners.push((id, Box::new(listener)));
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(existing, _)| *existing != id);
        self.listeners.len() != before
    }

    fn notify(&mut self) {
        let response = &self.response;
        for (_, listener) in self.listeners.iter_mut() {
            listener(response);
        }
    }

    /// The document to hand back on submit: disabled items are removed when
    /// configured, and items left without answers or children are pruned.
    pub fn submission(&self) -> QuestionnaireResponse {
        let mut document = self.response.clone();
        if !self.config.strip_disabled_on_submit {
            return document;
        }
        let mut disabled: Vec<&Node> = self
            .tree
            .iter()
            .filter(|node| {
                !self.is_enabled(node.id())
                    && node.parent().is_none_or(|parent| self.is_enabled(parent))
            })
            .collect();
        // Later instances first so earlier addresses stay valid.
        disabled.sort_by(|left, right| right.selectors().cmp(left.selectors()));
        for node in disabled {
            locator::remove_at(&self.index, &mut document, node.link_id(), node.selectors());
        }
        prune(&mut document.item);
        document
    }
}

fn static_options(node: &Node) -> Vec<AnswerValue> {
    node.item()
        .answer_option
        .iter()
        .filter_map(|option| option.value.value())
        .collect()
}

fn prune(items: &mut Vec<ResponseItem>) {
    for item in items.iter_mut() {
        if let Some(children) = item.item.as_mut() {
            prune(children);
            if children.is_empty() {
                item.item = None;
            }
        }
        for answer in item.answer.iter_mut().flatten() {
            if let Some(children) = answer.item.as_mut() {
                prune(children);
                if children.is_empty() {
                    answer.item = None;
                }
            }
        }
    }
    items.retain(|item| item.answer.is_some() || item.item.is_some());
}

/// `%name` bindings for one evaluation: engine constants first, then variables
/// visible from `scope`.
struct Bindings<'e> {
    engine: &'e FormEngine,
    node: Option<NodeId>,
    scope: ScopeId,
}

impl Environment for Bindings<'_> {
    fn constant(&self, name: &str) -> Option<ExpressionResult<Collection>> {
        let engine = self.engine;
        let value = match name {
            "resource" | "rootResource" => vec![FhirPathValue::Object(engine.resource_json())],
            "questionnaire" => vec![FhirPathValue::Object(engine.definition_json.clone())],
            "context" => engine.context_of(self.node),
            "qitem" => self
                .node
                .and_then(|id| engine.tree.get(id))
                .and_then(|node| serde_json::to_value(&**node.item()).ok())
                .map(FhirPathValue::Object)
                .into_iter()
                .collect(),
            "ucum" => vec![FhirPathValue::String(UCUM_SYSTEM.into())],
            "sct" => vec![FhirPathValue::String(SNOMED_SYSTEM.into())],
            "loinc" => vec![FhirPathValue::String(LOINC_SYSTEM.into())],
            _ => {
                let (owner, variable) = engine.tree.scopes().resolve(self.scope, name)?;
                return Some(
                    engine
                        .variable_value(owner, variable)
                        .map_err(|_| ExpressionError::unresolved(name)),
                );
            }
        };
        Some(Ok(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn engine(definition: Value) -> FormEngine {
        let definition = serde_json::from_value(definition).expect("definition");
        FormEngine::open(definition, None, EngineConfig::default())
    }

    #[test]
    fn calculated_values_follow_their_inputs() {
        let mut form = engine(json!({
            "resourceType": "Questionnaire",
            "item": [
                {"linkId": "a", "type": "integer"},
                {"linkId": "double", "type": "integer", "readOnly": true, "extension": [{
                    "url": extensions::CALCULATED_EXPRESSION,
                    "valueExpression": {
                        "language": "text/fhirpath",
                        "expression": "%resource.item.where(linkId = 'a').answer.value * 2"
                    }
                }]}
            ]
        }));
        let a = form.find("a").expect("a");
        let double = form.find("double").expect("double");
        assert!(form.answers(double).is_empty());

        form.set_answer(a, 0, AnswerValue::Integer(21)).expect("write");
        assert_eq!(form.answers(double), vec![AnswerValue::Integer(42)]);

        form.clear_answer(a, 0).expect("clear");
        assert!(form.answers(double).is_empty());
    }

    #[test]
    fn listeners_see_every_write() {
        use std::cell::Cell;
        use std::rc::Rc;

        let mut form = engine(json!({
            "item": [{"linkId": "name", "type": "string"}]
        }));
        let seen = Rc::new(Cell::new(0));
        let counter = Rc::clone(&seen);
        let subscription = form.subscribe(move |_| counter.set(counter.get() + 1));
        let name = form.find("name").expect("name");

        form.set_answer(name, 0, AnswerValue::String("Ada".into())).expect("write");
        assert_eq!(seen.get(), 1);
        assert!(form.unsubscribe(subscription));
        form.clear_answer(name, 0).expect("clear");
        assert_eq!(seen.get(), 1);
    }

    #[test]
    fn writing_a_value_on_a_group_is_a_caller_bug() {
        let mut form = engine(json!({
            "item": [{"linkId": "g", "type": "group", "item": [{"linkId": "x", "type": "string"}]}]
        }));
        let group = form.find("g").expect("group");
        let error = form
            .set_answer(group, 0, AnswerValue::String("x".into()))
            .unwrap_err();
        assert!(matches!(error, StructuralError::NotAQuestion { .. }));
        assert!(form.response().item.is_empty());
    }

    #[test]
    fn stale_option_results_are_ignored() {
        let mut form = engine(json!({
            "item": [{"linkId": "drug", "type": "coding", "answerValueSet": "http://example.org/vs"}]
        }));
        let drug = form.find("drug").expect("drug");
        let first = form.request_options(drug).expect("first request");
        let second = form.request_options(drug).expect("second request");
        assert_eq!(form.options(drug), OptionsState::Loading);

        assert!(!form.resolve_options(first.ticket, Ok(vec![Coding::new("s", "old")])));
        assert!(form.resolve_options(second.ticket, Ok(vec![Coding::new("s", "new")])));
        assert_eq!(
            form.options(drug),
            OptionsState::Ready(vec![AnswerValue::Coding(Coding::new("s", "new"))])
        );
    }
}
