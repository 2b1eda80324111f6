//! The live node tree mirroring the definition.
//!
//! Nodes live in an arena and are keyed by identifier plus per-hop selectors, so a
//! structural resync after a write keeps the identity (and the enablement history)
//! of every node that still exists. Repeating groups get one node per instance;
//! children of a question get one set of nodes per answer.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use tracing::trace;

use crate::expr::{ExpressionPurpose, ExpressionSlot};
use crate::locator::{self, Selector};
use crate::path_index::PathIndex;
use crate::response::QuestionnaireResponse;
use crate::scope::{DuplicateVariable, ScopeId, ScopeTree};
use crate::spec::{BoundSource, Item, Questionnaire, extensions};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct NodeId(usize);

impl NodeId {
    #[cfg(test)]
    pub(crate) fn new(index: usize) -> Self {
        Self(index)
    }

    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Group,
    Question,
    Display,
}

/// Expression-backed properties of one node. A slot exists only when the item
/// carries the corresponding extension.
#[derive(Debug, Default)]
pub struct Slots {
    pub enablement: Option<ExpressionSlot>,
    pub initial: Option<ExpressionSlot>,
    pub calculated: Option<ExpressionSlot>,
    pub text: Option<ExpressionSlot>,
    pub read_only: Option<ExpressionSlot>,
    pub repeats: Option<ExpressionSlot>,
    pub required: Option<ExpressionSlot>,
    pub min_value: Option<ExpressionSlot>,
    pub max_value: Option<ExpressionSlot>,
}

fn slot(purpose: ExpressionPurpose, source: Option<&str>) -> Option<ExpressionSlot> {
    source.map(|source| ExpressionSlot::new(purpose, source))
}

fn bound_slot(purpose: ExpressionPurpose, item: &Item, url: &str) -> Option<ExpressionSlot> {
    match extensions::bound(&item.extension, url)? {
        BoundSource::Expression(source) => Some(ExpressionSlot::new(purpose, source)),
        BoundSource::Static(_) => None,
    }
}

impl Slots {
    fn for_item(item: &Item) -> Self {
        use ExpressionPurpose as P;
        Self {
            enablement: slot(
                P::Enablement,
                extensions::expression(&item.extension, extensions::ENABLE_WHEN_EXPRESSION),
            ),
            initial: slot(
                P::Initial,
                extensions::expression(&item.extension, extensions::INITIAL_EXPRESSION),
            ),
            calculated: slot(
                P::Calculated,
                extensions::expression(&item.extension, extensions::CALCULATED_EXPRESSION),
            ),
            text: slot(P::Text, extensions::element_expression(item.text_element.as_ref())),
            read_only: slot(
                P::ReadOnly,
                extensions::element_expression(item.read_only_element.as_ref()),
            ),
            repeats: slot(
                P::Repeats,
                extensions::element_expression(item.repeats_element.as_ref()),
            ),
            required: slot(
                P::Required,
                extensions::element_expression(item.required_element.as_ref()),
            ),
            min_value: bound_slot(P::MinValue, item, extensions::MIN_VALUE),
            max_value: bound_slot(P::MaxValue, item, extensions::MAX_VALUE),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &ExpressionSlot> {
        [
            &self.enablement,
            &self.initial,
            &self.calculated,
            &self.text,
            &self.read_only,
            &self.repeats,
            &self.required,
            &self.min_value,
            &self.max_value,
        ]
        .into_iter()
        .flatten()
    }
}

#[derive(Debug)]
pub struct Node {
    id: NodeId,
    link_id: String,
    item: Arc<Item>,
    kind: NodeKind,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    selectors: Vec<Selector>,
    pub(crate) scope: ScopeId,
    pub(crate) slots: Slots,
    /// Enablement seen by the previous refresh; `None` before the first one.
    pub(crate) last_enabled: Option<bool>,
}

impl Node {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn link_id(&self) -> &str {
        &self.link_id
    }

    pub fn item(&self) -> &Arc<Item> {
        &self.item
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    /// Per-hop selectors addressing this node's response item.
    pub fn selectors(&self) -> &[Selector] {
        &self.selectors
    }

    /// Instance number among siblings with the same identifier.
    pub fn occurrence(&self) -> usize {
        self.selectors.last().map(|selector| selector.occurrence).unwrap_or(0)
    }

    pub fn slots(&self) -> &Slots {
        &self.slots
    }
}

pub(crate) type NodeKey = (String, Vec<Selector>);

/// Computed repeats of repeating-group sequences, keyed by their first instance.
pub(crate) type GroupRepeats = HashMap<NodeKey, bool>;

#[derive(Debug, Default)]
pub struct NodeTree {
    nodes: Vec<Option<Node>>,
    keys: HashMap<NodeKey, NodeId>,
    roots: Vec<NodeId>,
    scopes: ScopeTree,
    duplicates: Vec<DuplicateVariable>,
}

struct SyncContext<'a> {
    index: &'a PathIndex,
    response: &'a QuestionnaireResponse,
    repeats: &'a GroupRepeats,
    scopes: ScopeTree,
    duplicates: Vec<DuplicateVariable>,
    visited: HashSet<NodeId>,
}

impl NodeTree {
    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0).and_then(Option::as_ref)
    }

    pub(crate) fn get_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id.0).and_then(Option::as_mut)
    }

    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    /// All live nodes in document order.
    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        let mut stack: Vec<NodeId> = self.roots.iter().rev().copied().collect();
        std::iter::from_fn(move || {
            let node = self.get(stack.pop()?)?;
            stack.extend(node.children.iter().rev().copied());
            Some(node)
        })
    }

    pub fn len(&self) -> usize {
        self.nodes.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    pub fn find(&self, link_id: &str, selectors: &[Selector]) -> Option<NodeId> {
        self.keys
            .get(&(link_id.to_string(), selectors.to_vec()))
            .copied()
    }

    /// First node for `link_id` in document order.
    pub fn first(&self, link_id: &str) -> Option<NodeId> {
        self.iter()
            .find(|node| node.link_id == link_id)
            .map(|node| node.id)
    }

    /// Every node for `link_id` in document order (repeating instances, per-answer
    /// children).
    pub fn instances(&self, link_id: &str) -> Vec<NodeId> {
        self.iter()
            .filter(|node| node.link_id == link_id)
            .map(|node| node.id)
            .collect()
    }

    pub fn scopes(&self) -> &ScopeTree {
        &self.scopes
    }

    pub fn duplicate_variables(&self) -> &[DuplicateVariable] {
        &self.duplicates
    }

    /// Reconciles the tree with the definition and the current response. Nodes are
    /// matched by key; nodes whose key disappeared are dropped. Scopes are rebuilt.
    /// A group gets one node per stored instance when `repeats` (or, absent an
    /// entry, its static flag) says it repeats.
    pub(crate) fn sync(
        &mut self,
        definition: &Questionnaire,
        index: &PathIndex,
        response: &QuestionnaireResponse,
        repeats: &GroupRepeats,
    ) {
        let mut ctx = SyncContext {
            index,
            response,
            repeats,
            scopes: ScopeTree::new(),
            duplicates: Vec::new(),
            visited: HashSet::new(),
        };
        for variable in definition.variables() {
            if let (Some(name), Some(source)) = (variable.name.as_deref(), variable.fhirpath())
                && let Err(duplicate) = ctx.scopes.declare(ScopeId::ROOT, name, source)
            {
                ctx.duplicates.push(duplicate);
            }
        }

        let mut roots = Vec::new();
        for item in &definition.item {
            roots.extend(self.instantiate(&mut ctx, item, None, &[], 0, ScopeId::ROOT));
        }

        for slot in self.nodes.iter_mut() {
            if slot.as_ref().is_some_and(|node| !ctx.visited.contains(&node.id)) {
                *slot = None;
            }
        }
        let nodes = &self.nodes;
        self.keys
            .retain(|_, id| nodes.get(id.0).is_some_and(Option::is_some));
        self.roots = roots;
        self.scopes = ctx.scopes;
        self.duplicates = ctx.duplicates;
        trace!(nodes = self.keys.len(), "node tree synchronized");
    }

    fn instantiate(
        &mut self,
        ctx: &mut SyncContext<'_>,
        item: &Arc<Item>,
        parent: Option<NodeId>,
        prefix: &[Selector],
        answer: usize,
        parent_scope: ScopeId,
    ) -> Vec<NodeId> {
        let Some(link_id) = item.link_id() else {
            return Vec::new();
        };
        if !ctx.index.is_canonical(item) {
            return Vec::new();
        }

        let mut first_instance = prefix.to_vec();
        first_instance.push(Selector {
            occurrence: 0,
            answer,
        });
        let repeating = item.kind.is_group()
            && ctx
                .repeats
                .get(&(link_id.to_string(), first_instance.clone()))
                .copied()
                .unwrap_or_else(|| item.is_repeating());
        let instances = if repeating {
            locator::count_at(ctx.index, ctx.response, link_id, &first_instance).max(1)
        } else {
            1
        };

        let mut created = Vec::with_capacity(instances);
        for occurrence in 0..instances {
            let mut selectors = prefix.to_vec();
            selectors.push(Selector { occurrence, answer });
            let id = self.upsert(item, link_id, &selectors, parent);
            ctx.visited.insert(id);

            let owns_scope = item.kind.is_group() || item.variables().next().is_some();
            let scope = if owns_scope {
                ctx.scopes.push(parent_scope, id)
            } else {
                parent_scope
            };
            if owns_scope {
                for variable in item.variables() {
                    if let (Some(name), Some(source)) =
                        (variable.name.as_deref(), variable.fhirpath())
                        && let Err(duplicate) = ctx.scopes.declare(scope, name, source)
                    {
                        ctx.duplicates.push(duplicate);
                    }
                }
            }

            let mut children = Vec::new();
            if item.kind.is_group() {
                for child in &item.item {
                    children.extend(self.instantiate(ctx, child, Some(id), &selectors, 0, scope));
                }
            } else if item.kind.is_question() && item.has_children() {
                let answers = locator::locate_at(ctx.index, ctx.response, link_id, &selectors)
                    .map(|response_item| response_item.answers().len())
                    .unwrap_or(0);
                for answer in 0..answers.max(1) {
                    for child in &item.item {
                        children.extend(self.instantiate(
                            ctx,
                            child,
                            Some(id),
                            &selectors,
                            answer,
                            scope,
                        ));
                    }
                }
            }

            if let Some(node) = self.get_mut(id) {
                node.scope = scope;
                node.children = children;
            }
            created.push(id);
        }
        created
    }

    fn upsert(
        &mut self,
        item: &Arc<Item>,
        link_id: &str,
        selectors: &[Selector],
        parent: Option<NodeId>,
    ) -> NodeId {
        let key = (link_id.to_string(), selectors.to_vec());
        if let Some(id) = self.keys.get(&key).copied()
            && let Some(node) = self.get_mut(id)
        {
            node.parent = parent;
            return id;
        }
        let id = NodeId(self.nodes.len());
        let kind = if item.kind.is_group() {
            NodeKind::Group
        } else if item.kind.is_display() {
            NodeKind::Display
        } else {
            NodeKind::Question
        };
        self.nodes.push(Some(Node {
            id,
            link_id: link_id.to_string(),
            item: Arc::clone(item),
            kind,
            parent,
            children: Vec::new(),
            selectors: selectors.to_vec(),
            scope: ScopeId::ROOT,
            slots: Slots::for_item(item),
            last_enabled: None,
        }));
        self.keys.insert(key, id);
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn definition() -> Questionnaire {
        serde_json::from_value(json!({
            "resourceType": "Questionnaire",
            "item": [
                {"linkId": "meds", "type": "group", "repeats": true, "item": [
                    {"linkId": "med-name", "type": "string"}
                ]},
                {"linkId": "smoker", "type": "boolean", "item": [
                    {"linkId": "packs", "type": "integer"}
                ]}
            ]
        }))
        .expect("definition")
    }

    #[test]
    fn one_node_per_group_instance_and_stable_ids() {
        let definition = definition();
        let index = PathIndex::build(&definition);
        let mut response: QuestionnaireResponse = serde_json::from_value(json!({
            "item": [
                {"linkId": "meds", "item": [{"linkId": "med-name", "answer": [{"valueString": "a"}]}]},
                {"linkId": "meds", "item": [{"linkId": "med-name", "answer": [{"valueString": "b"}]}]}
            ]
        }))
        .expect("response");

        let mut tree = NodeTree::default();
        tree.sync(&definition, &index, &response, &GroupRepeats::new());
        assert_eq!(tree.instances("meds").len(), 2);
        assert_eq!(tree.instances("med-name").len(), 2);
        let first = tree.first("med-name").expect("first");

        response.item.truncate(1);
        tree.sync(&definition, &index, &response, &GroupRepeats::new());
        assert_eq!(tree.instances("meds").len(), 1);
        assert_eq!(tree.first("med-name"), Some(first));
    }

    #[test]
    fn computed_repeats_override_the_static_flag() {
        let definition = definition();
        let index = PathIndex::build(&definition);
        let response: QuestionnaireResponse = serde_json::from_value(json!({
            "item": [
                {"linkId": "meds", "item": [{"linkId": "med-name", "answer": [{"valueString": "a"}]}]},
                {"linkId": "meds", "item": [{"linkId": "med-name", "answer": [{"valueString": "b"}]}]}
            ]
        }))
        .expect("response");
        let mut repeats = GroupRepeats::new();
        repeats.insert(("meds".to_string(), vec![Selector::default()]), false);

        let mut tree = NodeTree::default();
        tree.sync(&definition, &index, &response, &repeats);
        assert_eq!(tree.instances("meds").len(), 1);

        repeats.insert(("meds".to_string(), vec![Selector::default()]), true);
        tree.sync(&definition, &index, &response, &repeats);
        assert_eq!(tree.instances("meds").len(), 2);
    }

    #[test]
    fn question_children_follow_answers() {
        let definition = definition();
        let index = PathIndex::build(&definition);
        let response: QuestionnaireResponse = serde_json::from_value(json!({
            "item": [{"linkId": "smoker", "answer": [{"valueBoolean": true}]}]
        }))
        .expect("response");
        let mut tree = NodeTree::default();
        tree.sync(&definition, &index, &response, &GroupRepeats::new());

        let packs = tree.first("packs").expect("packs");
        let node = tree.get(packs).expect("node");
        assert_eq!(node.selectors(), &[Selector::default(), Selector::answer(0)]);
        assert_eq!(tree.get(node.parent().expect("parent")).map(Node::link_id), Some("smoker"));
    }
}
