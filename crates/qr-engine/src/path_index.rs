//! Identifier → ancestor chain index over a definition.
//!
//! Each chain lists the items from the outermost ancestor down to the item itself.
//! A hop is flagged `via_answer` when the item nests under a non-group parent, i.e.
//! its response item lives inside the parent's answer rather than directly inside
//! the parent's response item.

use std::collections::HashMap;
use std::sync::Arc;

use crate::spec::{Item, Questionnaire};

/// One hop of an ancestor chain.
#[derive(Debug, Clone)]
pub struct PathSegment {
    pub item: Arc<Item>,
    pub via_answer: bool,
    /// Position of the item among its definition siblings.
    pub order: usize,
}

impl PathSegment {
    pub fn link_id(&self) -> &str {
        self.item.link_id().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default)]
pub struct PathIndex {
    paths: HashMap<String, Vec<PathSegment>>,
}

impl PathIndex {
    /// Builds the index in a single pre-order traversal. Items without an
    /// identifier are skipped along with their subtree; on duplicate identifiers the
    /// first occurrence wins.
    pub fn build(definition: &Questionnaire) -> Self {
        let mut index = PathIndex::default();
        let mut chain = Vec::new();
        index.visit(&definition.item, None, &mut chain);
        index
    }

    fn visit(&mut self, items: &[Arc<Item>], parent: Option<&Item>, chain: &mut Vec<PathSegment>) {
        let via_answer = parent.is_some_and(|parent| !parent.kind.is_group());
        for (order, item) in items.iter().enumerate() {
            let Some(link_id) = item.link_id() else {
                continue;
            };
            chain.push(PathSegment {
                item: Arc::clone(item),
                via_answer,
                order,
            });
            if !self.paths.contains_key(link_id) {
                self.paths.insert(link_id.to_string(), chain.clone());
            }
            self.visit(&item.item, Some(item), chain);
            chain.pop();
        }
    }

    pub fn path(&self, link_id: &str) -> Option<&[PathSegment]> {
        self.paths.get(link_id).map(Vec::as_slice)
    }

    /// The definition item indexed under `link_id`.
    pub fn item(&self, link_id: &str) -> Option<&Arc<Item>> {
        self.path(link_id).and_then(<[PathSegment]>::last).map(|segment| &segment.item)
    }

    /// Whether `item` is the occurrence the index resolves its identifier to.
    pub fn is_canonical(&self, item: &Arc<Item>) -> bool {
        item.link_id()
            .and_then(|link_id| self.item(link_id))
            .is_some_and(|indexed| Arc::ptr_eq(indexed, item))
    }

    pub fn order_of(&self, link_id: &str) -> Option<usize> {
        self.path(link_id).and_then(<[PathSegment]>::last).map(|segment| segment.order)
    }

    pub fn contains(&self, link_id: &str) -> bool {
        self.paths.contains_key(link_id)
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn link_ids(&self) -> impl Iterator<Item = &str> {
        self.paths.keys().map(String::as_str)
    }
}
