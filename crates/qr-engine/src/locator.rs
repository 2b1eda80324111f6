//! Finds (and optionally creates) the response item for an identifier.
//!
//! The walk follows the [`PathIndex`] chain. A hop that is not `via_answer` looks for
//! the item among the current container's items; a `via_answer` hop first steps into
//! one of the parent's answers and then searches that answer's nested items.

use thiserror::Error;

use crate::path_index::{PathIndex, PathSegment};
use crate::response::{Answer, QuestionnaireResponse, ResponseItem};

/// Picks one branch at a hop: which occurrence of the item among its siblings
/// (repeating group instances) and, for `via_answer` hops, which parent answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Selector {
    pub occurrence: usize,
    pub answer: usize,
}

impl Selector {
    pub fn occurrence(occurrence: usize) -> Self {
        Self {
            occurrence,
            answer: 0,
        }
    }

    pub fn answer(answer: usize) -> Self {
        Self {
            occurrence: 0,
            answer,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LocateError {
    #[error("item '{0}' is not part of the questionnaire")]
    UnknownItem(String),
    #[error("item '{link_id}' cannot be reached: {reason}")]
    Unreachable { link_id: String, reason: String },
}

fn selector_at(selectors: &[Selector], hop: usize) -> Selector {
    selectors.get(hop).copied().unwrap_or_default()
}

fn nth_position(items: &[ResponseItem], link_id: &str, occurrence: usize) -> Option<usize> {
    items
        .iter()
        .enumerate()
        .filter(|(_, item)| item.link_id == link_id)
        .nth(occurrence)
        .map(|(position, _)| position)
}

fn occurrences(items: &[ResponseItem], link_id: &str) -> usize {
    items.iter().filter(|item| item.link_id == link_id).count()
}

/// Finds the response item for `link_id` using the first occurrence at every hop.
/// Never mutates the document.
pub fn locate<'a>(
    index: &PathIndex,
    response: &'a QuestionnaireResponse,
    link_id: &str,
) -> Option<&'a ResponseItem> {
    locate_at(index, response, link_id, &[])
}

/// Like [`locate`] with explicit per-hop selectors; missing selectors default to the
/// first occurrence and first answer.
pub fn locate_at<'a>(
    index: &PathIndex,
    response: &'a QuestionnaireResponse,
    link_id: &str,
    selectors: &[Selector],
) -> Option<&'a ResponseItem> {
    let path = index.path(link_id)?;
    let container = container_of(path, response, selectors)?;
    let last = path.len() - 1;
    let position = nth_position(
        container,
        path[last].link_id(),
        selector_at(selectors, last).occurrence,
    )?;
    container.get(position)
}

/// The sibling slice that holds the occurrences of `link_id`.
pub fn container_at<'a>(
    index: &PathIndex,
    response: &'a QuestionnaireResponse,
    link_id: &str,
    selectors: &[Selector],
) -> Option<&'a [ResponseItem]> {
    container_of(index.path(link_id)?, response, selectors)
}

/// Number of response items for `link_id` in its container.
pub fn count_at(
    index: &PathIndex,
    response: &QuestionnaireResponse,
    link_id: &str,
    selectors: &[Selector],
) -> usize {
    container_at(index, response, link_id, selectors)
        .map(|items| occurrences(items, link_id))
        .unwrap_or(0)
}

fn container_of<'a>(
    path: &[PathSegment],
    response: &'a QuestionnaireResponse,
    selectors: &[Selector],
) -> Option<&'a [ResponseItem]> {
    let mut items: &'a [ResponseItem] = &response.item;
    for (hop, segment) in path.iter().enumerate().skip(1) {
        let parent_hop = hop - 1;
        let parent_position = nth_position(
            items,
            path[parent_hop].link_id(),
            selector_at(selectors, parent_hop).occurrence,
        )?;
        let parent = &items[parent_position];
        items = if segment.via_answer {
            let answer = parent.answers().get(selector_at(selectors, hop).answer)?;
            answer.item.as_deref().unwrap_or_default()
        } else {
            parent.children()
        };
    }
    Some(items)
}

/// Mutable counterpart of [`locate_at`]. Never creates anything.
pub fn locate_mut<'a>(
    index: &PathIndex,
    response: &'a mut QuestionnaireResponse,
    link_id: &str,
    selectors: &[Selector],
) -> Option<&'a mut ResponseItem> {
    let path = index.path(link_id)?;
    walk_mut(&mut response.item, path, selectors, 0)
}

fn walk_mut<'a>(
    items: &'a mut [ResponseItem],
    path: &[PathSegment],
    selectors: &[Selector],
    hop: usize,
) -> Option<&'a mut ResponseItem> {
    let segment = &path[hop];
    let position = nth_position(items, segment.link_id(), selector_at(selectors, hop).occurrence)?;
    let item = &mut items[position];
    let Some(next) = path.get(hop + 1) else {
        return Some(item);
    };
    let children = if next.via_answer {
        item.answer
            .as_mut()?
            .get_mut(selector_at(selectors, hop + 1).answer)?
            .item
            .as_mut()?
    } else {
        item.item.as_mut()?
    };
    walk_mut(children, path, selectors, hop + 1)
}

/// Detaches the addressed occurrence of `link_id` from its container. Empty
/// containers are dropped so the document keeps no `item: []` stubs.
pub fn remove_at(
    index: &PathIndex,
    response: &mut QuestionnaireResponse,
    link_id: &str,
    selectors: &[Selector],
) -> Option<ResponseItem> {
    let path = index.path(link_id)?;
    let last = path.len() - 1;
    let occurrence = selector_at(selectors, last).occurrence;
    if last == 0 {
        let position = nth_position(&response.item, link_id, occurrence)?;
        return Some(response.item.remove(position));
    }

    let parent = walk_mut(&mut response.item, &path[..last], selectors, 0)?;
    let container = if path[last].via_answer {
        &mut parent
            .answer
            .as_mut()?
            .get_mut(selector_at(selectors, last).answer)?
            .item
    } else {
        &mut parent.item
    };
    let items = container.as_mut()?;
    let position = nth_position(items, link_id, occurrence)?;
    let removed = items.remove(position);
    if items.is_empty() {
        *container = None;
    }
    Some(removed)
}

/// Finds the response item for `link_id`, creating it and every missing container
/// on the way. The walk is checked before anything is touched, so a failing call
/// leaves the document unchanged.
pub fn locate_or_create<'a>(
    index: &PathIndex,
    response: &'a mut QuestionnaireResponse,
    link_id: &str,
    selectors: &[Selector],
) -> Result<&'a mut ResponseItem, LocateError> {
    let path = index
        .path(link_id)
        .ok_or_else(|| LocateError::UnknownItem(link_id.to_string()))?;
    check_creatable(path, response, selectors)?;
    descend(&mut response.item, index, path, selectors, 0)
}

/// Dry run of [`locate_or_create`]: verifies every hop either exists or is the next
/// one to be appended.
fn check_creatable(
    path: &[PathSegment],
    response: &QuestionnaireResponse,
    selectors: &[Selector],
) -> Result<(), LocateError> {
    // `None` means the container will be created empty during the walk.
    let mut items: Option<&[ResponseItem]> = Some(&response.item);
    let mut current: Option<&ResponseItem> = None;

    for (hop, segment) in path.iter().enumerate() {
        let selector = selector_at(selectors, hop);
        let unreachable = |reason: String| LocateError::Unreachable {
            link_id: segment.link_id().to_string(),
            reason,
        };

        if hop > 0 {
            items = match (current, segment.via_answer) {
                (Some(parent), true) => {
                    let answers = parent.answers();
                    if selector.answer < answers.len() {
                        Some(answers[selector.answer].item.as_deref().unwrap_or_default())
                    } else if selector.answer == answers.len() {
                        None
                    } else {
                        return Err(unreachable(format!(
                            "answer {} requested but only {} exist",
                            selector.answer,
                            answers.len()
                        )));
                    }
                }
                (Some(parent), false) => Some(parent.children()),
                (None, true) if selector.answer > 0 => {
                    return Err(unreachable(format!(
                        "answer {} requested on an item that does not exist yet",
                        selector.answer
                    )));
                }
                (None, _) => None,
            };
        }

        let existing = items.map(|items| occurrences(items, segment.link_id())).unwrap_or(0);
        current = if selector.occurrence < existing {
            items.and_then(|items| {
                nth_position(items, segment.link_id(), selector.occurrence).map(|p| &items[p])
            })
        } else if selector.occurrence == existing {
            None
        } else {
            return Err(unreachable(format!(
                "occurrence {} requested but only {} exist",
                selector.occurrence, existing
            )));
        };
    }
    Ok(())
}

fn descend<'a>(
    items: &'a mut Vec<ResponseItem>,
    index: &PathIndex,
    path: &[PathSegment],
    selectors: &[Selector],
    hop: usize,
) -> Result<&'a mut ResponseItem, LocateError> {
    let segment = &path[hop];
    let selector = selector_at(selectors, hop);
    let position = match nth_position(items, segment.link_id(), selector.occurrence) {
        Some(position) => position,
        None => insert_in_order(items, index, segment),
    };
    let item = &mut items[position];

    let Some(next) = path.get(hop + 1) else {
        return Ok(item);
    };
    let children = if next.via_answer {
        let wanted = selector_at(selectors, hop + 1).answer;
        let answers = item.answer.get_or_insert_with(Vec::new);
        if wanted == answers.len() {
            answers.push(Answer::default());
        }
        let answer = answers
            .get_mut(wanted)
            .ok_or_else(|| LocateError::Unreachable {
                link_id: next.link_id().to_string(),
                reason: format!("answer {wanted} does not exist"),
            })?;
        answer.item.get_or_insert_with(Vec::new)
    } else {
        item.item.get_or_insert_with(Vec::new)
    };
    descend(children, index, path, selectors, hop + 1)
}

/// Inserts a fresh response item (identifier and text only) after the last existing
/// occurrence, or else before the first sibling that comes later in the definition.
fn insert_in_order(items: &mut Vec<ResponseItem>, index: &PathIndex, segment: &PathSegment) -> usize {
    let link_id = segment.link_id();
    let fresh = ResponseItem::new(link_id, segment.item.text.clone());
    let position = match items.iter().rposition(|item| item.link_id == link_id) {
        Some(last) => last + 1,
        None => items
            .iter()
            .position(|item| {
                index
                    .order_of(&item.link_id)
                    .is_some_and(|order| order > segment.order)
            })
            .unwrap_or(items.len()),
    };
    items.insert(position, fresh);
    position
}
