//! Hierarchical registry of named expression results.
//!
//! There is one scope for the form root, one per group node (so each repeating
//! group instance gets its own), and one per question that declares variables.
//! Lookups walk outward toward the root; shadowing across scopes is allowed.

use thiserror::Error;

use crate::expr::{ExpressionPurpose, ExpressionSlot};
use crate::tree::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeId(usize);

impl ScopeId {
    pub const ROOT: ScopeId = ScopeId(0);
}

#[derive(Debug)]
pub struct Variable {
    pub name: String,
    pub slot: ExpressionSlot,
}

#[derive(Debug)]
pub struct VariableScope {
    pub parent: Option<ScopeId>,
    /// Node whose response item is `%context` for this scope's variables; `None` for
    /// the form root.
    pub owner: Option<NodeId>,
    variables: Vec<Variable>,
}

impl VariableScope {
    pub fn variables(&self) -> &[Variable] {
        &self.variables
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("variable '{name}' is declared more than once in the same scope")]
pub struct DuplicateVariable {
    pub name: String,
    pub owner: Option<NodeId>,
}

#[derive(Debug)]
pub struct ScopeTree {
    scopes: Vec<VariableScope>,
}

impl Default for ScopeTree {
    fn default() -> Self {
        Self::new()
    }
}

impl ScopeTree {
    /// A tree holding only the root scope.
    pub fn new() -> Self {
        Self {
            scopes: vec![VariableScope {
                parent: None,
                owner: None,
                variables: Vec::new(),
            }],
        }
    }

    pub fn push(&mut self, parent: ScopeId, owner: NodeId) -> ScopeId {
        self.scopes.push(VariableScope {
            parent: Some(parent),
            owner: Some(owner),
            variables: Vec::new(),
        });
        ScopeId(self.scopes.len() - 1)
    }

    pub fn scope(&self, id: ScopeId) -> Option<&VariableScope> {
        self.scopes.get(id.0)
    }

    /// Declares `name` in `scope`. A second declaration of the same name in the same
    /// scope is rejected and the first one stays in effect.
    pub fn declare(
        &mut self,
        scope: ScopeId,
        name: &str,
        source: &str,
    ) -> Result<(), DuplicateVariable> {
        let Some(target) = self.scopes.get_mut(scope.0) else {
            return Ok(());
        };
        if target.variables.iter().any(|variable| variable.name == name) {
            return Err(DuplicateVariable {
                name: name.to_string(),
                owner: target.owner,
            });
        }
        target.variables.push(Variable {
            name: name.to_string(),
            slot: ExpressionSlot::new(ExpressionPurpose::Variable, source),
        });
        Ok(())
    }

    /// Finds the nearest declaration of `name`, starting at `scope`.
    pub fn resolve(&self, scope: ScopeId, name: &str) -> Option<(ScopeId, &Variable)> {
        let mut current = Some(scope);
        while let Some(id) = current {
            let entry = self.scopes.get(id.0)?;
            if let Some(variable) = entry.variables.iter().find(|variable| variable.name == name) {
                return Some((id, variable));
            }
            current = entry.parent;
        }
        None
    }

    pub fn iter(&self) -> impl Iterator<Item = (ScopeId, &VariableScope)> {
        self.scopes
            .iter()
            .enumerate()
            .map(|(index, scope)| (ScopeId(index), scope))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_outward_and_allows_shadowing() {
        let mut tree = ScopeTree::new();
        tree.declare(ScopeId::ROOT, "score", "1").expect("root");
        let group = tree.push(ScopeId::ROOT, NodeId::new(0));
        tree.declare(group, "score", "2").expect("shadow");
        tree.declare(group, "row", "3").expect("row");

        let (found, variable) = tree.resolve(group, "score").expect("score");
        assert_eq!(found, group);
        assert_eq!(variable.slot.source(), "2");
        assert_eq!(tree.resolve(ScopeId::ROOT, "row").map(|(id, _)| id), None);
    }

    #[test]
    fn rejects_duplicates_within_a_scope() {
        let mut tree = ScopeTree::new();
        tree.declare(ScopeId::ROOT, "a", "1").expect("first");
        let error = tree.declare(ScopeId::ROOT, "a", "2").unwrap_err();
        assert_eq!(error.name, "a");
        let (_, kept) = tree.resolve(ScopeId::ROOT, "a").expect("kept");
        assert_eq!(kept.slot.source(), "1");
    }
}
