//! In-memory building model.
//!
//! `MemoryModel` is the reference host document: a flat element store with
//! fixed levels, single-level transactions, transaction groups and an undo
//! history. It enforces the same rule a real BIM host does: every mutation must
//! happen inside an open transaction.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;

use bimlink_types::{Document, DocumentError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ElementId(pub u64);

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element {
    pub id: ElementId,
    pub category: String,
    pub name: String,
    pub level: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
}

/// Element data supplied when placing a new element.
#[derive(Debug, Clone)]
pub struct NewElement {
    pub category: String,
    pub name: String,
    pub level: String,
    pub parameters: BTreeMap<String, Value>,
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error(transparent)]
    Document(#[from] DocumentError),
    #[error("element {id} not found")]
    ElementNotFound { id: ElementId },
    #[error("unknown level '{level}' (available: {})", available.join(", "))]
    UnknownLevel {
        level: String,
        available: Vec<String>,
    },
    #[error("nothing to undo")]
    NothingToUndo,
}

#[derive(Debug, Clone, Default, PartialEq)]
struct ModelState {
    elements: BTreeMap<ElementId, Element>,
}

#[derive(Debug)]
struct OpenTransaction {
    label: String,
    before: ModelState,
}

#[derive(Debug)]
struct OpenGroup {
    label: String,
    before: ModelState,
    committed: usize,
}

#[derive(Debug)]
struct UndoEntry {
    label: String,
    before: ModelState,
}

pub const DEFAULT_LEVELS: &[&str] = &["Level 1", "Level 2"];

#[derive(Debug)]
pub struct MemoryModel {
    title: String,
    levels: Vec<String>,
    state: ModelState,
    next_id: u64,
    transaction: Option<OpenTransaction>,
    group: Option<OpenGroup>,
    undo: Vec<UndoEntry>,
}

impl MemoryModel {
    #[must_use]
    pub fn new(title: impl Into<String>) -> Self {
        Self::with_levels(title, DEFAULT_LEVELS.iter().map(ToString::to_string))
    }

    pub fn with_levels(
        title: impl Into<String>,
        levels: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            title: title.into(),
            levels: levels.into_iter().collect(),
            state: ModelState::default(),
            next_id: 1,
            transaction: None,
            group: None,
            undo: Vec::new(),
        }
    }

    #[must_use]
    pub fn levels(&self) -> &[String] {
        &self.levels
    }

    #[must_use]
    pub fn element(&self, id: ElementId) -> Option<&Element> {
        self.state.elements.get(&id)
    }

    pub fn elements(&self) -> impl Iterator<Item = &Element> {
        self.state.elements.values()
    }

    #[must_use]
    pub fn element_count(&self) -> usize {
        self.state.elements.len()
    }

    #[must_use]
    pub fn element_ids(&self) -> Vec<ElementId> {
        self.state.elements.keys().copied().collect()
    }

    /// Number of entries in the undo history.
    #[must_use]
    pub fn undo_depth(&self) -> usize {
        self.undo.len()
    }

    /// Undo entry labels, oldest first.
    #[must_use]
    pub fn undo_labels(&self) -> Vec<&str> {
        self.undo.iter().map(|entry| entry.label.as_str()).collect()
    }

    /// Revert the most recent undo entry. Returns its label.
    pub fn undo(&mut self) -> Result<String, ModelError> {
        if let Some(tx) = &self.transaction {
            return Err(DocumentError::TransactionAlreadyOpen {
                label: tx.label.clone(),
            }
            .into());
        }
        if let Some(group) = &self.group {
            return Err(DocumentError::GroupAlreadyOpen {
                label: group.label.clone(),
            }
            .into());
        }
        let entry = self.undo.pop().ok_or(ModelError::NothingToUndo)?;
        self.state = entry.before;
        Ok(entry.label)
    }

    pub fn insert_element(&mut self, new: NewElement) -> Result<ElementId, ModelError> {
        self.ensure_writable()?;
        if !self.levels.iter().any(|level| level == &new.level) {
            return Err(ModelError::UnknownLevel {
                level: new.level,
                available: self.levels.clone(),
            });
        }
        let id = ElementId(self.next_id);
        self.next_id += 1;
        self.state.elements.insert(
            id,
            Element {
                id,
                category: new.category,
                name: new.name,
                level: new.level,
                parameters: new.parameters,
            },
        );
        Ok(id)
    }

    /// Set a parameter, returning its previous value.
    pub fn set_parameter(
        &mut self,
        id: ElementId,
        name: &str,
        value: Value,
    ) -> Result<Option<Value>, ModelError> {
        self.ensure_writable()?;
        let element = self
            .state
            .elements
            .get_mut(&id)
            .ok_or(ModelError::ElementNotFound { id })?;
        Ok(element.parameters.insert(name.to_string(), value))
    }

    pub fn remove_element(&mut self, id: ElementId) -> Result<Element, ModelError> {
        self.ensure_writable()?;
        self.state
            .elements
            .remove(&id)
            .ok_or(ModelError::ElementNotFound { id })
    }

    fn ensure_writable(&self) -> Result<(), DocumentError> {
        if self.transaction.is_none() {
            return Err(DocumentError::NoOpenTransaction);
        }
        Ok(())
    }
}

impl Document for MemoryModel {
    fn title(&self) -> &str {
        &self.title
    }

    fn begin_transaction(&mut self, label: &str) -> Result<(), DocumentError> {
        if let Some(tx) = &self.transaction {
            return Err(DocumentError::TransactionAlreadyOpen {
                label: tx.label.clone(),
            });
        }
        self.transaction = Some(OpenTransaction {
            label: label.to_string(),
            before: self.state.clone(),
        });
        Ok(())
    }

    fn commit_transaction(&mut self) -> Result<(), DocumentError> {
        let tx = self
            .transaction
            .take()
            .ok_or(DocumentError::NoOpenTransaction)?;
        match &mut self.group {
            Some(group) => group.committed += 1,
            None => {
                // A transaction that changed nothing leaves no undo entry.
                if tx.before != self.state {
                    self.undo.push(UndoEntry {
                        label: tx.label,
                        before: tx.before,
                    });
                }
            }
        }
        Ok(())
    }

    fn rollback_transaction(&mut self) -> Result<(), DocumentError> {
        let tx = self
            .transaction
            .take()
            .ok_or(DocumentError::NoOpenTransaction)?;
        tracing::debug!(label = %tx.label, "transaction rolled back");
        self.state = tx.before;
        Ok(())
    }

    fn begin_group(&mut self, label: &str) -> Result<(), DocumentError> {
        if let Some(group) = &self.group {
            return Err(DocumentError::GroupAlreadyOpen {
                label: group.label.clone(),
            });
        }
        if let Some(tx) = &self.transaction {
            return Err(DocumentError::TransactionAlreadyOpen {
                label: tx.label.clone(),
            });
        }
        self.group = Some(OpenGroup {
            label: label.to_string(),
            before: self.state.clone(),
            committed: 0,
        });
        Ok(())
    }

    fn assimilate_group(&mut self) -> Result<(), DocumentError> {
        if let Some(tx) = &self.transaction {
            return Err(DocumentError::TransactionAlreadyOpen {
                label: tx.label.clone(),
            });
        }
        let group = self.group.take().ok_or(DocumentError::NoOpenGroup)?;
        if group.committed > 0 && group.before != self.state {
            self.undo.push(UndoEntry {
                label: group.label,
                before: group.before,
            });
        }
        Ok(())
    }

    fn rollback_group(&mut self) -> Result<(), DocumentError> {
        let group = self.group.take().ok_or(DocumentError::NoOpenGroup)?;
        self.transaction = None;
        tracing::debug!(label = %group.label, committed = group.committed, "group rolled back");
        self.state = group.before;
        Ok(())
    }

    fn has_open_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    fn has_open_group(&self) -> bool {
        self.group.is_some()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wall(level: &str) -> NewElement {
        NewElement {
            category: "Walls".to_string(),
            name: "Generic - 200mm".to_string(),
            level: level.to_string(),
            parameters: BTreeMap::new(),
        }
    }

    #[test]
    fn mutation_outside_transaction_is_rejected() {
        let mut model = MemoryModel::new("Test");
        let err = model.insert_element(wall("Level 1")).unwrap_err();
        assert!(matches!(
            err,
            ModelError::Document(DocumentError::NoOpenTransaction)
        ));
        assert_eq!(model.element_count(), 0);
    }

    #[test]
    fn commit_adds_one_undo_entry_and_undo_reverts() {
        let mut model = MemoryModel::new("Test");
        model.begin_transaction("Place wall").unwrap();
        let id = model.insert_element(wall("Level 1")).unwrap();
        model.commit_transaction().unwrap();

        assert_eq!(model.undo_depth(), 1);
        assert!(model.element(id).is_some());

        assert_eq!(model.undo().unwrap(), "Place wall");
        assert_eq!(model.element_count(), 0);
        assert_eq!(model.undo_depth(), 0);
    }

    #[test]
    fn rollback_restores_pre_transaction_state() {
        let mut model = MemoryModel::new("Test");
        model.begin_transaction("Place").unwrap();
        model.insert_element(wall("Level 2")).unwrap();
        model.rollback_transaction().unwrap();
        assert_eq!(model.element_count(), 0);
        assert_eq!(model.undo_depth(), 0);
    }

    #[test]
    fn second_transaction_is_rejected() {
        let mut model = MemoryModel::new("Test");
        model.begin_transaction("A").unwrap();
        let err = model.begin_transaction("B").unwrap_err();
        assert_eq!(
            err,
            DocumentError::TransactionAlreadyOpen {
                label: "A".to_string()
            }
        );
    }

    #[test]
    fn group_assimilates_into_single_undo_entry() {
        let mut model = MemoryModel::new("Test");
        model.begin_group("Agent batch").unwrap();
        for _ in 0..3 {
            model.begin_transaction("Place").unwrap();
            model.insert_element(wall("Level 1")).unwrap();
            model.commit_transaction().unwrap();
        }
        model.assimilate_group().unwrap();

        assert_eq!(model.element_count(), 3);
        assert_eq!(model.undo_labels(), vec!["Agent batch"]);
        model.undo().unwrap();
        assert_eq!(model.element_count(), 0);
    }

    #[test]
    fn group_rollback_reverts_committed_members() {
        let mut model = MemoryModel::new("Test");
        model.begin_transaction("Seed").unwrap();
        let seed = model.insert_element(wall("Level 1")).unwrap();
        model.commit_transaction().unwrap();

        model.begin_group("Agent batch").unwrap();
        model.begin_transaction("Edit").unwrap();
        model
            .set_parameter(seed, "Comments", Value::from("changed"))
            .unwrap();
        model.commit_transaction().unwrap();
        model.begin_transaction("Place").unwrap();
        model.insert_element(wall("Level 2")).unwrap();
        model.rollback_group().unwrap();

        assert!(!model.has_open_transaction());
        assert!(!model.has_open_group());
        assert_eq!(model.element_count(), 1);
        assert!(model.element(seed).unwrap().parameters.is_empty());
        assert_eq!(model.undo_depth(), 1);
    }

    #[test]
    fn empty_group_leaves_no_undo_entry() {
        let mut model = MemoryModel::new("Test");
        model.begin_group("Nothing").unwrap();
        model.assimilate_group().unwrap();
        assert_eq!(model.undo_depth(), 0);
    }

    #[test]
    fn unknown_level_lists_available_levels() {
        let mut model = MemoryModel::new("Test");
        model.begin_transaction("Place").unwrap();
        let err = model.insert_element(wall("Roof")).unwrap_err();
        assert_eq!(
            err.to_string(),
            "unknown level 'Roof' (available: Level 1, Level 2)"
        );
    }

    #[test]
    fn undo_is_refused_while_transaction_open() {
        let mut model = MemoryModel::new("Test");
        model.begin_transaction("Open").unwrap();
        assert!(model.undo().is_err());
    }
}
