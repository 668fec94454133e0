//! Transaction scopes and groups over the host document.
//!
//! Two levels only: an optional outer group, and at most one inner scope at a
//! time. A scope that is dropped while still `Started` rolls itself back, so an
//! early return or panic never leaves a mutation half-applied.

use bimlink_types::{Document, DocumentError};

#[derive(Debug, thiserror::Error)]
pub enum TransactionError {
    #[error("transaction group '{label}' is already active")]
    GroupAlreadyActive { label: String },
    #[error("no transaction group is active")]
    NoActiveGroup,
    #[error("'{label}': {source}")]
    Document {
        label: String,
        #[source]
        source: DocumentError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeStatus {
    Started,
    Committed,
    RolledBack,
}

/// One atomic mutation attempt. Commit explicitly or let drop roll it back.
pub struct TransactionScope<'d> {
    document: &'d mut dyn Document,
    label: String,
    status: ScopeStatus,
}

impl<'d> TransactionScope<'d> {
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    #[must_use]
    pub fn status(&self) -> ScopeStatus {
        self.status
    }

    /// The document, for mutation inside this scope.
    pub fn document(&mut self) -> &mut (dyn Document + 'd) {
        &mut *self.document
    }

    pub fn commit(mut self) -> Result<(), TransactionError> {
        match self.document.commit_transaction() {
            Ok(()) => {
                self.status = ScopeStatus::Committed;
                Ok(())
            }
            Err(source) => {
                if self.document.has_open_transaction() {
                    self.rollback_in_place();
                } else {
                    self.status = ScopeStatus::RolledBack;
                }
                Err(TransactionError::Document {
                    label: self.label.clone(),
                    source,
                })
            }
        }
    }

    pub fn rollback(mut self) -> Result<(), TransactionError> {
        let result = self.document.rollback_transaction();
        self.status = ScopeStatus::RolledBack;
        result.map_err(|source| TransactionError::Document {
            label: self.label.clone(),
            source,
        })
    }

    fn rollback_in_place(&mut self) {
        if let Err(e) = self.document.rollback_transaction() {
            tracing::warn!(label = %self.label, "transaction rollback failed: {e}");
        }
        self.status = ScopeStatus::RolledBack;
    }
}

impl Drop for TransactionScope<'_> {
    fn drop(&mut self) {
        if self.status == ScopeStatus::Started {
            tracing::debug!(label = %self.label, "transaction scope dropped uncommitted; rolling back");
            self.rollback_in_place();
        }
    }
}

#[derive(Debug)]
struct ActiveGroup {
    label: String,
    scopes: usize,
}

/// Owns group state for the document thread.
///
/// Lives inside the document thread's context, so it is never shared and needs
/// no locking.
#[derive(Debug, Default)]
pub struct TransactionManager {
    active_group: Option<ActiveGroup>,
}

impl TransactionManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Label of the active group, if any.
    #[must_use]
    pub fn active_group(&self) -> Option<&str> {
        self.active_group.as_ref().map(|group| group.label.as_str())
    }

    pub fn start_transaction<'d>(
        &mut self,
        document: &'d mut dyn Document,
        label: &str,
    ) -> Result<TransactionScope<'d>, TransactionError> {
        document
            .begin_transaction(label)
            .map_err(|source| TransactionError::Document {
                label: label.to_string(),
                source,
            })?;
        if let Some(group) = &mut self.active_group {
            group.scopes += 1;
        }
        Ok(TransactionScope {
            document,
            label: label.to_string(),
            status: ScopeStatus::Started,
        })
    }

    pub fn start_group(
        &mut self,
        document: &mut dyn Document,
        label: &str,
    ) -> Result<(), TransactionError> {
        if let Some(group) = &self.active_group {
            return Err(TransactionError::GroupAlreadyActive {
                label: group.label.clone(),
            });
        }
        document
            .begin_group(label)
            .map_err(|source| TransactionError::Document {
                label: label.to_string(),
                source,
            })?;
        self.active_group = Some(ActiveGroup {
            label: label.to_string(),
            scopes: 0,
        });
        Ok(())
    }

    /// Assimilate every scope opened since `start_group` into one undo entry.
    ///
    /// Returns the number of scopes in the group. Group state is cleared even
    /// when the host refuses to assimilate; in that case the group is rolled back.
    pub fn commit_group(&mut self, document: &mut dyn Document) -> Result<usize, TransactionError> {
        let group = self
            .active_group
            .take()
            .ok_or(TransactionError::NoActiveGroup)?;
        match document.assimilate_group() {
            Ok(()) => Ok(group.scopes),
            Err(source) => {
                if document.has_open_transaction()
                    && let Err(e) = document.rollback_transaction()
                {
                    tracing::warn!(label = %group.label, "rollback of open transaction failed: {e}");
                }
                if document.has_open_group()
                    && let Err(e) = document.rollback_group()
                {
                    tracing::warn!(label = %group.label, "group rollback after failed commit failed: {e}");
                }
                Err(TransactionError::Document {
                    label: group.label,
                    source,
                })
            }
        }
    }

    /// Revert everything since `start_group`. Returns the number of scopes undone.
    pub fn rollback_group(
        &mut self,
        document: &mut dyn Document,
    ) -> Result<usize, TransactionError> {
        let group = self
            .active_group
            .take()
            .ok_or(TransactionError::NoActiveGroup)?;
        document
            .rollback_group()
            .map(|()| group.scopes)
            .map_err(|source| TransactionError::Document {
                label: group.label,
                source,
            })
    }

    /// Close anything left open. Idempotent and never fails.
    ///
    /// Returns `true` if something had to be closed.
    pub fn ensure_group_closed(&mut self, document: &mut dyn Document) -> bool {
        let mut closed = false;
        if document.has_open_transaction() {
            closed = true;
            tracing::warn!("closing dangling transaction");
            if let Err(e) = document.rollback_transaction() {
                tracing::warn!("dangling transaction rollback failed: {e}");
            }
        }
        let group = self.active_group.take();
        if group.is_some() || document.has_open_group() {
            closed = true;
            let label = group.map_or_else(|| "<untracked>".to_string(), |g| g.label);
            tracing::warn!(label = %label, "rolling back dangling transaction group");
            if document.has_open_group()
                && let Err(e) = document.rollback_group()
            {
                tracing::warn!(label = %label, "dangling group rollback failed: {e}");
            }
        }
        closed
    }

    /// Forget group state without touching a document (the document went away).
    pub(crate) fn reset(&mut self) {
        if let Some(group) = self.active_group.take() {
            tracing::warn!(label = %group.label, "discarding group state for closed document");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bimlink_model::{MemoryModel, NewElement};
    use std::collections::BTreeMap;

    fn wall() -> NewElement {
        NewElement {
            category: "Walls".to_string(),
            name: "Basic".to_string(),
            level: "Level 1".to_string(),
            parameters: BTreeMap::new(),
        }
    }

    fn place(scope: &mut TransactionScope<'_>) {
        scope
            .document()
            .as_any_mut()
            .downcast_mut::<MemoryModel>()
            .unwrap()
            .insert_element(wall())
            .unwrap();
    }

    #[test]
    fn dropped_scope_rolls_back() {
        let mut model = MemoryModel::new("Test");
        let mut tm = TransactionManager::new();
        {
            let mut scope = tm.start_transaction(&mut model, "Place").unwrap();
            place(&mut scope);
            assert_eq!(scope.status(), ScopeStatus::Started);
        }
        assert_eq!(model.element_count(), 0);
        assert!(!model.has_open_transaction());
    }

    #[test]
    fn committed_scope_persists() {
        let mut model = MemoryModel::new("Test");
        let mut tm = TransactionManager::new();
        let mut scope = tm.start_transaction(&mut model, "Place").unwrap();
        place(&mut scope);
        scope.commit().unwrap();
        assert_eq!(model.element_count(), 1);
        assert_eq!(model.undo_depth(), 1);
    }

    #[test]
    fn second_group_is_rejected() {
        let mut model = MemoryModel::new("Test");
        let mut tm = TransactionManager::new();
        tm.start_group(&mut model, "First").unwrap();
        let err = tm.start_group(&mut model, "Second").unwrap_err();
        assert!(matches!(err, TransactionError::GroupAlreadyActive { ref label } if label == "First"));
        assert_eq!(tm.active_group(), Some("First"));
    }

    #[test]
    fn group_commit_counts_scopes_and_adds_one_undo_entry() {
        let mut model = MemoryModel::new("Test");
        let mut tm = TransactionManager::new();
        tm.start_group(&mut model, "Batch").unwrap();
        for _ in 0..3 {
            let mut scope = tm.start_transaction(&mut model, "Place").unwrap();
            place(&mut scope);
            scope.commit().unwrap();
        }
        assert_eq!(tm.commit_group(&mut model).unwrap(), 3);
        assert_eq!(tm.active_group(), None);
        assert_eq!(model.undo_labels(), vec!["Batch"]);
    }

    #[test]
    fn group_rollback_reverts_committed_scopes() {
        let mut model = MemoryModel::new("Test");
        let mut tm = TransactionManager::new();
        tm.start_group(&mut model, "Batch").unwrap();
        let mut scope = tm.start_transaction(&mut model, "Place").unwrap();
        place(&mut scope);
        scope.commit().unwrap();
        assert_eq!(tm.rollback_group(&mut model).unwrap(), 1);
        assert_eq!(model.element_count(), 0);
        assert_eq!(model.undo_depth(), 0);
    }

    #[test]
    fn commit_without_group_errors() {
        let mut model = MemoryModel::new("Test");
        let mut tm = TransactionManager::new();
        assert!(matches!(
            tm.commit_group(&mut model),
            Err(TransactionError::NoActiveGroup)
        ));
        assert!(matches!(
            tm.rollback_group(&mut model),
            Err(TransactionError::NoActiveGroup)
        ));
    }

    #[test]
    fn ensure_group_closed_is_idempotent() {
        let mut model = MemoryModel::new("Test");
        let mut tm = TransactionManager::new();
        assert!(!tm.ensure_group_closed(&mut model));

        tm.start_group(&mut model, "Batch").unwrap();
        let mut scope = tm.start_transaction(&mut model, "Place").unwrap();
        place(&mut scope);
        scope.commit().unwrap();

        assert!(tm.ensure_group_closed(&mut model));
        assert!(!tm.ensure_group_closed(&mut model));
        assert!(!model.has_open_group());
        assert_eq!(model.element_count(), 0);
    }

    #[test]
    fn failed_begin_surfaces_document_error() {
        let mut model = MemoryModel::new("Test");
        model.begin_transaction("Host").unwrap();
        let mut tm = TransactionManager::new();
        let err = tm.start_transaction(&mut model, "Place").err().unwrap();
        assert_eq!(
            err.to_string(),
            "'Place': a transaction is already open: Host"
        );
    }
}
