//! The host document boundary.
//!
//! The engine treats the document as an opaque handle: it only drives the
//! transaction primitives below and passes the handle through to tools. Tools
//! recover the concrete host model with [`Document::as_any_mut`].

use std::any::Any;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DocumentError {
    #[error("a transaction is already open: {label}")]
    TransactionAlreadyOpen { label: String },
    #[error("no transaction is open")]
    NoOpenTransaction,
    #[error("a transaction group is already open: {label}")]
    GroupAlreadyOpen { label: String },
    #[error("no transaction group is open")]
    NoOpenGroup,
    #[error("{0}")]
    Host(String),
}

/// A single-writer transactional document owned by the document thread.
///
/// Transactions are single-level: at most one open at a time. A group wraps
/// any number of committed transactions so they collapse into one undo entry.
pub trait Document: Send {
    /// Human-readable document title.
    fn title(&self) -> &str;

    fn begin_transaction(&mut self, label: &str) -> Result<(), DocumentError>;
    fn commit_transaction(&mut self) -> Result<(), DocumentError>;
    fn rollback_transaction(&mut self) -> Result<(), DocumentError>;

    fn begin_group(&mut self, label: &str) -> Result<(), DocumentError>;
    /// Merge every transaction committed since `begin_group` into one undo entry.
    fn assimilate_group(&mut self) -> Result<(), DocumentError>;
    /// Revert every transaction committed since `begin_group`.
    fn rollback_group(&mut self) -> Result<(), DocumentError>;

    fn has_open_transaction(&self) -> bool;
    fn has_open_group(&self) -> bool;

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}
