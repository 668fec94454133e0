//! Tool execution and transaction orchestration for bimlink.
//!
//! The document may only be touched from one thread. Callers on any other
//! thread hand work to it through the [`Marshal`]; the [`Dispatcher`] turns an
//! agent turn's tool calls into that work, gating each call through the
//! [`SafetyGate`] and wrapping mutations in transaction scopes and groups.

mod config;
mod dispatch;
mod marshal;
mod safety;
mod settings;
mod transaction;
mod util;

pub use config::{
    BimlinkConfig, ConfigError, DRY_RUN_ENV, MarshalConfig, SKIP_CONFIRMATIONS_ENV,
    SafetyConfig, ToolsConfig, config_path,
};
pub use dispatch::{
    BatchDisposition, BatchOutcome, Dispatcher, NO_DOCUMENT_MESSAGE, SKIPPED_PREFIX,
};
pub use marshal::{
    CommandHandle, CommandState, DEFAULT_MAX_COMMANDS_PER_SIGNAL, DocumentContext,
    DocumentSession, DocumentThread, Marshal, MarshalError, MarshalSettings, SignalOutcome,
};
pub use safety::{
    ApprovalDecision, ApprovalFut, ApprovalHandler, CANCELLED_BY_USER, ConfirmationRequest,
    DENIED_BY_USER, DRY_RUN_PREFIX, SafetyFlags, SafetyGate, SafetySnapshot, StaticApprover,
};
pub use settings::{EngineSettings, ToolLimits};
pub use transaction::{ScopeStatus, TransactionError, TransactionManager, TransactionScope};
pub use util::truncate_with_ellipsis;
