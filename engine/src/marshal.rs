//! Command marshalling onto the document thread.
//!
//! Any thread may [`Marshal::submit`] work; only the document thread runs it.
//! Submissions land in a FIFO queue and raise a single-slot wakeup signal. The
//! document thread drains at most `max_commands_per_signal` commands per wakeup
//! and re-raises the signal for whatever is left.
//!
//! ```text
//! caller ──submit──▶ queue ──signal──▶ document thread ──execute──▶ oneshot ──▶ caller
//! ```

use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::thread::JoinHandle;

use bimlink_types::Document;
use tokio::runtime::Runtime;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::transaction::TransactionManager;
use crate::util::panic_payload_to_string;

pub const DEFAULT_MAX_COMMANDS_PER_SIGNAL: usize = 16;

const DOCUMENT_THREAD_NAME: &str = "bimlink-document";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarshalSettings {
    pub max_commands_per_signal: usize,
}

impl Default for MarshalSettings {
    fn default() -> Self {
        Self {
            max_commands_per_signal: DEFAULT_MAX_COMMANDS_PER_SIGNAL,
        }
    }
}

/// Result of raising the wakeup signal.
///
/// `Accepted` and `Pending` both mean the command will run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalOutcome {
    Accepted,
    /// A wakeup is already scheduled.
    Pending,
    /// The host refused (modal dialog, shut down).
    Denied,
}

impl SignalOutcome {
    #[must_use]
    pub fn will_run(self) -> bool {
        !matches!(self, SignalOutcome::Denied)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MarshalError {
    #[error("cancelled before it ran")]
    Cancelled,
    #[error("failed on the document thread: {message}")]
    Faulted { message: String },
    #[error("document thread unavailable: {reason}")]
    Unavailable { reason: String },
}

/// Terminal state of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    Completed,
    Faulted,
    Cancelled,
}

// ============================================================================
// Document context
// ============================================================================

/// State owned by the document thread and lent to each command.
pub struct DocumentContext {
    document: Option<Box<dyn Document>>,
    transactions: TransactionManager,
    runtime: Runtime,
}

/// Split borrow of [`DocumentContext`] for a command that needs an open document.
pub struct DocumentSession<'a> {
    pub document: &'a mut dyn Document,
    pub transactions: &'a mut TransactionManager,
    /// Current-thread runtime for driving tool futures in place.
    pub runtime: &'a Runtime,
}

impl DocumentContext {
    fn new(document: Option<Box<dyn Document>>, runtime: Runtime) -> Self {
        Self {
            document,
            transactions: TransactionManager::new(),
            runtime,
        }
    }

    #[must_use]
    pub fn has_document(&self) -> bool {
        self.document.is_some()
    }

    /// Title of the open document.
    #[must_use]
    pub fn document_title(&self) -> Option<&str> {
        self.document.as_deref().map(Document::title)
    }

    /// `None` when no document is open.
    pub fn session(&mut self) -> Option<DocumentSession<'_>> {
        let document: &mut dyn Document = self.document.as_deref_mut()?;
        Some(DocumentSession {
            document,
            transactions: &mut self.transactions,
            runtime: &self.runtime,
        })
    }

    /// Replace the open document, returning the previous one.
    pub fn open_document(&mut self, document: Box<dyn Document>) -> Option<Box<dyn Document>> {
        let previous = self.close_document();
        tracing::info!(title = document.title(), "document opened");
        self.document = Some(document);
        previous
    }

    pub fn close_document(&mut self) -> Option<Box<dyn Document>> {
        let mut previous = self.document.take()?;
        self.transactions.ensure_group_closed(previous.as_mut());
        self.transactions.reset();
        tracing::info!(title = previous.title(), "document closed");
        Some(previous)
    }

    /// Safety net run after every command.
    fn ensure_clean(&mut self) {
        match self.document.as_deref_mut() {
            Some(document) => {
                if self.transactions.ensure_group_closed(document) {
                    tracing::warn!("command left transactions open; rolled back");
                }
            }
            None => self.transactions.reset(),
        }
    }
}

// ============================================================================
// Commands
// ============================================================================

trait Command: Send {
    fn id(&self) -> u64;
    fn execute(self: Box<Self>, ctx: &mut DocumentContext) -> CommandState;
    fn abort(self: Box<Self>, error: MarshalError);
}

type Reply<T> = oneshot::Sender<Result<T, MarshalError>>;

struct WorkItem<T, F> {
    id: u64,
    cancel: CancellationToken,
    work: F,
    reply: Reply<T>,
}

impl<T, F> Command for WorkItem<T, F>
where
    T: Send + 'static,
    F: FnOnce(&mut DocumentContext) -> anyhow::Result<T> + Send + 'static,
{
    fn id(&self) -> u64 {
        self.id
    }

    fn execute(self: Box<Self>, ctx: &mut DocumentContext) -> CommandState {
        let WorkItem {
            id,
            cancel,
            work,
            reply,
        } = *self;

        if cancel.is_cancelled() {
            let _ = reply.send(Err(MarshalError::Cancelled));
            return CommandState::Cancelled;
        }

        let (state, result) = match std::panic::catch_unwind(AssertUnwindSafe(|| work(ctx))) {
            Ok(Ok(value)) => (CommandState::Completed, Ok(value)),
            Ok(Err(err)) => (
                CommandState::Faulted,
                Err(MarshalError::Faulted {
                    message: format!("{err:#}"),
                }),
            ),
            Err(payload) => (
                CommandState::Faulted,
                Err(MarshalError::Faulted {
                    message: format!("panicked: {}", panic_payload_to_string(&payload)),
                }),
            ),
        };
        if reply.send(result).is_err() {
            tracing::debug!(command = id, "caller went away before the result arrived");
        }
        state
    }

    fn abort(self: Box<Self>, error: MarshalError) {
        let _ = self.reply.send(Err(error));
    }
}

/// Awaitable completion of a submitted command.
pub struct CommandHandle<T> {
    id: u64,
    state: HandleState<T>,
}

enum HandleState<T> {
    Waiting(oneshot::Receiver<Result<T, MarshalError>>),
    Failed(Option<MarshalError>),
}

impl<T> CommandHandle<T> {
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    fn failed(id: u64, error: MarshalError) -> Self {
        Self {
            id,
            state: HandleState::Failed(Some(error)),
        }
    }
}

impl<T> Future for CommandHandle<T> {
    type Output = Result<T, MarshalError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.state {
            HandleState::Waiting(rx) => Pin::new(rx).poll(cx).map(|received| {
                received.unwrap_or_else(|_| {
                    Err(MarshalError::Unavailable {
                        reason: "document thread dropped the command".to_string(),
                    })
                })
            }),
            HandleState::Failed(error) => Poll::Ready(Err(error.take().unwrap_or(
                MarshalError::Unavailable {
                    reason: "command handle polled after completion".to_string(),
                },
            ))),
        }
    }
}

// ============================================================================
// Channel
// ============================================================================

struct Shared {
    queue: Mutex<VecDeque<Box<dyn Command>>>,
    wake_tx: mpsc::Sender<()>,
    closed: AtomicBool,
    suspended: AtomicBool,
    next_id: AtomicU64,
    max_commands_per_signal: usize,
}

impl Shared {
    fn queue(&self) -> MutexGuard<'_, VecDeque<Box<dyn Command>>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn raise(&self) -> SignalOutcome {
        if self.is_closed() || self.suspended.load(Ordering::Acquire) {
            return SignalOutcome::Denied;
        }
        match self.wake_tx.try_send(()) {
            Ok(()) => SignalOutcome::Accepted,
            Err(TrySendError::Full(())) => SignalOutcome::Pending,
            Err(TrySendError::Closed(())) => SignalOutcome::Denied,
        }
    }

    fn pop(&self) -> Option<Box<dyn Command>> {
        self.queue().pop_front()
    }

    fn take(&self, id: u64) -> Option<Box<dyn Command>> {
        let mut queue = self.queue();
        let position = queue.iter().position(|command| command.id() == id)?;
        queue.remove(position)
    }

    fn pending(&self) -> usize {
        self.queue().len()
    }

    fn abort_all(&self, error: &MarshalError) -> usize {
        let drained: Vec<_> = self.queue().drain(..).collect();
        let count = drained.len();
        for command in drained {
            command.abort(error.clone());
        }
        count
    }
}

/// Cloneable handle for submitting work to the document thread.
#[derive(Clone)]
pub struct Marshal {
    shared: Arc<Shared>,
}

impl Marshal {
    /// Enqueue `work` for the document thread and return a handle to await.
    ///
    /// Never blocks. If the signal is denied the command is withdrawn and the
    /// handle resolves to [`MarshalError::Unavailable`].
    pub fn submit<T, F>(&self, cancel: &CancellationToken, work: F) -> CommandHandle<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut DocumentContext) -> anyhow::Result<T> + Send + 'static,
    {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        if self.shared.is_closed() {
            return CommandHandle::failed(
                id,
                MarshalError::Unavailable {
                    reason: "document thread is shut down".to_string(),
                },
            );
        }

        let (reply, rx) = oneshot::channel();
        self.shared.queue().push_back(Box::new(WorkItem {
            id,
            cancel: cancel.clone(),
            work,
            reply,
        }));

        let outcome = self.shared.raise();
        tracing::trace!(command = id, ?outcome, "command submitted");
        if !outcome.will_run()
            && let Some(command) = self.shared.take(id)
        {
            tracing::warn!(command = id, "document thread refused the wakeup signal");
            command.abort(MarshalError::Unavailable {
                reason: "the host is not accepting work (busy or shut down)".to_string(),
            });
        }

        CommandHandle {
            id,
            state: HandleState::Waiting(rx),
        }
    }

    /// Submit and await in one step.
    pub async fn run<T, F>(&self, cancel: &CancellationToken, work: F) -> Result<T, MarshalError>
    where
        T: Send + 'static,
        F: FnOnce(&mut DocumentContext) -> anyhow::Result<T> + Send + 'static,
    {
        self.submit(cancel, work).await
    }

    /// Number of commands waiting to run.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.shared.pending()
    }

    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shared.is_closed()
    }

    /// Refuse the wakeup signal until [`Marshal::resume`], as a host does while
    /// a modal dialog is up.
    pub fn suspend(&self) {
        self.shared.suspended.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.shared.suspended.store(false, Ordering::Release);
        if self.shared.pending() > 0 {
            let _ = self.shared.raise();
        }
    }

    /// Cancel every queued command. Returns how many were cancelled.
    pub fn cancel_all(&self) -> usize {
        self.shared.abort_all(&MarshalError::Cancelled)
    }

    /// Stop accepting work and cancel everything still queued. Idempotent.
    pub fn shutdown(&self) -> usize {
        let was_closed = self.shared.closed.swap(true, Ordering::AcqRel);
        let cancelled = self.cancel_all();
        if !was_closed {
            tracing::debug!(cancelled, "document channel shutting down");
            // Wake the loop so it can observe `closed`; Full means it is already awake.
            let _ = self.shared.wake_tx.try_send(());
        }
        cancelled
    }
}

// ============================================================================
// Document thread
// ============================================================================

/// Owns the one thread allowed to touch the document.
pub struct DocumentThread {
    marshal: Marshal,
    join: Option<JoinHandle<()>>,
}

impl DocumentThread {
    pub fn spawn(
        document: Option<Box<dyn Document>>,
        settings: MarshalSettings,
    ) -> std::io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()?;
        let (wake_tx, wake_rx) = mpsc::channel(1);
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            wake_tx,
            closed: AtomicBool::new(false),
            suspended: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            max_commands_per_signal: settings.max_commands_per_signal.max(1),
        });

        let thread_shared = shared.clone();
        let join = std::thread::Builder::new()
            .name(DOCUMENT_THREAD_NAME.to_string())
            .spawn(move || {
                let ctx = DocumentContext::new(document, runtime);
                run_document_loop(&thread_shared, wake_rx, ctx);
            })?;

        Ok(Self {
            marshal: Marshal { shared },
            join: Some(join),
        })
    }

    #[must_use]
    pub fn marshal(&self) -> Marshal {
        self.marshal.clone()
    }

    pub async fn open_document(&self, document: Box<dyn Document>) -> Result<(), MarshalError> {
        self.marshal
            .run(&CancellationToken::new(), move |ctx| {
                drop(ctx.open_document(document));
                Ok(())
            })
            .await
    }

    pub async fn close_document(&self) -> Result<Option<Box<dyn Document>>, MarshalError> {
        self.marshal
            .run(&CancellationToken::new(), |ctx| Ok(ctx.close_document()))
            .await
    }

    /// Shut the channel down and join the thread. Idempotent.
    pub fn shutdown(&mut self) {
        self.marshal.shutdown();
        if let Some(join) = self.join.take()
            && join.join().is_err()
        {
            tracing::error!("document thread panicked");
        }
    }
}

impl Drop for DocumentThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_document_loop(shared: &Shared, mut wake_rx: mpsc::Receiver<()>, mut ctx: DocumentContext) {
    tracing::debug!("document thread started");
    while wake_rx.blocking_recv().is_some() {
        if shared.is_closed() {
            break;
        }
        let mut processed = 0;
        while processed < shared.max_commands_per_signal && !shared.is_closed() {
            let Some(command) = shared.pop() else {
                break;
            };
            let id = command.id();
            let state = command.execute(&mut ctx);
            ctx.ensure_clean();
            tracing::debug!(command = id, ?state, "command finished");
            processed += 1;
        }
        if !shared.is_closed() && shared.pending() > 0 {
            tracing::trace!(remaining = shared.pending(), "re-raising for leftover commands");
            let _ = shared.raise();
        }
    }
    let cancelled = shared.abort_all(&MarshalError::Cancelled);
    drop(ctx.close_document());
    tracing::debug!(cancelled, "document thread stopped");
}
