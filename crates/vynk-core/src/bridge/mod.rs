//! Cross-runtime command bridge.
//!
//! HTTP handlers run on the multi-threaded runtime; privileged gateway work runs on
//! the gateway runtime's single dispatcher. The only paths between them are the
//! command queue (requests in), the result store or reply channels (results out) and
//! a `watch` channel carrying the gateway status.

pub mod result_store;

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, watch};
use vynk_protocol::{CommandResult, FailureKind, GatewayStatus, Snowflake, VerificationMethod};

use crate::config::{BridgeSettings, Transport};
pub use result_store::ResultStore;

/// Unique per guild, user and issue time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(guild_id: Snowflake, user_id: Snowflake) -> Self {
        let millis = Utc::now().timestamp_millis();
        let nonce = uuid::Uuid::new_v4().simple().to_string();
        Self(format!("{guild_id}_{user_id}_{millis}_{}", &nonce[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where the dispatcher delivers the single result of a command.
#[derive(Debug)]
pub enum ResultSink {
    Store,
    Reply(oneshot::Sender<CommandResult>),
    /// Recorded on the verification session that triggered the grant.
    Session(String),
}

impl ResultSink {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Store => "store",
            Self::Reply(_) => "reply",
            Self::Session(_) => "session",
        }
    }
}

#[derive(Debug)]
pub struct Command {
    pub task_id: TaskId,
    pub guild_id: Snowflake,
    pub user_id: Snowflake,
    pub method: VerificationMethod,
    pub issued_at: DateTime<Utc>,
    pub sink: ResultSink,
}

impl Command {
    pub fn new(
        guild_id: Snowflake,
        user_id: Snowflake,
        method: VerificationMethod,
        sink: ResultSink,
    ) -> Self {
        Self {
            task_id: TaskId::new(guild_id, user_id),
            guild_id,
            user_id,
            method,
            issued_at: Utc::now(),
            sink,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Bot not ready")]
    NotReady,
    #[error("Operation timeout")]
    Timeout,
    #[error("Service shutting down")]
    ShuttingDown,
    #[error("bridge worker failed: {0}")]
    Join(String),
}

impl BridgeError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::NotReady => FailureKind::NotReady,
            Self::Timeout => FailureKind::Timeout,
            Self::ShuttingDown => FailureKind::NotReady,
            Self::Join(_) => FailureKind::Internal,
        }
    }
}

/// Sending half of the command queue; cheap to clone and usable from any thread.
#[derive(Clone)]
pub struct CommandQueue {
    tx: mpsc::UnboundedSender<Command>,
}

/// Receiving half, owned by the dispatcher.
pub struct CommandReceiver {
    rx: mpsc::UnboundedReceiver<Command>,
}

pub fn command_queue() -> (CommandQueue, CommandReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (CommandQueue { tx }, CommandReceiver { rx })
}

impl CommandQueue {
    /// Never blocks; fails only once the dispatcher has shut the queue.
    pub fn enqueue(&self, cmd: Command) -> Result<TaskId, BridgeError> {
        let task_id = cmd.task_id.clone();
        self.tx.send(cmd).map_err(|_| BridgeError::ShuttingDown)?;
        metrics::counter!("vynk_commands_enqueued_total").increment(1);
        Ok(task_id)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl CommandReceiver {
    pub async fn recv(&mut self) -> Option<Command> {
        self.rx.recv().await
    }

    /// Refuses further sends; buffered commands stay available to `try_recv`.
    pub fn close(&mut self) {
        self.rx.close();
    }

    pub fn try_recv(&mut self) -> Option<Command> {
        self.rx.try_recv().ok()
    }
}

/// Entry point used by HTTP handlers and the session layer.
#[derive(Clone)]
pub struct Bridge {
    queue: CommandQueue,
    store: Arc<ResultStore>,
    status: watch::Receiver<GatewayStatus>,
    transport: Transport,
    deadline: Duration,
}

impl Bridge {
    pub fn new(
        queue: CommandQueue,
        store: Arc<ResultStore>,
        status: watch::Receiver<GatewayStatus>,
        settings: &BridgeSettings,
    ) -> Self {
        Self {
            queue,
            store,
            status,
            transport: settings.transport,
            deadline: settings.deadline,
        }
    }

    pub fn status(&self) -> GatewayStatus {
        self.status.borrow().clone()
    }

    pub fn is_ready(&self) -> bool {
        self.status.borrow().ready
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    pub fn store(&self) -> &Arc<ResultStore> {
        &self.store
    }

    /// Enqueues a grant and waits up to the bridge deadline for its result.
    ///
    /// A timeout here does not cancel the command; its late result is left for the
    /// result store sweeper.
    pub async fn assign_role(
        &self,
        guild_id: Snowflake,
        user_id: Snowflake,
        method: VerificationMethod,
    ) -> Result<CommandResult, BridgeError> {
        if !self.is_ready() {
            return Err(BridgeError::NotReady);
        }
        let started = Instant::now();
        let outcome = match self.transport {
            Transport::ResultStore => self.via_store(guild_id, user_id, method).await,
            Transport::Reply => self.via_reply(guild_id, user_id, method).await,
        };
        metrics::histogram!("vynk_bridge_wait_seconds").record(started.elapsed().as_secs_f64());
        if matches!(outcome, Err(BridgeError::Timeout)) {
            metrics::counter!("vynk_bridge_timeouts_total").increment(1);
            tracing::warn!(
                guild_id = %guild_id,
                user_id = %user_id,
                transport = self.transport.as_str(),
                "bridge deadline elapsed"
            );
        }
        outcome
    }

    async fn via_store(
        &self,
        guild_id: Snowflake,
        user_id: Snowflake,
        method: VerificationMethod,
    ) -> Result<CommandResult, BridgeError> {
        let deadline = Instant::now() + self.deadline;
        let task_id = self
            .queue
            .enqueue(Command::new(guild_id, user_id, method, ResultSink::Store))?;
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.await_result(&task_id, deadline))
            .await
            .map_err(|e| BridgeError::Join(e.to_string()))?
    }

    async fn via_reply(
        &self,
        guild_id: Snowflake,
        user_id: Snowflake,
        method: VerificationMethod,
    ) -> Result<CommandResult, BridgeError> {
        let (tx, rx) = oneshot::channel();
        self.queue
            .enqueue(Command::new(guild_id, user_id, method, ResultSink::Reply(tx)))?;
        match tokio::time::timeout(self.deadline, rx).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Err(BridgeError::ShuttingDown),
            Err(_) => Err(BridgeError::Timeout),
        }
    }

    /// Fire-and-forget grant whose result is recorded on the session.
    pub fn submit_for_session(
        &self,
        guild_id: Snowflake,
        user_id: Snowflake,
        session_id: &str,
    ) -> Result<TaskId, BridgeError> {
        self.queue.enqueue(Command::new(
            guild_id,
            user_id,
            VerificationMethod::Web,
            ResultSink::Session(session_id.to_string()),
        ))
    }
}
