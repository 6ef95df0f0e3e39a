use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use tokio::sync::watch;
use vynk_kernel::Kernel;
use vynk_protocol::{CommandResult, FailureKind};

use crate::bridge::{Command, CommandReceiver, ResultSink, ResultStore};
use crate::gateway::Gateway;
use crate::grant::{grant_verified_role, into_command_result};

pub const COMMAND_TIMEOUT_MESSAGE: &str = "Role assignment timed out";
const SHUTDOWN_MESSAGE: &str = "Service shutting down";
const FAULT_MESSAGE: &str = "Internal error";

/// Drains the command queue on the gateway runtime, one command at a time.
pub struct Dispatcher {
    rx: CommandReceiver,
    gateway: Arc<dyn Gateway>,
    kernel: Kernel,
    store: Arc<ResultStore>,
    command_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        rx: CommandReceiver,
        gateway: Arc<dyn Gateway>,
        kernel: Kernel,
        store: Arc<ResultStore>,
        command_timeout: Duration,
    ) -> Self {
        Self {
            rx,
            gateway,
            kernel,
            store,
            command_timeout,
        }
    }

    /// Runs until every queue sender is gone or `shutdown` flips to `true`.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            timeout_ms = self.command_timeout.as_millis() as u64,
            "command dispatcher started"
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            let next = tokio::select! {
                cmd = self.rx.recv() => cmd,
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        // sender dropped; treat as shutdown
                        break;
                    }
                    continue;
                }
            };
            match next {
                Some(cmd) => self.handle(cmd).await,
                None => break,
            }
        }
        self.drain().await;
        tracing::info!("command dispatcher stopped");
    }

    /// Executes one command and delivers exactly one result to its sink.
    pub async fn handle(&self, cmd: Command) {
        let started = Instant::now();
        let exec = grant_verified_role(
            self.gateway.as_ref(),
            &self.kernel,
            cmd.guild_id,
            cmd.user_id,
            cmd.method,
        );
        let timed = tokio::time::timeout(self.command_timeout, exec);
        let result = match AssertUnwindSafe(timed).catch_unwind().await {
            Err(panic) => {
                metrics::counter!("vynk_dispatcher_faults_total").increment(1);
                tracing::error!(
                    task_id = %cmd.task_id,
                    panic = panic_message(panic.as_ref()),
                    "grant command panicked"
                );
                CommandResult::failure(FailureKind::Internal, FAULT_MESSAGE)
            }
            Ok(Ok(outcome)) => {
                if let Err(err) = &outcome {
                    if err.kind() == FailureKind::Internal {
                        tracing::error!(
                            task_id = %cmd.task_id,
                            error = %err,
                            "grant command faulted"
                        );
                    }
                }
                into_command_result(outcome)
            }
            Ok(Err(_)) => {
                metrics::counter!("vynk_dispatcher_timeouts_total").increment(1);
                CommandResult::failure(FailureKind::Timeout, COMMAND_TIMEOUT_MESSAGE)
            }
        };
        let elapsed = started.elapsed();
        metrics::histogram!("vynk_dispatcher_exec_seconds").record(elapsed.as_secs_f64());
        let outcome = result.kind().map(|k| k.as_str()).unwrap_or("success");
        metrics::counter!("vynk_dispatcher_commands_total", "outcome" => outcome).increment(1);
        tracing::info!(
            task_id = %cmd.task_id,
            guild_id = %cmd.guild_id,
            user_id = %cmd.user_id,
            method = cmd.method.as_str(),
            sink = cmd.sink.label(),
            outcome,
            elapsed_ms = elapsed.as_millis() as u64,
            queued_ms = (chrono::Utc::now() - cmd.issued_at).num_milliseconds(),
            "command processed"
        );
        self.deliver(cmd, result).await;
    }

    async fn deliver(&self, cmd: Command, result: CommandResult) {
        match cmd.sink {
            ResultSink::Store => self.store.put(cmd.task_id, result),
            ResultSink::Reply(tx) => {
                if tx.send(result).is_err() {
                    tracing::debug!(task_id = %cmd.task_id, "reply waiter already gone");
                }
            }
            ResultSink::Session(session_id) => {
                match self
                    .kernel
                    .record_session_grant_async(&session_id, &result)
                    .await
                {
                    Ok(true) => {}
                    Ok(false) => tracing::debug!(
                        session_id = %session_id,
                        "session grant already recorded"
                    ),
                    Err(err) => tracing::error!(
                        session_id = %session_id,
                        error = %err,
                        "failed to record session grant"
                    ),
                }
            }
        }
    }

    /// Refuses new commands and answers buffered ones without executing them.
    /// Session commands are left unrecorded so startup recovery picks them up.
    async fn drain(&mut self) {
        self.rx.close();
        let mut dropped = 0usize;
        while let Some(cmd) = self.rx.try_recv() {
            dropped += 1;
            if matches!(cmd.sink, ResultSink::Session(_)) {
                continue;
            }
            let result = CommandResult::failure(FailureKind::NotReady, SHUTDOWN_MESSAGE);
            self.deliver(cmd, result).await;
        }
        if dropped > 0 {
            tracing::warn!(dropped, "dispatcher stopped with commands still queued");
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
