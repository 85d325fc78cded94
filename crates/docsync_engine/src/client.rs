//! Async driver for the sync engine.
//!
//! `SyncClient` runs one [`SyncEngine`] inside a spawned task. Commands
//! from the application and events from the stream are serialized through
//! a single `select!` loop, so the engine never sees two transitions at
//! once.

use crate::config::SyncConfig;
use crate::engine::{ListenEvent, ListenerId, MutationHandle, SyncEngine, SyncStats};
use crate::error::{SyncError, SyncResult};
use crate::evaluator::QueryEvaluator;
use crate::persistence::Persistence;
use crate::transport::{Connection, StreamChannel};
use docsync_protocol::{Mutation, StatusCode, StreamError, StreamEvent, Target};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, trace, warn};

type ListenReply = (ListenerId, mpsc::UnboundedReceiver<ListenEvent>);

enum Command {
    Listen {
        target: Target,
        reply: oneshot::Sender<ListenReply>,
    },
    Unlisten {
        listener_id: ListenerId,
        reply: oneshot::Sender<SyncResult<()>>,
    },
    Submit {
        mutations: Vec<Mutation>,
        reply: oneshot::Sender<SyncResult<MutationHandle>>,
    },
    Interrupt,
    Resume,
    Stats {
        reply: oneshot::Sender<SyncStats>,
    },
    Shutdown,
}

/// Handle to a running sync engine.
#[derive(Debug)]
pub struct SyncClient {
    commands: mpsc::Sender<Command>,
    task: JoinHandle<()>,
}

impl SyncClient {
    /// Starts the engine on the current tokio runtime.
    pub fn spawn<C, P, E>(
        config: SyncConfig,
        connection: C,
        persistence: P,
        evaluator: E,
    ) -> SyncResult<Self>
    where
        C: Connection + 'static,
        P: Persistence + 'static,
        E: QueryEvaluator + 'static,
    {
        let (commands, receiver) = mpsc::channel(config.command_buffer);
        let engine = SyncEngine::new(config, persistence, evaluator)?;
        let driver = Driver {
            engine,
            connection,
            commands: receiver,
            stream: None,
            retry_at: None,
        };
        let task = tokio::spawn(driver.run());
        Ok(Self { commands, task })
    }

    /// Registers a listener on a target.
    pub async fn listen(&self, target: Target) -> SyncResult<ListenReply> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Listen { target, reply }).await?;
        response.await.map_err(|_| SyncError::Shutdown)
    }

    /// Removes a listener.
    pub async fn unlisten(&self, listener_id: ListenerId) -> SyncResult<()> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Unlisten { listener_id, reply }).await?;
        response.await.map_err(|_| SyncError::Shutdown)?
    }

    /// Submits a batch of writes.
    pub async fn submit_mutation(&self, mutations: Vec<Mutation>) -> SyncResult<MutationHandle> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Submit { mutations, reply }).await?;
        response.await.map_err(|_| SyncError::Shutdown)?
    }

    /// Disables the network.
    pub async fn interrupt(&self) -> SyncResult<()> {
        self.send(Command::Interrupt).await
    }

    /// Re-enables the network and reconnects without waiting for backoff.
    pub async fn resume(&self) -> SyncResult<()> {
        self.send(Command::Resume).await
    }

    /// Returns the engine statistics.
    pub async fn stats(&self) -> SyncResult<SyncStats> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Stats { reply }).await?;
        response.await.map_err(|_| SyncError::Shutdown)
    }

    /// Stops the engine and waits for its task to finish.
    pub async fn shutdown(self) -> SyncResult<()> {
        let _ = self.commands.send(Command::Shutdown).await;
        self.task
            .await
            .map_err(|err| SyncError::Internal(format!("sync task failed: {err}")))
    }

    async fn send(&self, command: Command) -> SyncResult<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SyncError::Shutdown)
    }
}

struct Driver<C, P: Persistence, E: QueryEvaluator> {
    engine: SyncEngine<P, E>,
    connection: C,
    commands: mpsc::Receiver<Command>,
    stream: Option<StreamChannel>,
    retry_at: Option<time::Instant>,
}

impl<C, P, E> Driver<C, P, E>
where
    C: Connection,
    P: Persistence,
    E: QueryEvaluator,
{
    async fn run(mut self) {
        info!("sync client started");
        loop {
            self.maintain_stream();
            self.flush();

            let retry_at = self.retry_at;
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                event = next_event(&mut self.stream) => self.handle_event(event),
                _ = wait_until(retry_at) => {
                    self.retry_at = None;
                }
            }
        }
        self.engine.disconnect();
        info!("sync client stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Listen { target, reply } => {
                if reply.send(self.engine.listen(target)).is_err() {
                    trace!("caller dropped listen reply");
                }
            }
            Command::Unlisten { listener_id, reply } => {
                if reply.send(self.engine.unlisten(listener_id)).is_err() {
                    trace!(%listener_id, "caller dropped unlisten reply");
                }
            }
            Command::Submit { mutations, reply } => {
                if reply.send(self.engine.submit_mutation(mutations)).is_err() {
                    trace!("caller dropped submit reply");
                }
            }
            Command::Interrupt => self.engine.interrupt(),
            Command::Resume => {
                self.engine.resume();
                self.retry_at = None;
            }
            Command::Stats { reply } => {
                if reply.send(self.engine.stats()).is_err() {
                    trace!("caller dropped stats reply");
                }
            }
            Command::Shutdown => {}
        }
    }

    fn handle_event(&mut self, event: Option<StreamEvent>) {
        let event = event.unwrap_or_else(|| {
            StreamEvent::Closed(Some(StreamError::new(
                StatusCode::Unavailable,
                "stream dropped",
            )))
        });
        if let Some(delay) = self.engine.handle_stream_event(event, Instant::now()) {
            self.stream = None;
            self.schedule_retry(delay);
        }
    }

    /// Opens, keeps or drops the stream according to the engine's needs.
    fn maintain_stream(&mut self) {
        if self.engine.take_restart_request() {
            debug!("dropping stream for resync");
            self.stream = None;
            self.retry_at = None;
        }

        if !self.engine.should_connect() {
            if self.stream.take().is_some() {
                debug!("nothing to sync, closing stream");
                self.engine.disconnect();
            }
            return;
        }
        if self.stream.is_some() || self.retry_at.is_some() {
            return;
        }
        if !self.engine.begin_connect() {
            return;
        }

        match self.connection.open_stream() {
            Ok(channel) => self.stream = Some(channel),
            Err(err) => {
                warn!(error = %err, retryable = err.is_retryable(), "failed to open stream");
                let delay = self.engine.handle_stream_close(
                    Some(StreamError::new(StatusCode::Unavailable, err.to_string())),
                    Instant::now(),
                );
                self.schedule_retry(delay);
            }
        }
    }

    fn flush(&mut self) {
        let Some(channel) = &self.stream else {
            return;
        };
        for request in self.engine.take_outbound() {
            if channel.requests.send(request).is_err() {
                debug!("stream gone while writing");
                break;
            }
        }
    }

    fn schedule_retry(&mut self, delay: Duration) {
        debug!(delay_ms = delay.as_millis() as u64, "reconnect scheduled");
        self.retry_at = Some(time::Instant::now() + delay);
    }
}

async fn next_event(stream: &mut Option<StreamChannel>) -> Option<StreamEvent> {
    match stream {
        Some(channel) => channel.events.recv().await,
        None => std::future::pending().await,
    }
}

async fn wait_until(deadline: Option<time::Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
