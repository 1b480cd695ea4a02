//! The manager actor and its creation tasks.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{ManagerSettings, ManagerStats, Released};
use crate::cleaner::{cleanup_session, remove_output_dir, CleanupPolicy};
use crate::encode::EncoderCommand;
use crate::readiness::{wait_for_manifest, ReadinessError};
use crate::registry::SessionRegistry;
use crate::session::{
    current_timestamp_ms, public_url, ActiveStream, OutputPaths, SessionError, SessionId,
    SessionState, StreamSession, StreamTicket,
};
use crate::source::{SourceKey, SourceLocator};
use crate::supervisor::{spawn_supervised, ProcessEvent, SupervisedSession};

type ConnectReply = oneshot::Sender<Result<StreamTicket, SessionError>>;

pub(super) enum Command {
    Connect {
        locator: SourceLocator,
        reply: ConnectReply,
    },
    Disconnect {
        id: SessionId,
        reply: oneshot::Sender<Released>,
    },
    Stop {
        id: SessionId,
        reply: oneshot::Sender<bool>,
    },
    List {
        reply: oneshot::Sender<Vec<ActiveStream>>,
    },
    Stats {
        reply: oneshot::Sender<ManagerStats>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Connect { locator, .. } => write!(f, "Connect({})", locator.key()),
            Command::Disconnect { id, .. } => write!(f, "Disconnect({})", id),
            Command::Stop { id, .. } => write!(f, "Stop({})", id),
            Command::List { .. } => f.write_str("List"),
            Command::Stats { .. } => f.write_str("Stats"),
            Command::Shutdown { .. } => f.write_str("Shutdown"),
        }
    }
}

/// A creation in flight and everyone waiting on it.
struct Attempt {
    id: SessionId,
    waiters: Vec<ConnectReply>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Reported by a creation task when it finishes.
struct CreationOutcome {
    key: SourceKey,
    result: Result<StreamSession, SessionError>,
}

/// Shared inputs of every creation task.
struct CreationContext {
    settings: ManagerSettings,
    encoder: Arc<dyn EncoderCommand>,
    events: mpsc::UnboundedSender<ProcessEvent>,
}

pub(super) struct ManagerActor {
    context: Arc<CreationContext>,
    registry: SessionRegistry,
    in_flight: HashMap<SourceKey, Attempt>,
    stats: ManagerStats,
    cleanups: JoinSet<()>,
    shutdown: CancellationToken,
    outcomes_tx: mpsc::UnboundedSender<CreationOutcome>,
    outcomes_rx: mpsc::UnboundedReceiver<CreationOutcome>,
    events_rx: mpsc::UnboundedReceiver<ProcessEvent>,
}

impl ManagerActor {
    pub(super) fn new(settings: ManagerSettings, encoder: Arc<dyn EncoderCommand>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outcomes_tx, outcomes_rx) = mpsc::unbounded_channel();
        Self {
            context: Arc::new(CreationContext {
                settings,
                encoder,
                events: events_tx,
            }),
            registry: SessionRegistry::new(),
            in_flight: HashMap::new(),
            stats: ManagerStats::default(),
            cleanups: JoinSet::new(),
            shutdown: CancellationToken::new(),
            outcomes_tx,
            outcomes_rx,
            events_rx,
        }
    }

    /// Serve commands until shutdown is requested or every handle is dropped.
    pub(super) async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.shutdown_all().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        debug!("all manager handles dropped");
                        self.shutdown_all().await;
                        break;
                    }
                },
                Some(outcome) = self.outcomes_rx.recv() => self.on_creation_finished(outcome),
                Some(event) = self.events_rx.recv() => self.on_process_event(event),
                Some(joined) = self.cleanups.join_next(), if !self.cleanups.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "cleanup task failed");
                    }
                }
            }
        }
        info!("session manager stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { locator, reply } => self.on_connect(locator, reply),
            Command::Disconnect { id, reply } => {
                let _ = reply.send(self.on_disconnect(id));
            }
            Command::Stop { id, reply } => {
                let _ = reply.send(self.on_stop(id));
            }
            Command::List { reply } => {
                let _ = reply.send(self.registry.snapshot());
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.snapshot_stats());
            }
            // Intercepted by the run loop
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn on_connect(&mut self, locator: SourceLocator, reply: ConnectReply) {
        let key = locator.key().clone();

        if let Some(session) = self.registry.lookup_mut(&key) {
            if reply.send(Ok(session.ticket())).is_ok() {
                session.reference_count += 1;
                self.stats.coalesced_joins += 1;
                debug!(
                    session = %session.id,
                    source = %key,
                    references = session.reference_count,
                    "joined existing session"
                );
            }
            return;
        }

        if let Some(attempt) = self.in_flight.get_mut(&key) {
            attempt.waiters.push(reply);
            self.stats.coalesced_joins += 1;
            debug!(session = %attempt.id, source = %key, "joined creation in flight");
            return;
        }

        let id = SessionId::new();
        let cancel = self.shutdown.child_token();
        info!(session = %id, source = %key, "starting session");
        let task = tokio::spawn(run_creation(
            id,
            locator,
            self.context.clone(),
            cancel.clone(),
            self.outcomes_tx.clone(),
        ));
        self.in_flight.insert(
            key,
            Attempt {
                id,
                waiters: vec![reply],
                cancel,
                task,
            },
        );
    }

    fn on_creation_finished(&mut self, outcome: CreationOutcome) {
        let Some(attempt) = self.in_flight.remove(&outcome.key) else {
            // Abandoned attempt; nobody is waiting for this session
            if let Ok(session) = outcome.result {
                self.abandon(session);
            }
            return;
        };

        let mut session = match outcome.result {
            Ok(session) => session,
            Err(err) => {
                self.fail_waiters(attempt.waiters, &outcome.key, err);
                return;
            }
        };

        // The encoder may have died between readiness and this message
        if let Some(exit) = session.handle.exit_status() {
            session.transition(SessionState::Failed);
            self.teardown(session);
            self.fail_waiters(
                attempt.waiters,
                &outcome.key,
                SessionError::ExitedBeforeReady(exit),
            );
            return;
        }

        session.transition(SessionState::Ready);
        self.stats.sessions_started += 1;
        let ticket = session.ticket();
        let delivered = attempt
            .waiters
            .into_iter()
            .filter_map(|waiter| waiter.send(Ok(ticket.clone())).ok())
            .count() as u32;

        if delivered == 0 {
            info!(session = %session.id, "no caller left for new session, draining");
            session.transition(SessionState::Draining);
            self.teardown(session);
            return;
        }

        session.reference_count = delivered;
        info!(
            session = %session.id,
            source = %session.key(),
            references = delivered,
            "session ready"
        );
        if let Err((err, mut session)) = self.registry.insert(session) {
            error!(error = %err, "registry rejected new session");
            session.transition(SessionState::Draining);
            self.teardown(session);
        }
    }

    fn fail_waiters(&mut self, waiters: Vec<ConnectReply>, key: &SourceKey, err: SessionError) {
        self.stats.creation_failures += 1;
        warn!(source = %key, error = %err, waiters = waiters.len(), "session creation failed");
        for waiter in waiters {
            let _ = waiter.send(Err(err.clone()));
        }
    }

    fn on_disconnect(&mut self, id: SessionId) -> Released {
        let Some(key) = self.registry.lookup_by_id(&id).cloned() else {
            debug!(session = %id, "disconnect for unknown session ignored");
            return Released::Unknown;
        };
        let Some(session) = self.registry.lookup_mut(&key) else {
            return Released::Unknown;
        };

        session.reference_count = session.reference_count.saturating_sub(1);
        if session.reference_count > 0 {
            debug!(session = %id, references = session.reference_count, "reference released");
            return Released::Remaining(session.reference_count);
        }

        if let Some(mut session) = self.registry.remove(&key) {
            info!(session = %id, source = %key, "last reference released, draining");
            session.transition(SessionState::Draining);
            self.teardown(session);
        }
        Released::Drained
    }

    fn on_stop(&mut self, id: SessionId) -> bool {
        let Some(mut session) = self.registry.remove_by_id(&id) else {
            return false;
        };
        info!(
            session = %id,
            references = session.reference_count,
            "explicit stop, draining"
        );
        session.transition(SessionState::Draining);
        self.teardown(session);
        true
    }

    fn on_process_event(&mut self, event: ProcessEvent) {
        let registered = self
            .registry
            .lookup(&event.source)
            .is_some_and(|session| session.id == event.id);
        if !registered {
            // Sessions being created or already torn down handle their own exits
            debug!(
                session = %event.id,
                source = %event.source,
                exit = %event.exit,
                "exit of unregistered encoder"
            );
            return;
        }
        let Some(mut session) = self.registry.remove(&event.source) else {
            return;
        };

        self.stats.abnormal_exits += 1;
        if event.exit.is_success() {
            warn!(session = %event.id, source = %event.source, "encoder exited unexpectedly");
        } else {
            error!(
                session = %event.id,
                source = %event.source,
                output_dir = %event.output_dir.display(),
                exit = %event.exit,
                stop_requested = event.stop_requested,
                "encoder terminated abnormally"
            );
        }
        session.transition(SessionState::Failed);
        self.teardown(session);
    }

    /// Hand a session that has already left the registry to the cleaner.
    fn teardown(&mut self, session: StreamSession) {
        self.stats.teardowns += 1;
        self.cleanups
            .spawn(cleanup_session(session, self.context.settings.cleanup));
    }

    /// Tear down a session that finished creating after its attempt was dropped.
    fn abandon(&mut self, mut session: StreamSession) {
        session.transition(SessionState::Ready);
        session.transition(SessionState::Draining);
        self.teardown(session);
    }

    fn snapshot_stats(&self) -> ManagerStats {
        ManagerStats {
            active_sessions: self.registry.len(),
            pending_creations: self.in_flight.len(),
            ..self.stats
        }
    }

    async fn shutdown_all(&mut self) {
        info!(
            sessions = self.registry.len(),
            pending = self.in_flight.len(),
            "shutting down all sessions"
        );
        self.shutdown.cancel();

        let mut tasks = Vec::with_capacity(self.in_flight.len());
        for (_, attempt) in self.in_flight.drain() {
            attempt.cancel.cancel();
            for waiter in attempt.waiters {
                let _ = waiter.send(Err(SessionError::ShuttingDown));
            }
            tasks.push(attempt.task);
        }
        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "creation task failed");
            }
        }

        while let Ok(outcome) = self.outcomes_rx.try_recv() {
            if let Ok(session) = outcome.result {
                self.abandon(session);
            }
        }

        for mut session in self.registry.drain() {
            session.transition(SessionState::Draining);
            self.teardown(session);
        }

        while let Some(joined) = self.cleanups.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "cleanup task failed");
            }
        }
        info!(teardowns = self.stats.teardowns, "all sessions drained");
    }
}

async fn run_creation(
    id: SessionId,
    locator: SourceLocator,
    context: Arc<CreationContext>,
    cancel: CancellationToken,
    outcomes: mpsc::UnboundedSender<CreationOutcome>,
) {
    let key = locator.key().clone();
    let creation = AssertUnwindSafe(create_session(id, locator, &context, &cancel));
    let result = match creation.catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let reason = panic_reason(&*panic);
            error!(session = %id, source = %key, reason = %reason, "session creation panicked");
            // The unwound future dropped the encoder handle, which kills the process
            let settings = &context.settings;
            let output =
                OutputPaths::for_session(&settings.output_root, id, &settings.manifest_name);
            if let Err(e) = remove_output_dir(&output.dir).await {
                error!(session = %id, error = %e, "cleanup failure");
            }
            Err(SessionError::SpawnFailure(format!(
                "session creation panicked: {}",
                reason
            )))
        }
    };
    if let Err(rejected) = outcomes.send(CreationOutcome { key, result }) {
        // Actor is gone; the dropped handle kills any encoder
        if let Ok(session) = rejected.0.result {
            let _ = remove_output_dir(&session.output.dir).await;
        }
    }
}

fn panic_reason(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Bring up one session: output directory, encoder, first playlist.
///
/// On any failure the encoder is stopped and the directory removed before
/// returning, so a failed attempt leaves nothing behind.
async fn create_session(
    id: SessionId,
    locator: SourceLocator,
    context: &CreationContext,
    cancel: &CancellationToken,
) -> Result<StreamSession, SessionError> {
    let settings = &context.settings;
    let output = OutputPaths::for_session(&settings.output_root, id, &settings.manifest_name);

    if let Err(e) = tokio::fs::create_dir_all(&output.dir).await {
        return Err(SessionError::SpawnFailure(format!(
            "cannot create {}: {}",
            output.dir.display(),
            e
        )));
    }

    let command = context.encoder.build(&locator, &output);
    let supervised = SupervisedSession {
        id,
        source: locator.key().clone(),
        output_dir: output.dir.clone(),
    };
    let handle = match spawn_supervised(
        command,
        supervised,
        settings.stop_timeout,
        context.events.clone(),
    ) {
        Ok(handle) => handle,
        Err(e) => {
            let _ = remove_output_dir(&output.dir).await;
            return Err(SessionError::SpawnFailure(e.to_string()));
        }
    };

    let mut session = StreamSession {
        id,
        public_url: public_url(&settings.public_base_url, id, &settings.manifest_name),
        source: locator,
        output,
        handle,
        reference_count: 0,
        state: SessionState::Pending,
        created_at: current_timestamp_ms(),
    };

    let ready = tokio::select! {
        ready = wait_for_manifest(&session.output.manifest, settings.readiness, cancel) => {
            ready.map_err(|e| match e {
                ReadinessError::Timeout(after) => SessionError::ReadinessTimeout(after),
                ReadinessError::Cancelled => SessionError::ShuttingDown,
            })
        }
        exit = session.handle.wait_exit() => Err(SessionError::ExitedBeforeReady(exit)),
    };

    match ready {
        Ok(()) => Ok(session),
        Err(err) => {
            debug!(session = %id, error = %err, "abandoning failed session");
            session.transition(SessionState::Failed);
            // Never served, so no grace period for readers
            let policy = CleanupPolicy {
                grace: Duration::ZERO,
                ..settings.cleanup
            };
            cleanup_session(session, policy).await;
            Err(err)
        }
    }
}
