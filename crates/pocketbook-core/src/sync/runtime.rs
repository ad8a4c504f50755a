//! Background sync task
//!
//! Drives a [`SyncEngine`] from identity changes and two independent
//! tickers. Each identity goes through `Bootstrapping` then `Steady`;
//! logout or an identity switch aborts in-flight work and clears the
//! session before anything else runs.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, info_span, warn, Instrument};

use super::engine::{BootstrapOutcome, PullOutcome, PushOutcome, SyncEngine};
use crate::config::Config;
use crate::error::SyncError;
use crate::identity::UserId;
use crate::session::ReloadDecision;

/// Commands sent to the sync task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncCommand {
    /// Pull immediately instead of waiting for the next tick
    PullNow,
    /// Run a push tick immediately
    PushNow,
    /// Stop the sync task
    Shutdown,
}

/// Where the sync task is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    /// No backend configured
    Disabled,
    /// Waiting for a login
    LoggedOut,
    /// Establishing the baseline for a new identity
    Bootstrapping,
    /// Tickers running
    Steady,
}

/// Events emitted by the sync task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    PhaseChanged(SyncPhase),
    Pulled(PullOutcome),
    Pushed(PushOutcome),
    /// Local data changed; a reload follows after the delay
    ReloadScheduled { after: Duration },
    /// Re-initialize everything derived from the local store now
    Reload,
    /// Local data changed but the reload was throttled
    RefreshSuggested,
    /// Transient failure, retried on the next tick
    Error(String),
}

/// Handle to control the sync task
pub struct SyncHandle {
    /// Send commands to the sync task
    pub command_tx: mpsc::Sender<SyncCommand>,
    /// Receive events from the sync task
    pub event_rx: mpsc::UnboundedReceiver<SyncEvent>,
    /// Watch the current phase
    pub status_rx: watch::Receiver<SyncPhase>,
}

impl SyncHandle {
    pub fn phase(&self) -> SyncPhase {
        *self.status_rx.borrow()
    }

    /// Ask the task to stop; a task that already exited is not an error
    pub async fn shutdown(&self) {
        let _ = self.command_tx.send(SyncCommand::Shutdown).await;
    }
}

/// Timing of the sync task
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub pull_interval: Duration,
    pub push_interval: Duration,
    /// Delay between `ReloadScheduled` and `Reload`
    pub reload_delay: Duration,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            pull_interval: Duration::from_secs(60),
            push_interval: Duration::from_secs(20),
            reload_delay: Duration::from_millis(1500),
        }
    }
}

impl RuntimeOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            pull_interval: config.pull_interval(),
            push_interval: config.push_interval(),
            reload_delay: config.reload_delay(),
        }
    }
}

/// Spawn the sync task
///
/// The task follows `identity_rx`: `Some` starts (or switches) a session,
/// `None` logs out. It stops on `SyncCommand::Shutdown`, when the handle's
/// command sender is dropped, or when the identity sender goes away.
pub fn spawn_sync_task(
    engine: Arc<SyncEngine>,
    identity_rx: watch::Receiver<Option<UserId>>,
    options: RuntimeOptions,
) -> SyncHandle {
    let (command_tx, command_rx) = mpsc::channel(16);
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (status_tx, status_rx) = watch::channel(SyncPhase::LoggedOut);

    let device_id = format!("device-{}", &uuid::Uuid::new_v4().to_string()[..8]);
    let span = info_span!("sync", device = %device_id);

    let task = SyncTask {
        engine,
        options,
        identity_rx,
        command_rx,
        event_tx,
        status_tx,
    };
    tokio::spawn(task.run().instrument(span));

    SyncHandle {
        command_tx,
        event_rx,
        status_rx,
    }
}

/// Handle for a host without a configured backend
///
/// Reports `SyncPhase::Disabled` and answers every command with a
/// "not configured" error event.
pub fn disabled_handle() -> SyncHandle {
    let (command_tx, mut command_rx) = mpsc::channel(16);
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (status_tx, status_rx) = watch::channel(SyncPhase::Disabled);

    tokio::spawn(async move {
        let _status_tx = status_tx;
        while let Some(cmd) = command_rx.recv().await {
            if cmd == SyncCommand::Shutdown {
                break;
            }
            let _ = event_tx.send(SyncEvent::Error(SyncError::NotConfigured.user_message()));
        }
    });

    SyncHandle {
        command_tx,
        event_rx,
        status_rx,
    }
}

/// Why the task left the current identity
enum Exit {
    Shutdown,
    IdentityChanged(Option<UserId>),
}

struct SyncTask {
    engine: Arc<SyncEngine>,
    options: RuntimeOptions,
    identity_rx: watch::Receiver<Option<UserId>>,
    command_rx: mpsc::Receiver<SyncCommand>,
    event_tx: mpsc::UnboundedSender<SyncEvent>,
    status_tx: watch::Sender<SyncPhase>,
}

impl SyncTask {
    async fn run(mut self) {
        let mut current = self.identity_rx.borrow_and_update().clone();

        loop {
            let exit = match current.take() {
                Some(identity) => {
                    info!("Sync started for {}", identity);
                    let exit = self.run_identity(&identity).await;
                    self.engine.end_session();
                    exit
                }
                None => {
                    self.set_phase(SyncPhase::LoggedOut);
                    self.wait_for_login().await
                }
            };

            match exit {
                Exit::Shutdown => break,
                Exit::IdentityChanged(next) => current = next,
            }
        }

        self.set_phase(SyncPhase::LoggedOut);
        debug!("Sync task stopped");
    }

    async fn run_identity(&mut self, identity: &UserId) -> Exit {
        if let Some(exit) = self.bootstrap(identity).await {
            return exit;
        }
        self.steady(identity).await
    }

    /// Returns `Some` when interrupted before steady state
    async fn bootstrap(&mut self, identity: &UserId) -> Option<Exit> {
        self.set_phase(SyncPhase::Bootstrapping);
        let mut allow_reload = true;

        loop {
            let engine = self.engine.clone();
            let result = tokio::select! {
                result = engine.bootstrap(identity, allow_reload) => result,
                exit = interrupted(&mut self.identity_rx, &mut self.command_rx, identity) => {
                    return Some(exit);
                }
            };

            match result {
                Ok(BootstrapOutcome::ReloadRequired { keys }) => {
                    info!("Bootstrap merged {} key(s), reloading", keys.len());
                    self.emit(SyncEvent::Pulled(PullOutcome::Merged { keys }));

                    let after = self.options.reload_delay;
                    self.emit(SyncEvent::ReloadScheduled { after });
                    tokio::select! {
                        _ = tokio::time::sleep(after) => {}
                        exit = interrupted(&mut self.identity_rx, &mut self.command_rx, identity) => {
                            return Some(exit);
                        }
                    }
                    self.emit(SyncEvent::Reload);
                    allow_reload = false;
                }
                Ok(BootstrapOutcome::Ready {
                    pull,
                    push,
                    refresh_suggested,
                }) => {
                    self.emit(SyncEvent::Pulled(pull));
                    if refresh_suggested {
                        self.emit(SyncEvent::RefreshSuggested);
                    }
                    self.emit(SyncEvent::Pushed(push));
                    return None;
                }
                Err(e) => {
                    // Steady state still starts; pushes wait for a good pull
                    warn!("Bootstrap failed: {}", e);
                    self.emit(SyncEvent::Error(e.user_message()));
                    return None;
                }
            }
        }
    }

    async fn steady(&mut self, identity: &UserId) -> Exit {
        self.set_phase(SyncPhase::Steady);

        let start = Instant::now();
        let mut pull_ticker = ticker(start, self.options.pull_interval);
        let mut push_ticker = ticker(start, self.options.push_interval);
        let mut pull_task: Option<JoinHandle<()>> = None;
        let mut push_task: Option<JoinHandle<()>> = None;

        let exit = loop {
            tokio::select! {
                _ = pull_ticker.tick() => {
                    self.start_pull(identity, &mut pull_task);
                }
                _ = push_ticker.tick() => {
                    self.start_push(identity, &mut push_task);
                }
                changed = self.identity_rx.changed() => {
                    if changed.is_err() {
                        break Exit::Shutdown;
                    }
                    let next = self.identity_rx.borrow_and_update().clone();
                    if next.as_ref() != Some(identity) {
                        break Exit::IdentityChanged(next);
                    }
                }
                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(SyncCommand::PullNow) => self.start_pull(identity, &mut pull_task),
                        Some(SyncCommand::PushNow) => self.start_push(identity, &mut push_task),
                        Some(SyncCommand::Shutdown) | None => break Exit::Shutdown,
                    }
                }
            }
        };

        for task in [pull_task, push_task].into_iter().flatten() {
            task.abort();
        }
        exit
    }

    async fn wait_for_login(&mut self) -> Exit {
        loop {
            tokio::select! {
                changed = self.identity_rx.changed() => {
                    if changed.is_err() {
                        return Exit::Shutdown;
                    }
                    let next = self.identity_rx.borrow_and_update().clone();
                    if next.is_some() {
                        return Exit::IdentityChanged(next);
                    }
                }
                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(SyncCommand::Shutdown) | None => return Exit::Shutdown,
                        Some(cmd) => {
                            debug!(?cmd, "Command ignored while logged out");
                            self.emit(SyncEvent::Error(SyncError::NotLoggedIn.user_message()));
                        }
                    }
                }
            }
        }
    }

    fn start_pull(&self, identity: &UserId, slot: &mut Option<JoinHandle<()>>) {
        if is_running(slot) {
            debug!("Pull still running, tick skipped");
            return;
        }
        let engine = self.engine.clone();
        let events = self.event_tx.clone();
        let identity = identity.clone();
        let reload_delay = self.options.reload_delay;

        *slot = Some(tokio::spawn(
            async move { pull_once(&engine, &identity, &events, reload_delay).await }
                .in_current_span(),
        ));
    }

    fn start_push(&self, identity: &UserId, slot: &mut Option<JoinHandle<()>>) {
        if is_running(slot) {
            debug!("Push still running, tick skipped");
            return;
        }
        let engine = self.engine.clone();
        let events = self.event_tx.clone();
        let identity = identity.clone();

        *slot = Some(tokio::spawn(
            async move { push_once(&engine, &identity, &events).await }.in_current_span(),
        ));
    }

    fn emit(&self, event: SyncEvent) {
        // Nobody listening is fine
        let _ = self.event_tx.send(event);
    }

    fn set_phase(&self, phase: SyncPhase) {
        let changed = self.status_tx.send_if_modified(|current| {
            if *current == phase {
                false
            } else {
                *current = phase;
                true
            }
        });
        if changed {
            debug!(?phase, "Sync phase changed");
            self.emit(SyncEvent::PhaseChanged(phase));
        }
    }
}

/// Resolves once the current identity's session must end
///
/// Pull and push requests are dropped; bootstrap already does both.
async fn interrupted(
    identity_rx: &mut watch::Receiver<Option<UserId>>,
    command_rx: &mut mpsc::Receiver<SyncCommand>,
    identity: &UserId,
) -> Exit {
    loop {
        tokio::select! {
            changed = identity_rx.changed() => {
                if changed.is_err() {
                    return Exit::Shutdown;
                }
                let next = identity_rx.borrow_and_update().clone();
                if next.as_ref() != Some(identity) {
                    return Exit::IdentityChanged(next);
                }
            }
            cmd = command_rx.recv() => {
                match cmd {
                    Some(SyncCommand::Shutdown) | None => return Exit::Shutdown,
                    Some(cmd) => debug!(?cmd, "Command ignored during bootstrap"),
                }
            }
        }
    }
}

async fn pull_once(
    engine: &SyncEngine,
    identity: &UserId,
    events: &mpsc::UnboundedSender<SyncEvent>,
    reload_delay: Duration,
) {
    let outcome = match engine.pull(identity).await {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!("Pull failed: {}", e);
            let _ = events.send(SyncEvent::Error(e.user_message()));
            return;
        }
    };

    let merged = matches!(outcome, PullOutcome::Merged { .. });
    let _ = events.send(SyncEvent::Pulled(outcome));
    if !merged {
        return;
    }

    match engine.reload_decision() {
        ReloadDecision::Reload => {
            let _ = events.send(SyncEvent::ReloadScheduled {
                after: reload_delay,
            });
            tokio::time::sleep(reload_delay).await;
            let _ = events.send(SyncEvent::Reload);
        }
        ReloadDecision::Notify => {
            let _ = events.send(SyncEvent::RefreshSuggested);
        }
    }
}

async fn push_once(engine: &SyncEngine, identity: &UserId, events: &mpsc::UnboundedSender<SyncEvent>) {
    match engine.push_tick(identity).await {
        Ok(outcome) => {
            if let PushOutcome::Skipped(reason) = outcome {
                debug!(?reason, "Push tick skipped");
            }
            let _ = events.send(SyncEvent::Pushed(outcome));
        }
        Err(e) => {
            warn!("Push failed: {}", e);
            let _ = events.send(SyncEvent::Error(e.user_message()));
        }
    }
}

fn ticker(start: Instant, period: Duration) -> Interval {
    let mut ticker = interval_at(start + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

fn is_running(slot: &Option<JoinHandle<()>>) -> bool {
    slot.as_ref().is_some_and(|task| !task.is_finished())
}
