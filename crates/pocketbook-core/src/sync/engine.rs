//! Pull / push between the local store and the remote record
//!
//! Conflict policy is last-writer-wins on whole snapshots: a pull makes the
//! remote authoritative for every key it carries, a push replaces the
//! remote record with the local snapshot. Nothing is ever deleted; a key
//! missing on one side means "unknown".

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::events::ChangeBus;
use crate::focus::{InputFocus, NoFocus};
use crate::identity::UserId;
use crate::keys::synced_keys;
use crate::local::LocalStore;
use crate::payload::SyncedPayload;
use crate::remote::RemoteStore;
use crate::session::{ReloadDecision, ReloadThrottle, SyncSession};

/// Result of a pull
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullOutcome {
    /// Nothing stored remotely for this identity yet
    NoRemoteData,
    /// Local store already matches every remote key
    UpToDate,
    /// These local keys were overwritten with remote values
    Merged { keys: Vec<String> },
}

/// Why a push did not run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Another push is still outstanding
    InFlight,
    /// The user is typing into a field
    Typing,
    /// No pull has succeeded in this session yet
    NoBaseline,
}

/// Result of a push
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Same content as the last push; no request sent
    Unchanged,
    /// Remote record replaced
    Pushed,
    /// Dropped without touching the network
    Skipped(SkipReason),
}

/// Result of establishing an identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapOutcome {
    /// Local data was replaced; dependent state must reload before continuing
    ReloadRequired { keys: Vec<String> },
    /// Baseline established, steady state can begin
    Ready {
        pull: PullOutcome,
        push: PushOutcome,
        /// Data changed but the reload was throttled
        refresh_suggested: bool,
    },
}

/// Sync engine for one device
pub struct SyncEngine {
    local: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteStore>,
    focus: Arc<dyn InputFocus>,
    throttle: ReloadThrottle,
    bus: ChangeBus,
    keys: Vec<String>,
    session: Mutex<SyncSession>,
    /// Bumped on every login/logout so late results of old sessions are dropped
    epoch: AtomicU64,
}

/// Clears the push-in-flight flag when the push finishes or is cancelled
struct PushGuard<'a> {
    engine: &'a SyncEngine,
    epoch: u64,
}

impl Drop for PushGuard<'_> {
    fn drop(&mut self) {
        if self.engine.is_current(self.epoch) {
            self.engine.lock_session().push_in_flight = false;
        }
    }
}

impl SyncEngine {
    pub fn new(
        local: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteStore>,
        throttle: ReloadThrottle,
    ) -> Self {
        Self {
            local,
            remote,
            focus: Arc::new(NoFocus),
            throttle,
            bus: ChangeBus::new(),
            keys: synced_keys(),
            session: Mutex::new(SyncSession::default()),
            epoch: AtomicU64::new(0),
        }
    }

    /// Use `focus` to hold back pushes while the user types
    pub fn with_focus(mut self, focus: Arc<dyn InputFocus>) -> Self {
        self.focus = focus;
        self
    }

    pub fn local(&self) -> &Arc<dyn LocalStore> {
        &self.local
    }

    pub fn bus(&self) -> &ChangeBus {
        &self.bus
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn throttle(&self) -> &ReloadThrottle {
        &self.throttle
    }

    /// Copy of the current session state
    pub fn session(&self) -> SyncSession {
        self.lock_session().clone()
    }

    // ==================== Session lifecycle ====================

    /// Start (or keep) a session for `identity`
    ///
    /// Switching identity discards everything learned about the previous one.
    pub fn begin_session(&self, identity: UserId) {
        let mut session = self.lock_session();
        if session.identity.as_ref() == Some(&identity) {
            return;
        }
        self.epoch.fetch_add(1, Ordering::SeqCst);
        debug!("Sync session started for {}", identity);
        *session = SyncSession::for_identity(identity);
    }

    /// Tear the session down (logout)
    pub fn end_session(&self) {
        let mut session = self.lock_session();
        if session.identity.is_none() {
            return;
        }
        self.epoch.fetch_add(1, Ordering::SeqCst);
        session.clear();
        debug!("Sync session ended");
    }

    // ==================== Operations ====================

    /// Bring remote changes into the local store
    pub async fn pull(&self, identity: &UserId) -> SyncResult<PullOutcome> {
        let epoch = self.active_epoch(identity)?;

        let record = self.remote.fetch_record(identity).await?;
        if !self.is_current(epoch) {
            return Err(SyncError::NotLoggedIn);
        }

        let Some(record) = record else {
            self.mark_baseline(epoch);
            debug!("No remote data for {}", identity);
            return Ok(PullOutcome::NoRemoteData);
        };

        let remote = record.payload.restricted_to(&self.keys);
        let mut changed = Vec::new();
        for (key, value) in remote.iter() {
            if self.local.get(key)?.as_deref() != Some(value) {
                changed.push(key.to_string());
            }
        }

        if changed.is_empty() {
            self.mark_baseline(epoch);
            debug!("Local store up to date with remote ({})", record.updated_at);
            return Ok(PullOutcome::UpToDate);
        }

        for key in &changed {
            if let Some(value) = remote.get(key) {
                self.local.set(key, value)?;
            }
        }
        self.mark_baseline(epoch);

        for key in &changed {
            self.bus.publish(key.clone());
        }
        info!(
            "Merged {} key(s) from remote ({}): {}",
            changed.len(),
            record.updated_at,
            changed.join(", ")
        );

        Ok(PullOutcome::Merged { keys: changed })
    }

    /// Replace the remote record with `payload`
    ///
    /// Dropped when another push is in flight; a no-op when the payload
    /// matches the last one pushed.
    pub async fn push(&self, identity: &UserId, payload: SyncedPayload) -> SyncResult<PushOutcome> {
        let epoch = self.active_epoch(identity)?;
        let payload = payload.restricted_to(&self.keys);
        let digest = payload.digest();

        let _guard = {
            let mut session = self.lock_session();
            if session.push_in_flight {
                debug!("Push dropped, another push is in flight");
                return Ok(PushOutcome::Skipped(SkipReason::InFlight));
            }
            if session.last_pushed_digest.as_deref() == Some(digest.as_str()) {
                return Ok(PushOutcome::Unchanged);
            }
            session.push_in_flight = true;
            PushGuard {
                engine: self,
                epoch,
            }
        };

        self.remote
            .upsert_record(identity, &payload, Utc::now())
            .await?;

        if self.is_current(epoch) {
            self.lock_session().last_pushed_digest = Some(digest);
        }
        info!("Pushed {} key(s) for {}", payload.len(), identity);
        Ok(PushOutcome::Pushed)
    }

    /// Push the current local snapshot
    pub async fn push_snapshot(&self, identity: &UserId) -> SyncResult<PushOutcome> {
        let payload = self.local.snapshot(&self.keys)?;
        self.push(identity, payload).await
    }

    /// Scheduled push: skipped while busy, typing, or before the first pull
    pub async fn push_tick(&self, identity: &UserId) -> SyncResult<PushOutcome> {
        {
            let session = self.lock_session();
            if session.identity.as_ref() != Some(identity) {
                return Err(SyncError::NotLoggedIn);
            }
            if session.push_in_flight {
                return Ok(PushOutcome::Skipped(SkipReason::InFlight));
            }
            if !session.baseline_established {
                return Ok(PushOutcome::Skipped(SkipReason::NoBaseline));
            }
        }

        if self.focus.is_text_entry_focused() {
            debug!("Push tick skipped, text entry focused");
            return Ok(PushOutcome::Skipped(SkipReason::Typing));
        }

        self.push_snapshot(identity).await
    }

    /// Apply the reload throttle to a pull that changed local data
    pub fn reload_decision(&self) -> ReloadDecision {
        self.throttle.decide(Utc::now())
    }

    /// Establish the baseline for a freshly logged-in identity
    ///
    /// `allow_reload` is false when this bootstrap already follows a
    /// reload, so a bootstrap can restart itself at most once.
    pub async fn bootstrap(
        &self,
        identity: &UserId,
        allow_reload: bool,
    ) -> SyncResult<BootstrapOutcome> {
        self.begin_session(identity.clone());

        let pull = self.pull(identity).await?;

        let mut refresh_suggested = false;
        if let PullOutcome::Merged { ref keys } = pull {
            let decision = if allow_reload {
                self.reload_decision()
            } else {
                ReloadDecision::Notify
            };
            match decision {
                ReloadDecision::Reload => {
                    return Ok(BootstrapOutcome::ReloadRequired { keys: keys.clone() })
                }
                ReloadDecision::Notify => refresh_suggested = true,
            }
        }

        let push = self.push_snapshot(identity).await.map_err(|e| {
            warn!("Initial push failed: {}", e);
            e
        })?;

        Ok(BootstrapOutcome::Ready {
            pull,
            push,
            refresh_suggested,
        })
    }

    // ==================== Internals ====================

    fn lock_session(&self) -> MutexGuard<'_, SyncSession> {
        self.session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn active_epoch(&self, identity: &UserId) -> SyncResult<u64> {
        let session = self.lock_session();
        if session.identity.as_ref() != Some(identity) {
            return Err(SyncError::NotLoggedIn);
        }
        Ok(self.epoch.load(Ordering::SeqCst))
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) == epoch
    }

    fn mark_baseline(&self, epoch: u64) {
        if self.is_current(epoch) {
            self.lock_session().baseline_established = true;
        }
    }
}
