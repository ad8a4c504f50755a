//! Wiring from configuration
//!
//! `SyncContext` is the main entry point for hosts: it opens the local
//! store, picks the login provider and remote store for the configured
//! backend, and builds the sync engine around them.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::{debug, warn};

use crate::config::{Backend, Config};
use crate::error::{SyncError, SyncResult};
use crate::focus::EditMarkerFocus;
use crate::identity::{EmailLinkProvider, IdentityProvider, LocalIdentityProvider, UserId};
use crate::local::FileLocalStore;
use crate::remote::{RemoteStore, RestRemoteStore, SqliteRemoteStore};
use crate::session::{FileSessionStore, ReloadThrottle, SessionStore};
use crate::sync::{disabled_handle, spawn_sync_task, RuntimeOptions, SyncEngine, SyncHandle};

/// Everything a host needs to sync one device
pub struct SyncContext {
    config: Config,
    local: Arc<FileLocalStore>,
    identity: Arc<dyn IdentityProvider>,
    email_link: Option<Arc<EmailLinkProvider>>,
    session_store: Arc<FileSessionStore>,
    engine: Option<Arc<SyncEngine>>,
}

impl SyncContext {
    /// Open with the default configuration
    pub fn open() -> Result<Self> {
        let config = Config::load().context("Failed to load configuration")?;
        Self::open_with_config(config)
    }

    /// Open with a specific configuration
    pub fn open_with_config(config: Config) -> Result<Self> {
        let local = Arc::new(FileLocalStore::new(config.local_store_path()));
        let session_path = config.auth_session_path();

        let (identity, email_link, remote): (
            Arc<dyn IdentityProvider>,
            Option<Arc<EmailLinkProvider>>,
            Option<Arc<dyn RemoteStore>>,
        ) = match config.backend() {
            Some(Backend::Hosted { url, api_key }) => {
                let provider = Arc::new(EmailLinkProvider::new(
                    &url,
                    &api_key,
                    Some(session_path),
                ));
                let remote = RestRemoteStore::new(&url, &api_key).with_tokens(provider.clone());
                (provider.clone(), Some(provider), Some(Arc::new(remote)))
            }
            Some(Backend::SharedFile { path }) => {
                let remote = SqliteRemoteStore::open(&path)
                    .with_context(|| format!("Failed to open shared database {:?}", path))?;
                (
                    Arc::new(LocalIdentityProvider::with_session_file(session_path)),
                    None,
                    Some(Arc::new(remote)),
                )
            }
            None => {
                debug!("No remote backend configured, sync disabled");
                (
                    Arc::new(LocalIdentityProvider::with_session_file(session_path)),
                    None,
                    None,
                )
            }
        };

        let session_store = Arc::new(FileSessionStore::new(config.session_dir()));
        let engine = remote.map(|remote| {
            let throttle = ReloadThrottle::new(session_store.clone(), config.reload_cooldown());
            let focus = EditMarkerFocus::new(config.edit_marker_path());
            Arc::new(SyncEngine::new(local.clone(), remote, throttle).with_focus(Arc::new(focus)))
        });

        Ok(Self {
            config,
            local,
            identity,
            email_link,
            session_store,
            engine,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn local(&self) -> &Arc<FileLocalStore> {
        &self.local
    }

    pub fn identity(&self) -> &Arc<dyn IdentityProvider> {
        &self.identity
    }

    /// The sync engine, or `NotConfigured` without a backend
    pub fn engine(&self) -> SyncResult<&Arc<SyncEngine>> {
        self.engine.as_ref().ok_or(SyncError::NotConfigured)
    }

    /// The signed-in identity, required by one-shot operations
    pub fn require_identity(&self) -> SyncResult<UserId> {
        self.identity
            .current_identity()
            .ok_or(SyncError::NotLoggedIn)
    }

    /// Finish an email-link login with the tokens from the link
    pub async fn complete_login(&self, token: &str, refresh_token: Option<&str>) -> Result<UserId> {
        let Some(ref provider) = self.email_link else {
            bail!("Token login needs a hosted backend (set remote_url and remote_api_key)");
        };
        let user_id = provider.complete_login(token, refresh_token).await?;
        Ok(user_id)
    }

    /// Sign out and forget session-scoped state
    pub async fn logout(&self) -> SyncResult<()> {
        if let Some(engine) = &self.engine {
            engine.end_session();
        }
        self.identity.sign_out().await?;
        if let Err(e) = self.session_store.clear() {
            warn!("Failed to clear session storage: {}", e);
        }
        Ok(())
    }

    /// Start the background sync task for this device
    pub fn spawn(&self) -> SyncHandle {
        match &self.engine {
            Some(engine) => spawn_sync_task(
                engine.clone(),
                self.identity.subscribe(),
                RuntimeOptions::from_config(&self.config),
            ),
            None => disabled_handle(),
        }
    }

    /// Short name of the configured backend
    pub fn backend_label(&self) -> &'static str {
        match self.config.backend() {
            Some(Backend::Hosted { .. }) => "hosted",
            Some(Backend::SharedFile { .. }) => "shared-file",
            None => "none",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::WATCHLIST;
    use crate::local::LocalStore;
    use crate::sync::{BootstrapOutcome, PullOutcome, PushOutcome, SyncPhase};
    use tempfile::TempDir;

    fn config(temp_dir: &TempDir, shared: bool) -> Config {
        Config {
            data_dir: temp_dir.path().join("data"),
            remote_db: shared.then(|| temp_dir.path().join("shared.db")),
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_unconfigured_context_is_disabled() {
        let temp_dir = TempDir::new().unwrap();
        let context = SyncContext::open_with_config(config(&temp_dir, false)).unwrap();

        assert!(matches!(context.engine(), Err(SyncError::NotConfigured)));
        assert_eq!(context.backend_label(), "none");
        assert_eq!(context.spawn().phase(), SyncPhase::Disabled);
    }

    #[tokio::test]
    async fn test_token_login_needs_hosted_backend() {
        let temp_dir = TempDir::new().unwrap();
        let context = SyncContext::open_with_config(config(&temp_dir, true)).unwrap();

        assert!(context.complete_login("token", None).await.is_err());
    }

    #[tokio::test]
    async fn test_shared_file_devices_converge() {
        let temp_dir = TempDir::new().unwrap();
        let mut second = config(&temp_dir, true);
        second.data_dir = temp_dir.path().join("data-2");

        let a = SyncContext::open_with_config(config(&temp_dir, true)).unwrap();
        let b = SyncContext::open_with_config(second).unwrap();

        a.identity().request_login_link("Me@Example.com").await.unwrap();
        b.identity().request_login_link("me@example.com").await.unwrap();
        let user = a.require_identity().unwrap();
        assert_eq!(b.require_identity().unwrap(), user);

        a.local().set(WATCHLIST, "[\"AAPL\"]").unwrap();
        let outcome = a.engine().unwrap().bootstrap(&user, true).await.unwrap();
        assert_eq!(
            outcome,
            BootstrapOutcome::Ready {
                pull: PullOutcome::NoRemoteData,
                push: PushOutcome::Pushed,
                refresh_suggested: false,
            }
        );

        let outcome = b.engine().unwrap().bootstrap(&user, true).await.unwrap();
        assert_eq!(
            outcome,
            BootstrapOutcome::ReloadRequired {
                keys: vec![WATCHLIST.to_string()]
            }
        );
        assert_eq!(
            b.local().get(WATCHLIST).unwrap().as_deref(),
            Some("[\"AAPL\"]")
        );
    }

    #[tokio::test]
    async fn test_logout_clears_identity_and_session() {
        let temp_dir = TempDir::new().unwrap();
        let context = SyncContext::open_with_config(config(&temp_dir, true)).unwrap();

        context
            .identity()
            .request_login_link("me@example.com")
            .await
            .unwrap();
        let user = context.require_identity().unwrap();
        context.engine().unwrap().begin_session(user);

        context.logout().await.unwrap();
        assert!(matches!(
            context.require_identity(),
            Err(SyncError::NotLoggedIn)
        ));
        assert!(context.engine().unwrap().session().identity.is_none());
        assert!(!context.config().session_dir().exists());
    }

    #[tokio::test]
    async fn test_login_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let context = SyncContext::open_with_config(config(&temp_dir, true)).unwrap();
        context
            .identity()
            .request_login_link("me@example.com")
            .await
            .unwrap();
        drop(context);

        let reopened = SyncContext::open_with_config(config(&temp_dir, true)).unwrap();
        assert_eq!(
            reopened.require_identity().unwrap().as_str(),
            "me@example.com"
        );
    }
}
