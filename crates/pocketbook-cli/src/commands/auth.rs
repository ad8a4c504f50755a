//! Login and logout command handlers

use anyhow::{bail, Result};

use pocketbook_core::{Backend, IdentityProvider, SyncContext};

use crate::output::Output;

/// Request a login link, or complete a login with the link's token
pub async fn login(
    context: &SyncContext,
    email: Option<String>,
    token: Option<String>,
    refresh_token: Option<String>,
    output: &Output,
) -> Result<()> {
    if let Some(token) = token {
        let user_id = context
            .complete_login(&token, refresh_token.as_deref())
            .await?;
        output.success(&format!("Signed in as {}", user_id));
        return Ok(());
    }

    let Some(email) = email else {
        bail!("Pass --email to request a login link or --token to finish one");
    };

    if let Err(e) = context.identity().request_login_link(&email).await {
        bail!(e.user_message());
    }

    match context.config().backend() {
        Some(Backend::Hosted { .. }) => {
            output.success(&format!("Login link sent to {}", email.trim()));
            output.message(
                "Open the link, then run: pocketbook login --token <access_token> --refresh-token <refresh_token>",
            );
        }
        _ => {
            let user_id = context.require_identity()?;
            output.success(&format!("Signed in as {}", user_id));
            if !context.config().is_sync_configured() {
                output.warning("Cloud sync is disabled (not configured). Set remote_db or remote_url.");
            }
        }
    }

    Ok(())
}

/// Sign out of this device
pub async fn logout(context: &SyncContext, output: &Output) -> Result<()> {
    if context.identity().current_identity().is_none() {
        output.message("Not signed in.");
        return Ok(());
    }

    context.logout().await?;
    output.success("Signed out");
    Ok(())
}
