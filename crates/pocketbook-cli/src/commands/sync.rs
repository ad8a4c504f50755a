//! Sync command handlers

use std::sync::Arc;

use anyhow::Result;

use pocketbook_core::sync::{SkipReason, SyncCommand};
use pocketbook_core::{
    BootstrapOutcome, IdentityProvider, PullOutcome, PushOutcome, SyncContext,
    SyncEngine, SyncError, SyncEvent, SyncPhase, UserId,
};

use crate::output::{Output, OutputFormat};

/// Engine and identity for a one-shot operation, or `None` when sync is off
fn start_session(context: &SyncContext, output: &Output) -> Result<Option<(Arc<SyncEngine>, UserId)>> {
    let engine = match context.engine() {
        Ok(engine) => engine.clone(),
        Err(e @ SyncError::NotConfigured) => {
            output.warning(&e.user_message());
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };
    let identity = context.require_identity()?;
    engine.begin_session(identity.clone());
    Ok(Some((engine, identity)))
}

/// Pull the remote snapshot into the local store
pub async fn pull(context: &SyncContext, output: &Output) -> Result<()> {
    let Some((engine, identity)) = start_session(context, output)? else {
        return Ok(());
    };

    let outcome = engine.pull(&identity).await?;
    report_pull(&outcome, output);

    // A one-shot pull reloads nothing, so the reload window is left alone
    if matches!(outcome, PullOutcome::Merged { .. }) {
        output.message("New data synced. Please refresh.");
    }
    Ok(())
}

/// Push the local snapshot, replacing the remote record
pub async fn push(context: &SyncContext, output: &Output) -> Result<()> {
    let Some((engine, identity)) = start_session(context, output)? else {
        return Ok(());
    };

    let outcome = engine.push_snapshot(&identity).await?;
    report_push(&outcome, output);
    Ok(())
}

/// Pull, then push: the same pass a fresh login runs
pub async fn sync(context: &SyncContext, output: &Output) -> Result<()> {
    let Some((engine, identity)) = start_session(context, output)? else {
        return Ok(());
    };

    match engine.bootstrap(&identity, true).await? {
        BootstrapOutcome::ReloadRequired { keys } => {
            report_pull(&PullOutcome::Merged { keys }, output);
            // Nothing depends on the merged keys here, so continue straight away
            match engine.bootstrap(&identity, false).await? {
                BootstrapOutcome::Ready { push, .. } => report_push(&push, output),
                BootstrapOutcome::ReloadRequired { .. } => {}
            }
        }
        BootstrapOutcome::Ready {
            pull,
            push,
            refresh_suggested,
        } => {
            report_pull(&pull, output);
            if refresh_suggested {
                output.message("New data synced. Please refresh.");
            }
            report_push(&push, output);
        }
    }
    Ok(())
}

/// Sync in the background until Ctrl-C
pub async fn run(context: &SyncContext, output: &Output) -> Result<()> {
    let mut handle = context.spawn();
    if handle.phase() == SyncPhase::Disabled {
        output.warning(&SyncError::NotConfigured.user_message());
        return Ok(());
    }
    if context.identity().current_identity().is_none() {
        handle.shutdown().await;
        return Err(SyncError::NotLoggedIn.into());
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                output.message("Stopping sync...");
                let _ = handle.command_tx.send(SyncCommand::Shutdown).await;
                break;
            }
            event = handle.event_rx.recv() => {
                match event {
                    Some(event) => report_event(&event, output),
                    None => break,
                }
            }
        }
    }

    // Drain the last events (final phase change)
    while let Some(event) = handle.event_rx.recv().await {
        report_event(&event, output);
    }
    Ok(())
}

fn report_event(event: &SyncEvent, output: &Output) {
    match event {
        SyncEvent::PhaseChanged(phase) => {
            let label = match phase {
                SyncPhase::Disabled => "disabled",
                SyncPhase::LoggedOut => "logged out",
                SyncPhase::Bootstrapping => "connecting",
                SyncPhase::Steady => "syncing",
            };
            output.message(&format!("Sync: {}", label));
        }
        SyncEvent::Pulled(outcome) => {
            if matches!(outcome, PullOutcome::Merged { .. }) {
                report_pull(outcome, output);
            }
        }
        SyncEvent::Pushed(outcome) => {
            if *outcome == PushOutcome::Pushed {
                report_push(outcome, output);
            }
        }
        SyncEvent::ReloadScheduled { after } => {
            output.message(&format!("Reloading in {} ms...", after.as_millis()));
        }
        SyncEvent::Reload => output.message("Reloading local data"),
        SyncEvent::RefreshSuggested => output.message("New data synced. Please refresh."),
        SyncEvent::Error(message) => output.warning(message),
    }
}

fn report_pull(outcome: &PullOutcome, output: &Output) {
    match output.format {
        OutputFormat::Json => {
            let json = match outcome {
                PullOutcome::NoRemoteData => serde_json::json!({"pull": "no_remote_data"}),
                PullOutcome::UpToDate => serde_json::json!({"pull": "up_to_date"}),
                PullOutcome::Merged { keys } => {
                    serde_json::json!({"pull": "merged", "keys": keys})
                }
            };
            output.json(&json);
        }
        OutputFormat::Quiet => {
            if let PullOutcome::Merged { keys } = outcome {
                for key in keys {
                    println!("{}", key);
                }
            }
        }
        OutputFormat::Human => match outcome {
            PullOutcome::NoRemoteData => output.message("Nothing stored remotely yet"),
            PullOutcome::UpToDate => output.success("Already up to date"),
            PullOutcome::Merged { keys } => {
                output.success(&format!("Pulled {} key(s): {}", keys.len(), keys.join(", ")))
            }
        },
    }
}

fn report_push(outcome: &PushOutcome, output: &Output) {
    let (status, text) = match outcome {
        PushOutcome::Pushed => ("pushed", "Pushed local data"),
        PushOutcome::Unchanged => ("unchanged", "Nothing new to push"),
        PushOutcome::Skipped(SkipReason::InFlight) => ("skipped", "Push skipped (another push running)"),
        PushOutcome::Skipped(SkipReason::Typing) => ("skipped", "Push skipped (editing in progress)"),
        PushOutcome::Skipped(SkipReason::NoBaseline) => ("skipped", "Push skipped (pull first)"),
    };

    match output.format {
        OutputFormat::Json => output.json(&serde_json::json!({"push": status})),
        OutputFormat::Quiet => {}
        OutputFormat::Human => match outcome {
            PushOutcome::Pushed => output.success(text),
            _ => output.message(text),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pocketbook_core::keys::WATCHLIST;
    use pocketbook_core::{Config, LocalStore, ReloadDecision};
    use tempfile::TempDir;

    fn open_device(temp_dir: &TempDir, name: &str) -> SyncContext {
        let config = Config {
            data_dir: temp_dir.path().join(name),
            remote_db: Some(temp_dir.path().join("shared.db")),
            ..Config::default()
        };
        SyncContext::open_with_config(config).unwrap()
    }

    #[tokio::test]
    async fn test_pull_leaves_reload_window_unused() {
        let temp_dir = TempDir::new().unwrap();
        let output = Output::new(OutputFormat::Quiet);
        let laptop = open_device(&temp_dir, "laptop");
        let phone = open_device(&temp_dir, "phone");
        for device in [&laptop, &phone] {
            device
                .identity()
                .request_login_link("me@example.com")
                .await
                .unwrap();
        }

        laptop.local().set(WATCHLIST, "[\"AAPL\"]").unwrap();
        push(&laptop, &output).await.unwrap();
        pull(&phone, &output).await.unwrap();

        assert_eq!(
            phone.local().get(WATCHLIST).unwrap().as_deref(),
            Some("[\"AAPL\"]")
        );
        assert_eq!(
            phone.engine().unwrap().reload_decision(),
            ReloadDecision::Reload
        );
    }
}
