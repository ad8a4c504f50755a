//! Status command handler

use anyhow::Result;

use pocketbook_core::keys::synced_keys;
use pocketbook_core::{IdentityProvider, LocalStore, SyncContext};

use crate::output::{Output, OutputFormat};

/// Show status information
pub fn show(context: &SyncContext, output: &Output) -> Result<()> {
    let config = context.config();
    let identity = context.identity().current_identity();
    let synced = context.local().snapshot(&synced_keys())?.len();

    match output.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "identity": identity.as_ref().map(|id| id.as_str()),
                    "backend": context.backend_label(),
                    "sync_configured": config.is_sync_configured(),
                    "pull_interval_secs": config.pull_interval().as_secs(),
                    "push_interval_secs": config.push_interval().as_secs(),
                    "reload_cooldown_secs": config.reload_cooldown_secs,
                    "storage": {
                        "data_dir": config.data_dir,
                        "local_store": config.local_store_path(),
                        "synced_keys_set": synced
                    }
                })
            );
        }
        OutputFormat::Quiet => {
            if let Some(ref id) = identity {
                println!("{}", id);
            }
        }
        OutputFormat::Human => {
            println!("Pocketbook Status");
            println!("=================");
            println!();
            println!("Account:");
            match identity {
                Some(ref id) => println!("  Signed in as: {}", id),
                None => println!("  Not signed in"),
            }
            println!();
            println!("Sync:");
            if config.is_sync_configured() {
                println!("  Backend: {}", context.backend_label());
                if let Some(ref url) = config.remote_url {
                    println!("  Server:  {}", url);
                }
                if let Some(ref path) = config.remote_db {
                    println!("  File:    {}", path.display());
                }
                println!(
                    "  Pull every {}s, push every {}s",
                    config.pull_interval().as_secs(),
                    config.push_interval().as_secs()
                );
            } else {
                println!("  Status: disabled (not configured)");
            }
            println!();
            println!("Storage:");
            println!("  Location:    {}", config.data_dir.display());
            println!("  Synced keys: {} of {}", synced, synced_keys().len());
        }
    }

    Ok(())
}
