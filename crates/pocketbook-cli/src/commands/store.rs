//! Local store command handlers
//!
//! Stand-ins for the app's own editing: read and write local store keys
//! directly. Scheduled pushes pick the changes up.

use anyhow::{Context, Result};

use pocketbook_core::keys::{is_synced, synced_keys, SYNCED_KEYS};
use pocketbook_core::{LocalStore, SyncContext};

use crate::output::{truncate, Output, OutputFormat};

/// Print one local store value
pub fn get(context: &SyncContext, key: String, output: &Output) -> Result<()> {
    let value = context
        .local()
        .get(&key)
        .with_context(|| format!("Failed to read key '{}'", key))?;

    match output.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({"key": key, "value": value, "synced": is_synced(&key)})
            );
        }
        OutputFormat::Human | OutputFormat::Quiet => match value {
            Some(value) => println!("{}", value),
            None => anyhow::bail!("Key '{}' is not set", key),
        },
    }

    Ok(())
}

/// Write one local store value
pub fn set(context: &SyncContext, key: String, value: String, output: &Output) -> Result<()> {
    context
        .local()
        .set(&key, &value)
        .with_context(|| format!("Failed to write key '{}'", key))?;

    output.success(&format!("Set {}", key));
    if !is_synced(&key) {
        output.message("  (device-local key, not synced)");
    }
    Ok(())
}

/// List the synced keys
pub fn keys(context: &SyncContext, output: &Output) -> Result<()> {
    let snapshot = context
        .local()
        .snapshot(&synced_keys())
        .context("Failed to read local store")?;

    match output.format {
        OutputFormat::Json => {
            let keys: Vec<_> = SYNCED_KEYS
                .iter()
                .map(|key| {
                    serde_json::json!({
                        "key": key,
                        "set": snapshot.get(key).is_some(),
                        "bytes": snapshot.get(key).map(str::len).unwrap_or(0)
                    })
                })
                .collect();
            println!("{}", serde_json::Value::Array(keys));
        }
        OutputFormat::Quiet => {
            for key in snapshot.keys() {
                println!("{}", key);
            }
        }
        OutputFormat::Human => {
            for key in SYNCED_KEYS {
                match snapshot.get(key) {
                    Some(value) => println!("{:<22} {}", key, truncate(value, 50)),
                    None => println!("{:<22} (not set)", key),
                }
            }
            println!(
                "\n{} of {} synced key(s) set",
                snapshot.len(),
                SYNCED_KEYS.len()
            );
        }
    }

    Ok(())
}
