use anyhow::Context;
use cloudvps_common::bus::{Command, CHANNEL_ORCHESTRATOR_COMMANDS};
use futures_util::StreamExt;
use std::sync::Arc;

use crate::api::AppState;

/// Subscribe to the command channel and run each command in its own task.
/// Returns when the subscription ends or shutdown is requested.
pub async fn run(state: Arc<AppState>, client: redis::Client) -> anyhow::Result<()> {
    let mut pubsub = client
        .get_async_pubsub()
        .await
        .context("Failed to connect to Redis (subscriber)")?;
    pubsub
        .subscribe(CHANNEL_ORCHESTRATOR_COMMANDS)
        .await
        .context("Failed to subscribe to the command channel")?;
    tracing::info!(
        "🎧 [listener] listening on Redis channel '{}'",
        CHANNEL_ORCHESTRATOR_COMMANDS
    );

    let mut stream = pubsub.on_message();
    loop {
        let msg = tokio::select! {
            _ = state.shutdown.cancelled() => break,
            msg = stream.next() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };
        let payload: String = match msg.get_payload() {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!("⚠️ [listener] unreadable payload: {}", e);
                continue;
            }
        };
        match parse_command(&payload) {
            Some(cmd) => {
                state.tasks.spawn(dispatch(state.clone(), cmd));
            }
            None => continue,
        }
    }
    tracing::info!("🎧 [listener] stopped");
    Ok(())
}

/// Decode a bus message. Unknown types and malformed bodies are logged and dropped.
pub fn parse_command(payload: &str) -> Option<Command> {
    match serde_json::from_str::<Command>(payload) {
        Ok(cmd) => {
            tracing::info!("📩 [listener] received {}", cmd.as_str());
            Some(cmd)
        }
        Err(e) => {
            let event_type = serde_json::from_str::<serde_json::Value>(payload)
                .ok()
                .and_then(|v| v["type"].as_str().map(str::to_string))
                .unwrap_or_default();
            tracing::warn!(
                "⚠️ [listener] ignoring message type='{}': {}",
                event_type,
                e
            );
            None
        }
    }
}

/// Execute one command. Errors are already logged and notified by the
/// controllers; nothing is returned to the publisher.
pub async fn dispatch(state: Arc<AppState>, cmd: Command) {
    match cmd {
        Command::Purchase(req) => {
            state.provisioning.purchase(&req, &state.shutdown).await;
        }
        Command::Start { instance_id } => {
            let _ = state.lifecycle.start(instance_id).await;
        }
        Command::Stop { instance_id } => {
            let _ = state.lifecycle.stop(instance_id).await;
        }
        Command::Restart { instance_id } => {
            let _ = state.lifecycle.restart(instance_id).await;
        }
        Command::Delete { instance_id } => {
            let _ = state.lifecycle.delete(instance_id).await;
        }
        Command::Backup { instance_id } => {
            let _ = state.lifecycle.create_backup(instance_id).await;
        }
    }
}
