use std::time::Instant;
use uuid::Uuid;

/// An action in flight. Emitted as structured events on the `action_log` target.
#[derive(Debug)]
pub struct ActionLog {
    pub log_id: Uuid,
    pub action_type: &'static str,
    pub instance_id: Uuid,
    started: Instant,
}

/// Record the start of an action.
pub fn log_event(
    action_type: &'static str,
    instance_id: Uuid,
    metadata: Option<serde_json::Value>,
) -> ActionLog {
    let log_id = Uuid::new_v4();
    tracing::info!(
        target: "action_log",
        %log_id,
        action_type,
        %instance_id,
        status = "in_progress",
        metadata = %metadata.unwrap_or(serde_json::Value::Null),
        "📝 [orchestrator] {} started",
        action_type
    );
    ActionLog {
        log_id,
        action_type,
        instance_id,
        started: Instant::now(),
    }
}

/// Record completion with duration.
pub fn log_event_complete(log: ActionLog, status: &str, error_message: Option<&str>) {
    let duration_ms = log.started.elapsed().as_millis() as u64;
    match error_message {
        None => tracing::info!(
            target: "action_log",
            log_id = %log.log_id,
            action_type = log.action_type,
            instance_id = %log.instance_id,
            status,
            duration_ms,
            "📝 [orchestrator] {} {} ({} ms)",
            log.action_type,
            status,
            duration_ms
        ),
        Some(err) => tracing::warn!(
            target: "action_log",
            log_id = %log.log_id,
            action_type = log.action_type,
            instance_id = %log.instance_id,
            status,
            duration_ms,
            error_message = err,
            "📝 [orchestrator] {} {} ({} ms): {}",
            log.action_type,
            status,
            duration_ms,
            err
        ),
    }
}

/// One-off event (like a drift observation).
pub fn log_quick(action_type: &'static str, instance_id: Uuid, details: Option<&str>) {
    tracing::info!(
        target: "action_log",
        action_type,
        %instance_id,
        status = "success",
        details = details.unwrap_or(""),
        "📝 [orchestrator] {}",
        action_type
    );
}
