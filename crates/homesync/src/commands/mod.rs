//! Command dispatch: bridges CLI args -> `Hub` operations -> output formatting.

pub mod call;
pub mod config_cmd;
pub mod state;
pub mod watch;

use std::time::Duration;

use tokio::sync::broadcast;
use tracing::debug;

use homesync_core::{ConnectionState, EntityKey, Hub, HubEvent};

use crate::cli::{Command, GlobalOpts};
use crate::error::CliError;

/// Dispatch a hub-bound command to the appropriate handler.
pub async fn dispatch(cmd: Command, hub: &Hub, global: &GlobalOpts) -> Result<(), CliError> {
    match cmd {
        Command::Get(args) => state::get(hub, args, global).await,
        Command::SetState(args) => state::set(hub, args, global).await,
        Command::Watch(args) => watch::handle(hub, args, global).await,
        Command::Call(args) => call::handle(hub, args, global).await,
        // Handled before a hub is built.
        Command::Config(_) | Command::Completions(_) => Ok(()),
    }
}

// ── Shared helpers ───────────────────────────────────────────────────

/// Validate `domain.object_id` entity ids.
pub(crate) fn parse_entities(raw: &[String]) -> Result<Vec<EntityKey>, CliError> {
    raw.iter().map(|id| parse_entity(id)).collect()
}

pub(crate) fn parse_entity(id: &str) -> Result<EntityKey, CliError> {
    match id.split_once('.') {
        Some((domain, object)) if !domain.is_empty() && !object.is_empty() => {
            Ok(EntityKey::from(id))
        }
        _ => Err(CliError::Validation {
            field: "entity".into(),
            reason: format!("expected <domain>.<object_id>, got '{id}'"),
        }),
    }
}

/// Start the real-time channel and wait until it is up.
pub(crate) async fn connect(hub: &Hub, deadline: Duration) -> Result<(), CliError> {
    let mut events = hub.events();
    let mut state = hub.connection_state();
    hub.start();

    let settled = tokio::time::timeout(
        deadline,
        state.wait_for(|s| matches!(s, ConnectionState::Connected | ConnectionState::Failed)),
    )
    .await;

    match settled {
        Ok(Ok(s)) if matches!(*s, ConnectionState::Connected) => {
            debug!("real-time channel connected");
            Ok(())
        }
        Err(_) => Err(CliError::Timeout {
            seconds: deadline.as_secs(),
        }),
        _ => Err(failure_reason(&mut events, hub)),
    }
}

/// Best explanation for a `Failed` channel from the buffered events.
fn failure_reason(events: &mut broadcast::Receiver<HubEvent>, hub: &Hub) -> CliError {
    while let Ok(event) = events.try_recv() {
        match event {
            HubEvent::AuthFailed { message } => return CliError::AuthFailed { message },
            HubEvent::ConnectionFailed { attempts } => {
                return CliError::ReconnectExhausted { attempts };
            }
            _ => {}
        }
    }
    CliError::ConnectionFailed {
        url: hub.config().url.to_string(),
        reason: "real-time channel failed".into(),
    }
}
