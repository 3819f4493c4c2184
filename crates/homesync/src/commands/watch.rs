//! `watch` handler: stream entity changes until interrupted.

use std::time::Duration;

use tokio::sync::{broadcast::error::RecvError, mpsc};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use homesync_core::{EntityKey, Hub, HubEvent, Priority, StateValue, SubscribeOptions};

use crate::cli::{GlobalOpts, PriorityArg, WatchArgs};
use crate::commands::parse_entities;
use crate::error::CliError;
use crate::output::{self, StateRow};

impl From<PriorityArg> for Priority {
    fn from(arg: PriorityArg) -> Self {
        match arg {
            PriorityArg::Low => Priority::Low,
            PriorityArg::Normal => Priority::Normal,
            PriorityArg::High => Priority::High,
        }
    }
}

pub async fn handle(hub: &Hub, args: WatchArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let keys = parse_entities(&args.entities)?;
    let mut events = hub.events();

    // Callbacks only forward; printing happens on this task.
    let (tx, mut rx) = mpsc::unbounded_channel::<(EntityKey, StateValue)>();
    let options = SubscribeOptions::default().with_priority(args.priority.into());
    let subscriptions: Vec<_> = keys
        .into_iter()
        .map(|key| {
            let tx = tx.clone();
            hub.subscribe(
                key,
                move |key: &EntityKey, value: &StateValue| {
                    let _ = tx.send((key.clone(), value.clone()));
                },
                options,
            )
        })
        .collect();
    drop(tx);

    hub.start();

    let deadline = args
        .duration
        .map(|secs| Instant::now() + Duration::from_secs(secs));
    let stop_at = async move {
        match deadline {
            Some(at) => tokio::time::sleep_until(at).await,
            None => std::future::pending().await,
        }
    };
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(stop_at, ctrl_c);

    let color = output::should_color(global.color);
    let mut seen = 0_usize;

    let result = loop {
        tokio::select! {
            _ = &mut ctrl_c => break Ok(()),
            () = &mut stop_at => break Ok(()),
            Some((key, value)) = rx.recv() => {
                let row = StateRow { entity_id: &key, value: &value };
                match output::render_change(global.output, &row, color) {
                    Ok(line) => output::print_output(&line, global.quiet),
                    Err(e) => break Err(e),
                }
                seen += 1;
                if args.count.is_some_and(|limit| seen >= limit) {
                    break Ok(());
                }
            }
            event = events.recv() => match event {
                Ok(HubEvent::AuthFailed { message }) => break Err(CliError::AuthFailed { message }),
                Ok(HubEvent::ConnectionFailed { attempts }) => {
                    break Err(CliError::ReconnectExhausted { attempts });
                }
                Ok(HubEvent::Connected) => info!("real-time channel connected"),
                Ok(HubEvent::Disconnected) => warn!("real-time channel lost, polling until it returns"),
                Ok(HubEvent::EntityStateChanged { .. }) => {}
                Err(RecvError::Lagged(skipped)) => debug!(skipped, "event stream lagged"),
                Err(RecvError::Closed) => break Ok(()),
            },
        }
    };

    for subscription in subscriptions {
        subscription.unsubscribe();
    }
    result
}
