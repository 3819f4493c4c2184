//! `call` handler: invoke a hub service.

use serde_json::{Map, Value};

use homesync_core::Hub;

use crate::cli::{CallArgs, GlobalOpts};
use crate::commands::connect;
use crate::error::CliError;
use crate::output;

pub async fn handle(hub: &Hub, args: CallArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let (domain, service) = split_service(&args.service)?;
    let data = service_data(args.data.as_deref(), args.entity)?;

    // Without --live the channel stays closed and the call goes over REST.
    if args.live {
        connect(hub, hub.config().connection.handshake_timeout).await?;
    }
    let result = hub.invoke(domain, service, Some(data)).await?;

    let out = output::render_value(global.output, &result)?;
    output::print_output(&out, global.quiet);
    Ok(())
}

fn split_service(raw: &str) -> Result<(&str, &str), CliError> {
    raw.split_once('.')
        .filter(|(domain, service)| !domain.is_empty() && !service.is_empty())
        .ok_or_else(|| CliError::Validation {
            field: "service".into(),
            reason: format!("expected <domain>.<service>, got '{raw}'"),
        })
}

fn service_data(raw: Option<&str>, entity: Option<String>) -> Result<Value, CliError> {
    let mut data = match raw {
        Some(raw) => serde_json::from_str(raw)?,
        None => Value::Object(Map::new()),
    };
    let Value::Object(ref mut map) = data else {
        return Err(CliError::Validation {
            field: "data".into(),
            reason: "service data must be a JSON object".into(),
        });
    };
    if let Some(entity) = entity {
        map.insert("entity_id".into(), Value::String(entity));
    }
    Ok(data)
}
