//! `get` and `set-state` handlers.

use futures_util::future::join_all;
use serde_json::Value;

use homesync_api::Attributes;
use homesync_core::{CoreError, Hub, StateValue};

use crate::cli::{GetArgs, GlobalOpts, SetStateArgs};
use crate::commands::{parse_entities, parse_entity};
use crate::error::CliError;
use crate::output::{self, StateRow};

/// Resolve every entity concurrently so cache misses share one fetch.
pub async fn get(hub: &Hub, args: GetArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let keys = parse_entities(&args.entities)?;
    let values = join_all(keys.iter().map(|key| hub.get(key))).await;

    let rows: Vec<StateRow<'_>> = keys
        .iter()
        .zip(&values)
        .map(|(entity_id, value)| StateRow { entity_id, value })
        .collect();
    let out = output::render_states(global.output, &rows, args.attributes)?;
    output::print_output(&out, global.quiet);
    Ok(())
}

pub async fn set(hub: &Hub, args: SetStateArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let key = parse_entity(&args.entity)?;
    let attributes = parse_attributes(&args.attributes)?;
    let rest = hub.rest().ok_or(CoreError::HubDisconnected)?;

    let written = rest
        .set_state(&key, &args.state, &attributes)
        .await
        .map_err(CoreError::from)?;
    let value = StateValue::from(written);

    let rows = [StateRow {
        entity_id: &key,
        value: &value,
    }];
    let out = output::render_states(global.output, &rows, true)?;
    output::print_output(&out, global.quiet);
    Ok(())
}

/// `key=value` pairs; values that parse as JSON keep their type.
fn parse_attributes(raw: &[String]) -> Result<Attributes, CliError> {
    raw.iter()
        .map(|pair| {
            let (name, value) = pair.split_once('=').ok_or_else(|| CliError::Validation {
                field: "attr".into(),
                reason: format!("expected KEY=VALUE, got '{pair}'"),
            })?;
            let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.into()));
            Ok((name.to_owned(), value))
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn attribute_values_keep_json_types() {
        let attrs = parse_attributes(&[
            "brightness=128".into(),
            "friendly_name=Kitchen".into(),
            "rgb=[255,0,0]".into(),
        ])
        .unwrap();
        assert_eq!(attrs["brightness"], json!(128));
        assert_eq!(attrs["friendly_name"], json!("Kitchen"));
        assert_eq!(attrs["rgb"], json!([255, 0, 0]));
    }

    #[test]
    fn attribute_without_equals_is_rejected() {
        assert!(parse_attributes(&["brightness".into()]).is_err());
    }
}
