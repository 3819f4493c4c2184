//! Builds a `HubConfig` from the config file, the active profile and
//! CLI flag overrides.

use std::time::Duration;

use secrecy::SecretString;

use homesync_config::{Config, Defaults, Profile};
use homesync_core::HubConfig;

use crate::cli::GlobalOpts;
use crate::error::CliError;

/// Profile named by `--profile`, then the config's default, then `"default"`.
pub fn active_profile_name(global: &GlobalOpts, cfg: &Config) -> String {
    global
        .profile
        .clone()
        .or_else(|| cfg.default_profile.clone())
        .unwrap_or_else(|| "default".into())
}

/// Resolve the hub to talk to.
///
/// A matching profile supplies the base settings; `--hub`, `--token`,
/// `--insecure`, `--timeout` and `--no-cache` override them. Without a
/// profile, `--hub` and `--token` are both required.
pub fn resolve_hub_config(global: &GlobalOpts) -> Result<HubConfig, CliError> {
    let cfg = homesync_config::load_config_or_default();
    let profile_name = active_profile_name(global, &cfg);

    let profile = match (cfg.profiles.get(&profile_name), global.profile.as_deref()) {
        (Some(profile), _) => profile.clone(),
        // An explicitly named profile must exist unless the hub is given.
        (None, Some(name)) if global.hub.is_none() => {
            let mut available: Vec<&str> = cfg.profiles.keys().map(String::as_str).collect();
            available.sort_unstable();
            return Err(CliError::ProfileNotFound {
                name: name.to_owned(),
                available: if available.is_empty() {
                    "(none)".into()
                } else {
                    available.join(", ")
                },
            });
        }
        (None, _) => Profile::default(),
    };

    let profile = apply_overrides(profile, global);
    if profile.hub.is_empty() {
        return Err(CliError::NoConfig {
            path: homesync_config::config_path().display().to_string(),
        });
    }

    let token = match global.token {
        Some(ref token) => SecretString::from(token.clone()),
        None => homesync_config::resolve_token(&profile, &profile_name)?,
    };

    build(&profile, &profile_name, &cfg.defaults, token)
}

fn apply_overrides(mut profile: Profile, global: &GlobalOpts) -> Profile {
    if let Some(ref hub) = global.hub {
        profile.hub.clone_from(hub);
    }
    if global.insecure {
        profile.insecure = Some(true);
    }
    if let Some(timeout) = global.timeout {
        profile.timeout = Some(timeout);
    }
    if global.no_cache {
        profile.durable_cache = Some(false);
    }
    profile
}

fn build(
    profile: &Profile,
    profile_name: &str,
    defaults: &Defaults,
    token: SecretString,
) -> Result<HubConfig, CliError> {
    let mut config = homesync_config::build_hub_config(profile, profile_name, defaults, token)?;
    // Service calls share the request timeout.
    config.connection.call_timeout = config.timeout.max(Duration::from_secs(1));
    Ok(config)
}
