//! Config subcommand handlers.

use homesync_config::{Config, ConfigError, Profile};

use crate::cli::{ConfigArgs, ConfigCommand, ConfigInitArgs, GlobalOpts, OutputFormat};
use crate::config::active_profile_name;
use crate::error::CliError;
use crate::output;

const REDACTED: &str = "********";

pub fn handle(args: ConfigArgs, global: &GlobalOpts) -> Result<(), CliError> {
    match args.command {
        ConfigCommand::Path => {
            output::print_output(
                &homesync_config::config_path().display().to_string(),
                global.quiet,
            );
            Ok(())
        }
        ConfigCommand::Show => show(global),
        ConfigCommand::Init(init_args) => init(init_args, global),
    }
}

fn show(global: &GlobalOpts) -> Result<(), CliError> {
    let cfg = redacted(homesync_config::load_config()?);
    let out = match global.output {
        OutputFormat::Json => output::render_json_pretty(&cfg)?,
        OutputFormat::JsonCompact => output::render_json_compact(&cfg)?,
        OutputFormat::Table | OutputFormat::Plain => {
            toml::to_string_pretty(&cfg).map_err(ConfigError::from)?
        }
    };
    output::print_output(out.trim_end(), global.quiet);
    Ok(())
}

fn redacted(mut cfg: Config) -> Config {
    for profile in cfg.profiles.values_mut() {
        if profile.token.is_some() {
            profile.token = Some(REDACTED.into());
        }
    }
    cfg
}

fn init(args: ConfigInitArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let url: url::Url = args.hub.parse().map_err(|_| CliError::Validation {
        field: "hub".into(),
        reason: format!("invalid URL: {}", args.hub),
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(CliError::Validation {
            field: "hub".into(),
            reason: format!("expected an http(s) URL, got '{}'", url.scheme()),
        });
    }

    let mut cfg = homesync_config::load_config_or_default();
    let name = active_profile_name(global, &cfg);

    let mut profile = Profile {
        hub: args.hub,
        token_env: args.token_env,
        insecure: global.insecure.then_some(true),
        timeout: global.timeout,
        ..Profile::default()
    };
    if let Some(token) = args.store_token {
        if args.plaintext {
            profile.token = Some(token);
        } else {
            homesync_config::store_token(&name, &token)?;
            eprintln!("Token stored in system keyring");
        }
    }

    if args.default || cfg.profiles.is_empty() {
        cfg.default_profile = Some(name.clone());
    }
    cfg.profiles.insert(name.clone(), profile);
    homesync_config::save_config(&cfg)?;

    output::print_output(
        &format!(
            "Saved profile '{name}' to {}",
            homesync_config::config_path().display()
        ),
        global.quiet,
    );
    Ok(())
}
