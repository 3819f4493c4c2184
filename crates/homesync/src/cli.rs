//! Clap derive structures for the `homesync` CLI.
//!
//! Also compiled by `build.rs` for man page generation, so this file may
//! only depend on clap and clap_complete.

use clap::{Args, Parser, Subcommand, ValueEnum};

// ── Top-Level CLI ────────────────────────────────────────────────────

/// homesync -- read, watch and control smart-home hub entities
#[derive(Debug, Parser)]
#[command(
    name = "homesync",
    version,
    about = "Read, watch and control smart-home hub entities",
    long_about = "Keeps a local, cached view of hub entity state.\n\n\
        Reads are served from a short-lived memory cache and a durable\n\
        on-disk cache, with concurrent misses coalesced into one request.\n\
        `watch` follows the hub's real-time channel and falls back to\n\
        polling while it is down.",
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

// ── Global Options ───────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Hub profile to use
    #[arg(long, short = 'p', env = "HOMESYNC_PROFILE", global = true)]
    pub profile: Option<String>,

    /// Hub base URL (overrides profile)
    #[arg(long, env = "HOMESYNC_HUB", global = true)]
    pub hub: Option<String>,

    /// Long-lived access token (overrides profile)
    #[arg(long, env = "HOMESYNC_TOKEN", global = true, hide_env_values = true)]
    pub token: Option<String>,

    /// Output format
    #[arg(
        long,
        short = 'o',
        env = "HOMESYNC_OUTPUT",
        default_value = "table",
        global = true
    )]
    pub output: OutputFormat,

    /// When to use color output
    #[arg(long, default_value = "auto", global = true)]
    pub color: ColorMode,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(long, short = 'q', global = true)]
    pub quiet: bool,

    /// Accept self-signed TLS certificates
    #[arg(long, short = 'k', env = "HOMESYNC_INSECURE", global = true)]
    pub insecure: bool,

    /// Request timeout in seconds (overrides profile)
    #[arg(long, env = "HOMESYNC_TIMEOUT", global = true)]
    pub timeout: Option<u64>,

    /// Skip the durable on-disk cache
    #[arg(long, global = true)]
    pub no_cache: bool,
}

// ── Output & Color Enums ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Aligned columns (default, interactive)
    Table,
    /// Pretty-printed JSON
    Json,
    /// Compact single-line JSON (one object per line for `watch`)
    JsonCompact,
    /// Status only, one value per line (scripting)
    Plain,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ColorMode {
    /// Auto-detect (color if terminal is interactive)
    Auto,
    /// Always emit color codes
    Always,
    /// Never emit color codes
    Never,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum PriorityArg {
    Low,
    Normal,
    High,
}

// ── Top-Level Command Enum ───────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Print the current state of one or more entities
    Get(GetArgs),

    /// Follow entity changes until interrupted
    #[command(alias = "w")]
    Watch(WatchArgs),

    /// Call a hub service (e.g. light.turn_on)
    Call(CallArgs),

    /// Write an entity's state directly on the hub
    SetState(SetStateArgs),

    /// Manage configuration profiles
    Config(ConfigArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

// ── Entity commands ──────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GetArgs {
    /// Entity ids (e.g. sensor.temp_living_room)
    #[arg(required = true)]
    pub entities: Vec<String>,

    /// Include attributes in table output
    #[arg(long, short = 'a')]
    pub attributes: bool,
}

#[derive(Debug, Args)]
pub struct WatchArgs {
    /// Entity ids to follow
    #[arg(required = true)]
    pub entities: Vec<String>,

    /// Delivery priority of this watcher's callbacks
    #[arg(long, default_value = "normal")]
    pub priority: PriorityArg,

    /// Exit after this many changes
    #[arg(long, short = 'n')]
    pub count: Option<usize>,

    /// Exit after this many seconds
    #[arg(long)]
    pub duration: Option<u64>,
}

#[derive(Debug, Args)]
pub struct CallArgs {
    /// Service as domain.service (e.g. light.turn_on)
    pub service: String,

    /// Target entity; added to the service data as entity_id
    #[arg(long, short = 'e')]
    pub entity: Option<String>,

    /// Service data as a JSON object
    #[arg(long, short = 'd')]
    pub data: Option<String>,

    /// Send over the real-time channel instead of REST
    #[arg(long)]
    pub live: bool,
}

#[derive(Debug, Args)]
pub struct SetStateArgs {
    /// Entity id
    pub entity: String,

    /// New state value
    pub state: String,

    /// Attribute as key=value (value parsed as JSON, else string); repeatable
    #[arg(long = "attr", short = 'a', value_name = "KEY=VALUE")]
    pub attributes: Vec<String>,
}

// ── Config ───────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Print the config file path
    Path,

    /// Show the resolved configuration (tokens redacted)
    Show,

    /// Create or replace a profile
    Init(ConfigInitArgs),
}

#[derive(Debug, Args)]
pub struct ConfigInitArgs {
    /// Hub base URL
    #[arg(long)]
    pub hub: String,

    /// Read the token from this environment variable at runtime
    #[arg(long, conflicts_with = "store_token")]
    pub token_env: Option<String>,

    /// Store this token in the system keyring
    #[arg(long)]
    pub store_token: Option<String>,

    /// Store the token in the config file instead of the keyring
    #[arg(long, requires = "store_token")]
    pub plaintext: bool,

    /// Make this the default profile
    #[arg(long)]
    pub default: bool,
}

// ── Completions ──────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct CompletionsArgs {
    /// Target shell
    pub shell: clap_complete::Shell,
}
