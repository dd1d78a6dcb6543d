//! tvheadend-probe: exercise a Tvheadend tuner from the command line.
//!
//! Connects over HTSP the same way a media-server host would and prints
//! channels, guide data or a ticketed stream URL as JSON.

use std::path::{Path, PathBuf};

use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use log::{error, info};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use tvheadend_tuner::host::ids::create_host_channel_id;
use tvheadend_tuner::{
    ChannelDescriptor, ChannelType, TunerHost, TunerHostInfo, TvheadendOptions,
    TvheadendTunerHost,
};

mod logging;

const DEFAULT_CONFIG_FILE: &str = "tvheadend-probe.toml";
const DEFAULT_TUNER_ID: &str = "tuner0";

/// tvheadend-probe - query a Tvheadend backend over HTSP
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short = 'f', long)]
    config: Option<PathBuf>,

    /// Backend HTTP base URL, e.g. http://localhost:9981
    #[arg(short, long)]
    url: Option<String>,

    /// HTSP user name
    #[arg(long)]
    username: Option<String>,

    /// HTSP password
    #[arg(long)]
    password: Option<String>,

    /// HTSP port
    #[arg(long)]
    htsp_port: Option<u16>,

    /// Tuner identifier used to scope channel ids
    #[arg(long)]
    tuner_id: Option<String>,

    /// Directory for rolling log files
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List channels
    Channels,
    /// List programs of one channel
    Programs {
        /// Channel id, host-scoped (`tuner0_5`) or native (`5`)
        channel: String,
        /// Length of the guide window in hours, starting now
        #[arg(long, default_value = "24")]
        hours: i64,
    },
    /// Resolve a playable stream URL
    Stream {
        /// Channel id, host-scoped (`tuner0_5`) or native (`5`)
        channel: String,
    },
    /// Check connectivity and credentials
    Validate,
}

/// Configuration file format.
#[derive(Debug, Deserialize, Default)]
struct ConfigFile {
    #[serde(default)]
    tuner: TunerSection,
    #[serde(default)]
    logging: LoggingSection,
}

#[derive(Debug, Deserialize, Default)]
struct TunerSection {
    id: Option<String>,
    url: Option<String>,
    #[serde(flatten)]
    options: TvheadendOptions,
}

#[derive(Debug, Deserialize, Default)]
struct LoggingSection {
    level: Option<String>,
    log_dir: Option<String>,
    retention_days: Option<u64>,
}

fn load_config(path: &Path) -> Result<ConfigFile, Box<dyn std::error::Error>> {
    let contents = std::fs::read_to_string(path)?;
    let config: ConfigFile = toml::from_str(&contents)?;
    Ok(config)
}

/// Command line > environment > configuration file > defaults.
fn resolve_tuner(
    args: &Args,
    section: TunerSection,
    env: impl Fn(&str) -> Option<String>,
) -> TunerHostInfo {
    let defaults = TvheadendTunerHost::new().default_configuration();

    let mut tuner = TunerHostInfo {
        id: section.id.unwrap_or_else(|| DEFAULT_TUNER_ID.to_string()),
        url: section.url.unwrap_or(defaults.url),
        options: section.options,
    };
    tuner.apply_overrides(env);

    if let Some(url) = &args.url {
        tuner.url = url.clone();
    }
    if let Some(username) = &args.username {
        tuner.options.username = Some(username.clone());
    }
    if let Some(password) = &args.password {
        tuner.options.password = Some(password.clone());
    }
    if let Some(port) = args.htsp_port {
        tuner.options.htsp_port = port;
    }
    if let Some(id) = &args.tuner_id {
        tuner.id = id.clone();
    }
    tuner
}

/// Accept either a host-scoped id or a bare native id.
fn host_channel_id(tuner: &TunerHostInfo, channel: &str) -> String {
    match channel.parse::<u32>() {
        Ok(native) => create_host_channel_id(&tuner.id, native),
        Err(_) => channel.to_string(),
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(
    host: &TvheadendTunerHost,
    tuner: &TunerHostInfo,
    command: &Command,
    cancel: &CancellationToken,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Command::Channels => {
            let channels = host.get_channels(tuner, cancel).await?;
            info!("{} channels", channels.len());
            print_json(&channels)
        }
        Command::Programs { channel, hours } => {
            let start = Utc::now();
            let end = start + Duration::hours(*hours);
            let channel_id = host_channel_id(tuner, channel);
            let programs = host
                .get_programs(tuner, &channel_id, start, end, cancel)
                .await?;
            info!("{} programs on {}", programs.len(), channel_id);
            print_json(&programs)
        }
        Command::Stream { channel } => {
            let descriptor = ChannelDescriptor {
                id: host_channel_id(tuner, channel),
                tuner_host_id: tuner.id.clone(),
                name: channel.clone(),
                number: String::new(),
                image_url: None,
                channel_type: ChannelType::Tv,
                tags: Vec::new(),
            };
            let sources = host
                .get_channel_stream_sources(tuner, &descriptor, cancel)
                .await?;
            print_json(&sources)
        }
        Command::Validate => {
            host.validate_options(tuner, cancel).await?;
            print_json(&serde_json::json!({ "valid": true, "url": tuner.url }))
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load config file: explicit path > auto-detect > default
    let config_path = args.config.clone().or_else(|| {
        let default_path = PathBuf::from(DEFAULT_CONFIG_FILE);
        default_path.exists().then_some(default_path)
    });
    let file_config = match &config_path {
        Some(path) => load_config(path).map_err(|e| {
            eprintln!("Failed to load config file {}: {}", path.display(), e);
            e
        })?,
        None => ConfigFile::default(),
    };

    let level = if args.verbose {
        "debug".to_string()
    } else {
        file_config
            .logging
            .level
            .clone()
            .unwrap_or_else(|| "info".to_string())
    };
    let log_dir = args
        .log_dir
        .clone()
        .or_else(|| file_config.logging.log_dir.as_ref().map(PathBuf::from));
    let _log_guard = logging::init_logging(&logging::LogSettings {
        level: &level,
        log_dir: log_dir.as_deref(),
        retention_days: file_config.logging.retention_days.unwrap_or(7),
    })?;

    if let Some(path) = &config_path {
        info!("Loaded config from: {}", path.display());
    }

    let tuner = resolve_tuner(&args, file_config.tuner, |key| std::env::var(key).ok());
    info!("Using tuner {} at {}", tuner.id, tuner.url);

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, cancelling");
            ctrl_c.cancel();
        }
    });

    let host = TvheadendTunerHost::new();
    let result = run(&host, &tuner, &args.command, &cancel).await;
    host.sessions().dispose_all().await;

    if let Err(e) = &result {
        error!("{}", e);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["tvheadend-probe"];
        argv.extend_from_slice(extra);
        argv.push("channels");
        Args::parse_from(argv)
    }

    #[test]
    fn test_config_file_sections() {
        let config: ConfigFile = toml::from_str(
            r#"
            [tuner]
            id = "living-room"
            url = "http://tvh.lan:9981"
            username = "viewer"
            htsp_port = 19982

            [logging]
            level = "warn"
            "#,
        )
        .unwrap();

        assert_eq!(config.tuner.id.as_deref(), Some("living-room"));
        assert_eq!(config.tuner.options.htsp_port, 19982);
        assert_eq!(config.tuner.options.keepalive_interval_secs, 30);
        assert_eq!(config.logging.level.as_deref(), Some("warn"));
    }

    #[test]
    fn test_command_line_overrides_file() {
        let section = TunerSection {
            id: Some("file".to_string()),
            url: Some("http://file:9981".to_string()),
            options: TvheadendOptions::default(),
        };
        let tuner = resolve_tuner(
            &args(&["--url", "http://cli:9981", "--htsp-port", "1234"]),
            section,
            |_| None,
        );
        assert_eq!(tuner.url, "http://cli:9981");
        assert_eq!(tuner.options.htsp_port, 1234);
        assert_eq!(tuner.id, "file");
    }

    #[test]
    fn test_environment_sits_between_file_and_command_line() {
        let env: HashMap<&str, &str> = [
            ("TVH_URL", "http://env:9981"),
            ("TVH_USERNAME", "env-user"),
            ("TVH_HTSP_PORT", "2000"),
        ]
        .into_iter()
        .collect();
        let lookup = |key: &str| env.get(key).map(|v| v.to_string());

        let section = TunerSection {
            url: Some("http://file:9981".to_string()),
            ..Default::default()
        };
        let tuner = resolve_tuner(&args(&["--htsp-port", "1234"]), section, lookup);
        assert_eq!(tuner.url, "http://env:9981");
        assert_eq!(tuner.options.username.as_deref(), Some("env-user"));
        assert_eq!(tuner.options.htsp_port, 1234);
        assert_eq!(tuner.id, DEFAULT_TUNER_ID);
    }

    #[test]
    fn test_host_channel_id_accepts_native_ids() {
        let tuner = TunerHostInfo::new("tuner0", "http://localhost:9981");
        assert_eq!(host_channel_id(&tuner, "5"), "tuner0_5");
        assert_eq!(host_channel_id(&tuner, "tuner0_5"), "tuner0_5");
    }
}
