use std::{borrow::Cow, fmt, io::IsTerminal, net::SocketAddr, path::PathBuf, str::FromStr};

use clap::{Parser, ValueEnum};
use config::Config;
use logforth::filter::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "Tianji", version, long_about = concat!("Tianji LLM gateway v", env!("CARGO_PKG_VERSION")))]
pub struct Args {
    /// IP address on which the server will listen for incoming connections.
    /// Default: 127.0.0.1:4000
    #[arg(short, long, env = "TIANJI_LISTEN_ADDRESS")]
    pub listen_address: Option<SocketAddr>,
    /// Path to the TOML configuration file
    #[arg(long, short, env = "TIANJI_CONFIG_PATH", default_value = "./tianji.toml")]
    pub config: PathBuf,
    /// Set the logging level
    #[arg(long = "log", env = "TIANJI_LOG", default_value_t = LogLevel::default())]
    pub log_level: LogLevel,
    /// Set the style of log output
    #[arg(long, env = "TIANJI_LOG_STYLE", default_value_t = LogStyle::default())]
    pub log_style: LogStyle,
}

impl Args {
    /// Load the configuration file, resolving `secret:` references through the
    /// secret managers of its `[secrets]` section.
    pub async fn config(&self) -> anyhow::Result<Config> {
        let mut raw = Config::load_raw(&self.config)?;
        secrets::resolve_config_secrets(&mut raw, &secrets::builtin_registry()).await?;

        Config::from_raw(raw)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
pub(crate) enum LogStyle {
    /// Colorized text, used as the default with TTY output
    Color,
    /// Standard text, used as the default with non-TTY output
    Text,
    /// JSON objects
    Json,
}

impl Default for LogStyle {
    fn default() -> Self {
        if std::io::stdout().is_terminal() {
            LogStyle::Color
        } else {
            LogStyle::Text
        }
    }
}

impl AsRef<str> for LogStyle {
    fn as_ref(&self) -> &str {
        match self {
            LogStyle::Color => "color",
            LogStyle::Text => "text",
            LogStyle::Json => "json",
        }
    }
}

impl fmt::Display for LogStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_ref())
    }
}

#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
pub(crate) enum LogLevel {
    /// Disable logging
    Off,
    /// Only log errors
    Error,
    /// Log errors, and warnings
    Warn,
    /// Log errors, warnings, and info messages
    #[default]
    Info,
    /// Log errors, warnings, info, and debug messages
    Debug,
    /// Log errors, warnings, info, debug, and trace messages
    Trace,
}

const WORKSPACE_CRATES: &[&str] = &[
    "tianji",
    "server",
    "config",
    "llm",
    "auth",
    "rate_limit",
    "callbacks",
    "secrets",
    "telemetry",
];

impl LogLevel {
    /// `warn` for foreign crates, the selected level for the workspace crates.
    pub fn env_filter(self) -> EnvFilter {
        let filter = match self {
            LogLevel::Off => Cow::Borrowed("off"),
            level => {
                let mut filter = String::from("warn");

                for name in WORKSPACE_CRATES {
                    filter.push_str(&format!(",{name}={level}"));
                }

                Cow::Owned(filter)
            }
        };

        EnvFilter::from_str(&filter).expect("These all are valid env filters.")
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_ref().fmt(f)
    }
}

impl AsRef<str> for LogLevel {
    fn as_ref(&self) -> &str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}
