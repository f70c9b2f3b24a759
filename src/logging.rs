use anyhow::anyhow;
use tracing_subscriber::filter::LevelFilter;

use crate::config::{Config, LogFormat};

const DEFAULT_LOG_LEVEL: &str = "info";
pub const LOG_LEVEL_ENV: &str = "REPLAYTRACK_LOG";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

impl LogSettings {
    /// Level precedence: CLI flag, then `REPLAYTRACK_LOG`, then `[logging]`, then `info`.
    pub fn resolve(config: &Config, cli_level_override: Option<&str>) -> anyhow::Result<Self> {
        let env_level = std::env::var(LOG_LEVEL_ENV).ok();
        Self::resolve_with_env(config, cli_level_override, env_level.as_deref())
    }

    fn resolve_with_env(
        config: &Config,
        cli_level_override: Option<&str>,
        env_level: Option<&str>,
    ) -> anyhow::Result<Self> {
        let logging = config.logging.as_ref();
        let raw_level = cli_level_override
            .or(env_level)
            .or_else(|| logging.and_then(|logging| logging.level.as_deref()))
            .unwrap_or(DEFAULT_LOG_LEVEL);

        Ok(Self {
            level: parse_level(raw_level)?,
            format: logging
                .and_then(|logging| logging.format)
                .unwrap_or(LogFormat::Json),
        })
    }
}

pub fn init(settings: LogSettings) -> anyhow::Result<()> {
    match settings.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .with_max_level(settings.level)
            .with_target(true)
            .json()
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_max_level(settings.level)
            .with_target(true)
            .pretty()
            .try_init(),
    }
    .map_err(|err| anyhow!("initialize logging subscriber: {err}"))
}

fn parse_level(raw_level: &str) -> anyhow::Result<LevelFilter> {
    raw_level
        .trim()
        .to_ascii_lowercase()
        .parse::<LevelFilter>()
        .map_err(|_| {
            anyhow!(
                "invalid log level `{raw_level}`; expected one of trace, debug, info, warn, error, off"
            )
        })
}
