use std::{
    collections::BTreeMap,
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
};

use anyhow::Context as _;
use serde::Deserialize;
use std::str::FromStr;

use crate::transform::{HeaderNormalizer, NormalizeFn, Redactor, ScrubFn};

#[derive(Debug, Deserialize)]
pub struct Config {
    pub engine: EngineConfig,
    #[serde(default)]
    pub store: StoreConfig,
    pub proxy: Option<ProxyConfig>,
    pub redact: Option<RedactConfig>,
    pub normalize: Option<NormalizeConfig>,
    pub logging: Option<LoggingConfig>,
}

impl Config {
    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let toml =
            fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
        Self::from_toml_str(&toml)
    }

    pub fn from_toml_str(toml: &str) -> anyhow::Result<Self> {
        toml.parse()
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        toml::from_str(s).context("parse config TOML")
    }
}

#[derive(Debug, Deserialize)]
pub struct EngineConfig {
    /// Origin (scheme, host, port and optional base path) requests are forwarded to.
    pub remote: String,
    #[serde(default)]
    pub prevent_recording: bool,
}

#[derive(Debug, Default, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Directory,
    Sqlite,
    Memory,
}

#[derive(Debug, Default, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    pub path: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
pub struct ProxyConfig {
    pub listen: SocketAddr,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct RedactConfig {
    #[serde(default)]
    pub headers: Vec<String>,
    #[serde(default)]
    pub query_params: Vec<String>,
    #[serde(default)]
    pub form_fields: Vec<String>,
    #[serde(default)]
    pub body_json: Vec<String>,
    pub placeholder: Option<String>,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct NormalizeConfig {
    #[serde(default)]
    pub ignore_headers: Vec<String>,
    #[serde(default)]
    pub header_values: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub format: Option<LogFormat>,
}

/// Constructor input for [`crate::engine::FixtureEngine`].
#[derive(Clone, Default)]
pub struct EngineOptions {
    pub remote_origin: Option<String>,
    pub scrub: Option<ScrubFn>,
    pub normalize: Option<NormalizeFn>,
    pub prevent_recording: bool,
}

impl EngineOptions {
    pub fn new(remote_origin: impl Into<String>) -> Self {
        Self {
            remote_origin: Some(remote_origin.into()),
            ..Self::default()
        }
    }

    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let scrub = config
            .redact
            .as_ref()
            .map(Redactor::from_config)
            .transpose()?
            .map(Redactor::into_scrub_fn);
        let normalize = config
            .normalize
            .as_ref()
            .map(|normalize| HeaderNormalizer::from_config(normalize).into_normalize_fn());

        Ok(Self {
            remote_origin: Some(config.engine.remote.clone()),
            scrub,
            normalize,
            prevent_recording: config.engine.prevent_recording,
        })
    }

    pub fn with_scrub(mut self, scrub: ScrubFn) -> Self {
        self.scrub = Some(scrub);
        self
    }

    pub fn with_normalize(mut self, normalize: NormalizeFn) -> Self {
        self.normalize = Some(normalize);
        self
    }

    pub fn prevent_recording(mut self, prevent: bool) -> Self {
        self.prevent_recording = prevent;
        self
    }
}

impl std::fmt::Debug for EngineOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineOptions")
            .field("remote_origin", &self.remote_origin)
            .field("scrub", &self.scrub.is_some())
            .field("normalize", &self.normalize.is_some())
            .field("prevent_recording", &self.prevent_recording)
            .finish()
    }
}
