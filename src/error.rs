use crate::matching::FingerprintError;

/// Every failure surfaced by [`crate::engine::FixtureEngine`].
#[derive(Debug)]
pub enum EngineError {
    /// Missing or invalid constructor option.
    Config(String),
    /// Caller misuse, e.g. starting a series while one is active.
    Usage(String),
    Fingerprint(FingerprintError),
    /// The inbound request body could not be buffered.
    InboundBody(anyhow::Error),
    /// Fixture store `get`/`set`/`delete` failed, or a stored record was malformed.
    Store(anyhow::Error),
    /// The remote origin could not be reached.
    Upstream(anyhow::Error),
    /// A replayed series diverged from its recording. The listed fixtures were
    /// removed so the next full run re-records the chain.
    CorruptedSeries {
        series_key: String,
        removed_keys: Vec<String>,
    },
    /// A fixture was missing while recording is disabled.
    RecordingPrevented { key: String },
}

impl EngineError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Usage(_) => "usage",
            Self::Fingerprint(_) => "fingerprint",
            Self::InboundBody(_) => "inbound_body",
            Self::Store(_) => "store",
            Self::Upstream(_) => "upstream",
            Self::CorruptedSeries { .. } => "corrupted_series",
            Self::RecordingPrevented { .. } => "recording_prevented",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(reason) => write!(f, "invalid engine configuration: {reason}"),
            Self::Usage(reason) => write!(f, "{reason}"),
            Self::Fingerprint(err) => write!(f, "{err}"),
            Self::InboundBody(err) => write!(f, "{err:#}"),
            Self::Store(err) => write!(f, "fixture store error: {err:#}"),
            Self::Upstream(err) => write!(f, "upstream request failed: {err:#}"),
            Self::CorruptedSeries {
                series_key,
                removed_keys,
            } => write!(
                f,
                "series `{series_key}` diverged from its recorded fixtures; removed {} fixture(s) \
                 from the start of the series, re-run the full suite to record it again",
                removed_keys.len()
            ),
            Self::RecordingPrevented { key } => {
                write!(f, "no fixture recorded for `{key}` and recording is disabled")
            }
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Fingerprint(err) => Some(err),
            Self::InboundBody(err) | Self::Store(err) | Self::Upstream(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<FingerprintError> for EngineError {
    fn from(err: FingerprintError) -> Self {
        Self::Fingerprint(err)
    }
}
