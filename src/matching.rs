use md5::{Digest as _, Md5};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde::Serialize;

use crate::{
    codec::{self, EncodedBody},
    descriptor::{HeaderFields, RequestDescriptor},
    transform::{Exchange, NormalizeFn, ScrubFn},
};

/// Synthetic header carrying the series chain into the fingerprint input.
pub const SERIES_HEADER: &str = "x-replaytrack-past-keys";

/// Keys double as file names in directory stores; the URL part is truncated
/// and uniqueness comes from the digest suffix.
const KEY_URL_PREFIX_LEN: usize = 32;

/// Characters `encodeURIComponent`-style encoding leaves untouched.
const URL_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

#[derive(Debug)]
pub struct FingerprintError {
    source: serde_json::Error,
}

impl std::fmt::Display for FingerprintError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "serialize request for fingerprinting")
    }
}

impl std::error::Error for FingerprintError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// Position of a request inside an active series.
#[derive(Debug, Clone, Copy)]
pub struct SeriesContext<'a> {
    pub series_key: &'a str,
    pub past_keys: &'a [String],
}

impl SeriesContext<'_> {
    pub fn header_value(&self) -> String {
        format!("{}={}", self.series_key, self.past_keys.join(";"))
    }
}

/// Stable serialization order: field order below, map keys sorted by `BTreeMap`.
#[derive(Serialize)]
struct FingerprintInput<'a> {
    method: &'a str,
    url: &'a str,
    headers: &'a HeaderFields,
    trailers: &'a HeaderFields,
    body: EncodedBody,
}

/// Returns the request with the series chain injected as a header.
pub fn annotate_request(
    request: &RequestDescriptor,
    series: Option<SeriesContext<'_>>,
) -> RequestDescriptor {
    let mut annotated = request.clone();
    if let Some(series) = series {
        annotated
            .headers
            .insert(SERIES_HEADER.to_owned(), series.header_value());
    }
    annotated
}

/// Computes the fixture key for an (already series-annotated) request.
///
/// # Pipeline
///
/// 1. `scrub` runs over the request alone so secrets never reach the digest.
/// 2. `normalize` collapses volatile fields.
/// 3. The body goes through the body codec (text stays text, binary becomes base64).
/// 4. The result is serialized to canonical JSON and hashed with MD5.
///
/// The key is `METHOD_<url-component-encoded url, first 32 chars>_<hex digest>`.
pub fn compute_connection_key(
    request: &RequestDescriptor,
    scrub: Option<&ScrubFn>,
    normalize: Option<&NormalizeFn>,
) -> Result<String, FingerprintError> {
    let mut info = request.clone();
    if let Some(scrub) = scrub {
        info = scrub(Exchange::request_only(info)).request;
    }
    if let Some(normalize) = normalize {
        info = normalize(info);
    }

    let input = FingerprintInput {
        method: &info.method,
        url: &info.url,
        headers: &info.headers,
        trailers: &info.trailers,
        body: codec::encode(&info.body),
    };
    let canonical = serde_json::to_vec(&input).map_err(|source| FingerprintError { source })?;
    let digest = Md5::digest(&canonical);

    Ok(format!(
        "{}_{}_{}",
        info.method,
        url_key_prefix(&info.url),
        hex_encode(&digest)
    ))
}

fn url_key_prefix(url: &str) -> String {
    let mut encoded = utf8_percent_encode(url, URL_COMPONENT).to_string();
    // Percent-encoded output is ASCII, so byte truncation stays on a char boundary.
    encoded.truncate(KEY_URL_PREFIX_LEN);
    encoded
}

fn hex_encode(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes.iter().copied() {
        out.push(char::from(HEX[usize::from(byte >> 4)]));
        out.push(char::from(HEX[usize::from(byte & 0x0f)]));
    }
    out
}
