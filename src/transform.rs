use std::{collections::BTreeMap, sync::Arc};

use anyhow::Context as _;
use bytes::Bytes;
use serde_json::Value;
use serde_json_path::JsonPath;

use crate::{
    config::{NormalizeConfig, RedactConfig},
    descriptor::{HeaderFields, RequestDescriptor, ResponseDescriptor},
};

pub const REDACTION_PLACEHOLDER: &str = "[REDACTED]";

/// The bundle handed to a scrub function.
///
/// When a fingerprint is computed only the request is present; at persistence
/// time the captured response is included as well.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange {
    pub request: RequestDescriptor,
    pub response: Option<ResponseDescriptor>,
}

impl Exchange {
    pub fn request_only(request: RequestDescriptor) -> Self {
        Self {
            request,
            response: None,
        }
    }
}

/// Redaction applied before hashing (request only) and before persistence
/// (request and response). Must be deterministic.
pub type ScrubFn = Arc<dyn Fn(Exchange) -> Exchange + Send + Sync>;

/// Request-side transform applied only to the fingerprint input.
pub type NormalizeFn = Arc<dyn Fn(RequestDescriptor) -> RequestDescriptor + Send + Sync>;

pub fn scrub_fn(f: impl Fn(Exchange) -> Exchange + Send + Sync + 'static) -> ScrubFn {
    Arc::new(f)
}

pub fn normalize_fn(
    f: impl Fn(RequestDescriptor) -> RequestDescriptor + Send + Sync + 'static,
) -> NormalizeFn {
    Arc::new(f)
}

/// Config-driven scrubber replacing sensitive values with a placeholder.
#[derive(Debug, Clone)]
pub struct Redactor {
    headers_lc: Vec<String>,
    query_params: Vec<String>,
    form_fields: Vec<String>,
    body_json: Vec<JsonPath>,
    placeholder: String,
}

impl Redactor {
    pub fn from_config(config: &RedactConfig) -> anyhow::Result<Self> {
        let body_json = config
            .body_json
            .iter()
            .map(|expression| {
                JsonPath::parse(expression)
                    .with_context(|| format!("parse redact.body_json expression `{expression}`"))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(Self {
            headers_lc: config
                .headers
                .iter()
                .map(|name| name.to_ascii_lowercase())
                .collect(),
            query_params: config.query_params.clone(),
            form_fields: config.form_fields.clone(),
            body_json,
            placeholder: config
                .placeholder
                .clone()
                .unwrap_or_else(|| REDACTION_PLACEHOLDER.to_owned()),
        })
    }

    pub fn scrub(&self, exchange: Exchange) -> Exchange {
        let Exchange {
            mut request,
            response,
        } = exchange;

        self.redact_headers(&mut request.headers);
        request.url = self.redact_url_query(&request.url);
        request.body = self.redact_request_body(&request.headers, request.body);

        let response = response.map(|mut response| {
            self.redact_headers(&mut response.headers);
            response.body = self.redact_body_json(response.body);
            response
        });

        Exchange { request, response }
    }

    pub fn into_scrub_fn(self) -> ScrubFn {
        Arc::new(move |exchange| self.scrub(exchange))
    }

    fn redact_headers(&self, headers: &mut HeaderFields) {
        for (name, value) in headers.iter_mut() {
            if self.headers_lc.iter().any(|configured| configured == name) {
                *value = self.placeholder.clone();
            }
        }
    }

    fn redact_url_query(&self, url: &str) -> String {
        if self.query_params.is_empty() {
            return url.to_owned();
        }
        let Some((path, query)) = url.split_once('?') else {
            return url.to_owned();
        };
        format!(
            "{path}?{}",
            redact_pairs(query, &self.query_params, &self.placeholder)
        )
    }

    fn redact_request_body(&self, headers: &HeaderFields, body: Bytes) -> Bytes {
        let is_form = headers
            .get("content-type")
            .is_some_and(|value| value.contains("application/x-www-form-urlencoded"));
        if is_form && !self.form_fields.is_empty() {
            let Ok(text) = std::str::from_utf8(&body) else {
                return body;
            };
            return Bytes::from(redact_pairs(text, &self.form_fields, &self.placeholder));
        }
        self.redact_body_json(body)
    }

    fn redact_body_json(&self, body: Bytes) -> Bytes {
        if self.body_json.is_empty() {
            return body;
        }

        let mut json: Value = match serde_json::from_slice(&body) {
            Ok(value) => value,
            Err(_) => {
                tracing::debug!(
                    body_len = body.len(),
                    "body is not valid JSON; skipping body redaction"
                );
                return body;
            }
        };

        let mut pointers = Vec::new();
        for path in &self.body_json {
            pointers.extend(
                path.query_located(&json)
                    .locations()
                    .map(|location| location.to_json_pointer()),
            );
        }
        if pointers.is_empty() {
            return body;
        }
        pointers.sort_unstable();
        pointers.dedup();

        let placeholder = Value::String(self.placeholder.clone());
        for pointer in pointers {
            if let Some(node) = json.pointer_mut(pointer.as_str()) {
                *node = placeholder.clone();
            }
        }

        match serde_json::to_vec(&json) {
            Ok(redacted) => Bytes::from(redacted),
            Err(_) => {
                tracing::debug!("failed to serialize redacted body; keeping original body");
                body
            }
        }
    }
}

fn redact_pairs(encoded: &str, names: &[String], placeholder: &str) -> String {
    encoded
        .split('&')
        .map(|segment| match segment.split_once('=') {
            Some((name, _)) if names.iter().any(|configured| configured == name) => {
                format!("{name}={placeholder}")
            }
            _ => segment.to_owned(),
        })
        .collect::<Vec<_>>()
        .join("&")
}

/// Config-driven normalizer: drops volatile headers from the fingerprint or
/// pins them to a constant.
#[derive(Debug, Clone, Default)]
pub struct HeaderNormalizer {
    ignore_lc: Vec<String>,
    pinned_lc: BTreeMap<String, String>,
}

impl HeaderNormalizer {
    pub fn from_config(config: &NormalizeConfig) -> Self {
        Self {
            ignore_lc: config
                .ignore_headers
                .iter()
                .map(|name| name.to_ascii_lowercase())
                .collect(),
            pinned_lc: config
                .header_values
                .iter()
                .map(|(name, value)| (name.to_ascii_lowercase(), value.clone()))
                .collect(),
        }
    }

    pub fn normalize(&self, mut request: RequestDescriptor) -> RequestDescriptor {
        request
            .headers
            .retain(|name, _| !self.ignore_lc.iter().any(|ignored| ignored == name));
        for (name, value) in request.headers.iter_mut() {
            if let Some(pinned) = self.pinned_lc.get(name) {
                value.clone_from(pinned);
            }
        }
        request
    }

    pub fn into_normalize_fn(self) -> NormalizeFn {
        Arc::new(move |request| self.normalize(request))
    }
}
