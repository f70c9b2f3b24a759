use std::collections::BTreeMap;

use bytes::Bytes;
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};

use crate::codec::{self, BodyDecodeError, EncodedBody};

/// Header and trailer maps keep lowercase names so lookups and hashing do not
/// depend on how a client happened to capitalise them.
pub type HeaderFields = BTreeMap<String, String>;

/// A fully buffered inbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestDescriptor {
    pub method: String,
    /// Path and query as received by the proxy (no scheme or authority).
    pub url: String,
    pub headers: HeaderFields,
    pub trailers: HeaderFields,
    pub body: Bytes,
}

impl RequestDescriptor {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            headers: HeaderFields::new(),
            trailers: HeaderFields::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn path(&self) -> &str {
        self.url
            .split_once('?')
            .map(|(path, _)| path)
            .unwrap_or(&self.url)
    }

    pub fn query(&self) -> Option<&str> {
        self.url.split_once('?').map(|(_, query)| query)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseDescriptor {
    pub status_code: u16,
    pub headers: HeaderFields,
    pub trailers: HeaderFields,
    pub body: Bytes,
}

impl ResponseDescriptor {
    pub fn new(status_code: u16) -> Self {
        Self {
            status_code,
            headers: HeaderFields::new(),
            trailers: HeaderFields::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedRequest {
    pub method: String,
    pub url: String,
    pub headers: HeaderFields,
    #[serde(default)]
    pub trailers: HeaderFields,
    pub body: EncodedBody,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedResponse {
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    pub headers: HeaderFields,
    #[serde(default)]
    pub trailers: HeaderFields,
    pub body: EncodedBody,
}

/// One fixture: the request that was recorded and the response to replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub request: PersistedRequest,
    pub response: PersistedResponse,
}

impl From<&RequestDescriptor> for PersistedRequest {
    fn from(request: &RequestDescriptor) -> Self {
        Self {
            method: request.method.clone(),
            url: request.url.clone(),
            headers: request.headers.clone(),
            trailers: request.trailers.clone(),
            body: codec::encode(&request.body),
        }
    }
}

impl From<&ResponseDescriptor> for PersistedResponse {
    fn from(response: &ResponseDescriptor) -> Self {
        Self {
            status_code: response.status_code,
            headers: response.headers.clone(),
            trailers: response.trailers.clone(),
            body: codec::encode(&response.body),
        }
    }
}

impl PersistedRequest {
    pub fn to_descriptor(&self) -> Result<RequestDescriptor, BodyDecodeError> {
        Ok(RequestDescriptor {
            method: self.method.clone(),
            url: self.url.clone(),
            headers: self.headers.clone(),
            trailers: self.trailers.clone(),
            body: Bytes::from(codec::decode(&self.body)?),
        })
    }
}

impl PersistedResponse {
    pub fn to_descriptor(&self) -> Result<ResponseDescriptor, BodyDecodeError> {
        Ok(ResponseDescriptor {
            status_code: self.status_code,
            headers: self.headers.clone(),
            trailers: self.trailers.clone(),
            body: Bytes::from(codec::decode(&self.body)?),
        })
    }
}

impl ConnectionRecord {
    pub fn from_exchange(request: &RequestDescriptor, response: &ResponseDescriptor) -> Self {
        Self {
            request: request.into(),
            response: response.into(),
        }
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Folds a hyper header map into lowercase name -> value fields. Repeated
/// headers are joined with `, ` the way HTTP allows list-valued headers to be
/// combined; non-UTF-8 bytes are replaced.
pub fn header_fields_from_map(headers: &HeaderMap) -> HeaderFields {
    let mut fields = HeaderFields::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes());
        fields
            .entry(name.as_str().to_owned())
            .and_modify(|existing: &mut String| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert_with(|| value.into_owned());
    }
    fields
}

pub fn header_map_from_fields(fields: &HeaderFields) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(fields.len());
    for (name, value) in fields {
        let Ok(header_name) = HeaderName::from_bytes(name.as_bytes()) else {
            tracing::debug!(header = %name, "skipping invalid header name");
            continue;
        };
        let Ok(header_value) = HeaderValue::from_str(value) else {
            tracing::debug!(header = %name, "skipping invalid header value");
            continue;
        };
        headers.append(header_name, header_value);
    }
    headers
}
