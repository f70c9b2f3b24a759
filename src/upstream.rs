use std::{
    convert::Infallible,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use anyhow::Context as _;
use bytes::Bytes;
use http_body_util::BodyExt as _;
use hyper::{
    Request, Uri,
    body::{Frame, SizeHint},
    header::{self, HeaderMap, HeaderName},
};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};

use crate::descriptor::{
    HeaderFields, RequestDescriptor, ResponseDescriptor, header_fields_from_map,
    header_map_from_fields,
};

type UpstreamHttpsConnector = HttpsConnector<HttpConnector>;
type HttpClient = Client<UpstreamHttpsConnector, BufferedBody>;

/// Request ready to be sent to the remote origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamRequest {
    pub method: String,
    pub uri: Uri,
    pub headers: HeaderFields,
    pub trailers: HeaderFields,
    pub body: Bytes,
}

/// Outbound HTTP transport. Implementations must not follow redirects: each
/// hop is recorded as its own fixture.
pub trait Upstream: Send + Sync {
    fn send(
        &self,
        request: UpstreamRequest,
    ) -> impl Future<Output = anyhow::Result<ResponseDescriptor>> + Send;
}

/// Scheme, host, port and optional base path requests are forwarded to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteOrigin {
    scheme: String,
    host: String,
    port: Option<u16>,
    base_path: String,
}

impl RemoteOrigin {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let uri: Uri = raw
            .parse()
            .map_err(|err| format!("invalid remote origin `{raw}`: {err}"))?;
        let scheme = match uri.scheme_str() {
            Some(scheme @ ("http" | "https")) => scheme.to_owned(),
            Some(other) => {
                return Err(format!(
                    "unsupported remote origin scheme `{other}` (expected http or https)"
                ));
            }
            None => return Err(format!("remote origin `{raw}` must include a scheme")),
        };
        let host = uri
            .host()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| format!("remote origin `{raw}` must include a host"))?
            .to_owned();
        let base_path = match uri.path() {
            "/" => String::new(),
            path => path.to_owned(),
        };

        Ok(Self {
            scheme,
            host,
            port: uri.port_u16(),
            base_path,
        })
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    /// `Host` header value; the port is omitted when it is the scheme default.
    pub fn host_header(&self) -> String {
        match self.port {
            Some(80) if self.scheme == "http" => self.host.clone(),
            Some(443) if self.scheme == "https" => self.host.clone(),
            Some(port) => format!("{}:{port}", self.host),
            None => self.host.clone(),
        }
    }

    fn authority(&self) -> String {
        match self.port {
            Some(port) => format!("{}:{port}", self.host),
            None => self.host.clone(),
        }
    }
}

/// Combines the remote origin with the local path and query. Method, headers,
/// trailers and body are preserved except for `Host` and hop-by-hop headers.
pub fn build_upstream_request(
    origin: &RemoteOrigin,
    request: &RequestDescriptor,
) -> anyhow::Result<UpstreamRequest> {
    let mut target = format!(
        "{}://{}{}{}",
        origin.scheme,
        origin.authority(),
        origin.base_path,
        request.path()
    );
    if let Some(query) = request.query() {
        target.push('?');
        target.push_str(query);
    }
    let uri: Uri = target
        .parse()
        .with_context(|| format!("construct upstream uri `{target}`"))?;

    let mut headers = request.headers.clone();
    strip_hop_by_hop_fields(&mut headers);
    if headers.contains_key("host") {
        headers.insert("host".to_owned(), origin.host_header());
    }

    Ok(UpstreamRequest {
        method: request.method.clone(),
        uri,
        headers,
        trailers: request.trailers.clone(),
        body: request.body.clone(),
    })
}

const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn strip_hop_by_hop_fields(headers: &mut HeaderFields) {
    let listed: Vec<String> = headers
        .get("connection")
        .map(|value| {
            value
                .split(',')
                .map(|name| name.trim().to_ascii_lowercase())
                .filter(|name| !name.is_empty())
                .collect()
        })
        .unwrap_or_default();
    for name in listed {
        headers.remove(&name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

pub fn strip_hop_by_hop_headers(headers: &mut HeaderMap) {
    let mut to_remove = Vec::new();
    for value in headers.get_all(header::CONNECTION).iter() {
        let Ok(value) = value.to_str() else { continue };
        for name in value.split(',') {
            let name = name.trim();
            if name.is_empty() {
                continue;
            }
            let Ok(header_name) = HeaderName::from_bytes(name.as_bytes()) else {
                continue;
            };
            to_remove.push(header_name);
        }
    }

    for header_name in to_remove {
        headers.remove(header_name);
    }
    for header_name in HOP_BY_HOP_HEADERS {
        headers.remove(*header_name);
    }
}

/// A fully buffered body, optionally followed by trailers.
#[derive(Debug, Default)]
pub struct BufferedBody {
    data: Option<Bytes>,
    trailers: Option<HeaderMap>,
}

impl BufferedBody {
    pub fn new(data: Bytes, trailers: &HeaderFields) -> Self {
        Self {
            data: Some(data).filter(|data| !data.is_empty()),
            trailers: Some(header_map_from_fields(trailers)).filter(|map| !map.is_empty()),
        }
    }

    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        Self::new(data.into(), &HeaderFields::new())
    }
}

impl hyper::body::Body for BufferedBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        if let Some(data) = this.data.take() {
            return Poll::Ready(Some(Ok(Frame::data(data))));
        }
        Poll::Ready(this.trailers.take().map(|trailers| Ok(Frame::trailers(trailers))))
    }

    fn is_end_stream(&self) -> bool {
        self.data.is_none() && self.trailers.is_none()
    }

    fn size_hint(&self) -> SizeHint {
        // Trailers need chunked framing, so only advertise an exact length without them.
        if self.trailers.is_some() {
            return SizeHint::default();
        }
        let len = self.data.as_ref().map_or(0, |data| data.len() as u64);
        SizeHint::with_exact(len)
    }
}

fn ensure_rustls_crypto_provider() -> anyhow::Result<()> {
    if rustls::crypto::CryptoProvider::get_default().is_some() {
        return Ok(());
    }

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
        && rustls::crypto::CryptoProvider::get_default().is_none()
    {
        return Err(anyhow::anyhow!("install rustls ring crypto provider"));
    }
    Ok(())
}

/// [`Upstream`] backed by the hyper-util legacy client over rustls.
#[derive(Debug, Clone)]
pub struct HyperUpstream {
    client: HttpClient,
}

impl HyperUpstream {
    pub fn new() -> anyhow::Result<Self> {
        ensure_rustls_crypto_provider()?;
        let connector = HttpsConnectorBuilder::new()
            .with_native_roots()
            .map_err(|err| anyhow::anyhow!("load native TLS root certificates: {err}"))?
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .build();
        Ok(Self {
            client: Client::builder(TokioExecutor::new()).build(connector),
        })
    }
}

impl Upstream for HyperUpstream {
    async fn send(&self, request: UpstreamRequest) -> anyhow::Result<ResponseDescriptor> {
        let UpstreamRequest {
            method,
            uri,
            headers,
            trailers,
            body,
        } = request;

        let mut outbound = Request::builder()
            .method(method.as_str())
            .uri(uri.clone())
            .body(BufferedBody::new(body, &trailers))
            .with_context(|| format!("build upstream request {method} {uri}"))?;
        *outbound.headers_mut() = header_map_from_fields(&headers);

        let response = self
            .client
            .request(outbound)
            .await
            .with_context(|| format!("send upstream request {method} {uri}"))?;
        let (parts, body) = response.into_parts();
        let collected = body
            .collect()
            .await
            .with_context(|| format!("read upstream response body for {method} {uri}"))?;
        let trailers = collected
            .trailers()
            .map(header_fields_from_map)
            .unwrap_or_default();

        Ok(ResponseDescriptor {
            status_code: parts.status.as_u16(),
            headers: header_fields_from_map(&parts.headers),
            trailers,
            body: collected.to_bytes(),
        })
    }
}
