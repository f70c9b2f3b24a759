use std::{convert::Infallible, net::SocketAddr, sync::Arc};

use anyhow::Context as _;
use hyper::{
    Request, Response, StatusCode,
    body::Incoming,
    header::{self, HeaderValue},
    service::service_fn,
};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto::Builder as ConnectionBuilder,
};
use serde::Serialize;
use tokio::{net::TcpListener, sync::oneshot};

use crate::{
    config::{Config, EngineOptions},
    descriptor::{ResponseDescriptor, header_map_from_fields},
    engine::FixtureEngine,
    error::EngineError,
    storage::{ConfiguredStore, FixtureStore},
    upstream::{BufferedBody, HyperUpstream, Upstream, strip_hop_by_hop_headers},
};

pub type ConfiguredEngine = FixtureEngine<ConfiguredStore, HyperUpstream>;

#[derive(Debug)]
pub struct ProxyHandle<S, U> {
    pub listen_addr: SocketAddr,
    engine: Arc<FixtureEngine<S, U>>,
    shutdown_tx: oneshot::Sender<()>,
    join: tokio::task::JoinHandle<()>,
}

impl<S, U> ProxyHandle<S, U> {
    /// The engine behind the listener, for series bracketing and cleanup.
    pub fn engine(&self) -> &Arc<FixtureEngine<S, U>> {
        &self.engine
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.join.await;
    }
}

#[derive(Debug, Serialize)]
struct ErrorResponse<'a> {
    error: String,
    kind: &'a str,
}

pub fn build_engine(config: &Config) -> anyhow::Result<ConfiguredEngine> {
    let options = EngineOptions::from_config(config)?;
    let store = ConfiguredStore::from_config(&config.store)?;
    let upstream = HyperUpstream::new()?;
    Ok(FixtureEngine::new(options, store, upstream)?)
}

pub async fn serve(config: &Config) -> anyhow::Result<ProxyHandle<ConfiguredStore, HyperUpstream>> {
    let listen = config
        .proxy
        .as_ref()
        .map(|proxy| proxy.listen)
        .context("[proxy] listen address is required to serve")?;
    let engine = Arc::new(build_engine(config)?);
    serve_engine(listen, engine).await
}

pub async fn serve_engine<S, U>(
    listen: SocketAddr,
    engine: Arc<FixtureEngine<S, U>>,
) -> anyhow::Result<ProxyHandle<S, U>>
where
    S: FixtureStore + 'static,
    U: Upstream + 'static,
{
    let listener = TcpListener::bind(listen)
        .await
        .map_err(|err| anyhow::anyhow!("bind {listen}: {err}"))?;
    let listen_addr = listener
        .local_addr()
        .map_err(|err| anyhow::anyhow!("get local_addr: {err}"))?;
    tracing::info!(%listen_addr, remote = ?engine.origin(), "fixture proxy listening");

    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let accept_engine = Arc::clone(&engine);
    let join = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                accept = listener.accept() => {
                    let Ok((stream, _peer)) = accept else { continue };
                    let io = TokioIo::new(stream);
                    let engine = Arc::clone(&accept_engine);
                    tokio::spawn(async move {
                        let service = service_fn(move |req| proxy_handler(req, Arc::clone(&engine)));
                        let builder = ConnectionBuilder::new(TokioExecutor::new());
                        if let Err(err) = builder.serve_connection(io, service).await {
                            tracing::debug!("connection error: {err}");
                        }
                    });
                }
            }
        }
    });

    Ok(ProxyHandle {
        listen_addr,
        engine,
        shutdown_tx,
        join,
    })
}

async fn proxy_handler<S, U>(
    req: Request<Incoming>,
    engine: Arc<FixtureEngine<S, U>>,
) -> Result<Response<BufferedBody>, Infallible>
where
    S: FixtureStore,
    U: Upstream,
{
    let method = req.method().clone();
    let uri = req.uri().clone();
    match engine.forward_http(req).await {
        Ok(response) => Ok(response_from_descriptor(response)),
        Err(err) => {
            tracing::warn!(%method, %uri, kind = err.kind(), "request failed: {err}");
            Ok(error_response(&err))
        }
    }
}

fn response_from_descriptor(descriptor: ResponseDescriptor) -> Response<BufferedBody> {
    let ResponseDescriptor {
        status_code,
        headers,
        trailers,
        body,
    } = descriptor;
    let body_len = body.len();
    let has_trailers = !trailers.is_empty();

    let mut response = Response::new(BufferedBody::new(body, &trailers));
    *response.status_mut() =
        StatusCode::from_u16(status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    *response.headers_mut() = header_map_from_fields(&headers);
    strip_hop_by_hop_headers(response.headers_mut());
    if has_trailers {
        response.headers_mut().remove(header::CONTENT_LENGTH);
    } else if let Ok(content_length) = HeaderValue::from_str(&body_len.to_string()) {
        response
            .headers_mut()
            .insert(header::CONTENT_LENGTH, content_length);
    }
    response
}

fn status_for_engine_error(err: &EngineError) -> StatusCode {
    match err {
        EngineError::Config(_) | EngineError::Usage(_) | EngineError::Fingerprint(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
        EngineError::InboundBody(_) => StatusCode::BAD_REQUEST,
        EngineError::Store(_)
        | EngineError::Upstream(_)
        | EngineError::CorruptedSeries { .. }
        | EngineError::RecordingPrevented { .. } => StatusCode::BAD_GATEWAY,
    }
}

fn error_response(err: &EngineError) -> Response<BufferedBody> {
    let status = status_for_engine_error(err);
    let payload = ErrorResponse {
        error: err.to_string(),
        kind: err.kind(),
    };

    match serde_json::to_vec(&payload) {
        Ok(body) => {
            let mut response = Response::new(BufferedBody::from_bytes(body));
            *response.status_mut() = status;
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
            response
        }
        Err(serialize_err) => {
            tracing::debug!("failed to serialize error response: {serialize_err}");
            let mut response = Response::new(BufferedBody::from_bytes(err.to_string()));
            *response.status_mut() = status;
            response
        }
    }
}
