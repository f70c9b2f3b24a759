use anyhow::Context as _;
use http_body_util::BodyExt as _;
use hyper::Request;

use crate::{
    config::EngineOptions,
    descriptor::{ConnectionRecord, RequestDescriptor, ResponseDescriptor, header_fields_from_map},
    error::EngineError,
    matching::{self, SeriesContext},
    series::{ConsistencyDecision, DispatchTicket, HeadOutcome, Series, SeriesTracker},
    storage::FixtureStore,
    transform::{Exchange, NormalizeFn, ScrubFn},
    upstream::{HyperUpstream, RemoteOrigin, Upstream, build_upstream_request},
};

/// Per-request pipeline states after the inbound body has been buffered.
///
/// `AwaitingBody` is handled by [`FixtureEngine::forward_http`] before the
/// first state below is entered.
#[derive(Debug)]
enum PipelineState {
    LookupKey {
        request: RequestDescriptor,
    },
    StoreLookup {
        request: RequestDescriptor,
        annotated: RequestDescriptor,
        key: String,
        ticket: Option<DispatchTicket>,
    },
    ConsistencyCheck {
        request: RequestDescriptor,
        annotated: RequestDescriptor,
        key: String,
        ticket: DispatchTicket,
    },
    Forwarding {
        request: RequestDescriptor,
        annotated: RequestDescriptor,
        key: String,
    },
    Persisting {
        annotated: RequestDescriptor,
        key: String,
        response: ResponseDescriptor,
    },
    ReplayHit {
        key: String,
        record: ConnectionRecord,
    },
    Done(ResponseDescriptor),
    Errored(EngineError),
}

impl PipelineState {
    fn label(&self) -> &'static str {
        match self {
            Self::LookupKey { .. } => "lookup_key",
            Self::StoreLookup { .. } => "store_lookup",
            Self::ConsistencyCheck { .. } => "consistency_check",
            Self::Forwarding { .. } => "forwarding",
            Self::Persisting { .. } => "persisting",
            Self::ReplayHit { .. } => "replay_hit",
            Self::Done(_) => "done",
            Self::Errored(_) => "errored",
        }
    }
}

/// Record-or-replay engine: forwards unseen requests to the remote origin and
/// persists them as fixtures, replays stored fixtures otherwise.
pub struct FixtureEngine<S, U = HyperUpstream> {
    origin: RemoteOrigin,
    store: S,
    upstream: U,
    scrub: Option<ScrubFn>,
    normalize: Option<NormalizeFn>,
    prevent_recording: bool,
    series: SeriesTracker,
}

impl<S, U> std::fmt::Debug for FixtureEngine<S, U> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixtureEngine")
            .field("origin", &self.origin)
            .field("scrub", &self.scrub.is_some())
            .field("normalize", &self.normalize.is_some())
            .field("prevent_recording", &self.prevent_recording)
            .field("series", &self.series)
            .finish_non_exhaustive()
    }
}

impl<S: FixtureStore, U: Upstream> FixtureEngine<S, U> {
    pub fn new(options: EngineOptions, store: S, upstream: U) -> Result<Self, EngineError> {
        let EngineOptions {
            remote_origin,
            scrub,
            normalize,
            prevent_recording,
        } = options;
        let remote_origin = remote_origin
            .filter(|origin| !origin.trim().is_empty())
            .ok_or_else(|| EngineError::Config("a remote origin is required".to_owned()))?;
        let origin = RemoteOrigin::parse(&remote_origin).map_err(EngineError::Config)?;

        Ok(Self {
            origin,
            store,
            upstream,
            scrub,
            normalize,
            prevent_recording,
            series: SeriesTracker::default(),
        })
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn origin(&self) -> &RemoteOrigin {
        &self.origin
    }

    pub fn start_series(&self, series_key: &str) -> Result<(), EngineError> {
        self.series.start(series_key)?;
        tracing::info!(series = %series_key, "series started");
        Ok(())
    }

    pub fn stop_series(&self) {
        if let Some(series) = self.series.stop() {
            tracing::info!(
                series = %series.series_key,
                requests = series.past_request_keys.len(),
                new_recording = series.is_new_recording,
                "series stopped"
            );
        }
    }

    /// Snapshot of the active series, if any.
    pub fn active_series(&self) -> Option<Series> {
        self.series.active()
    }

    /// Key `request` would be stored under at the given series position,
    /// without touching series state.
    pub fn fixture_key(
        &self,
        request: &RequestDescriptor,
        series: Option<SeriesContext<'_>>,
    ) -> Result<String, EngineError> {
        let annotated = matching::annotate_request(request, series);
        Ok(matching::compute_connection_key(
            &annotated,
            self.scrub.as_ref(),
            self.normalize.as_ref(),
        )?)
    }

    /// Buffers the inbound body, then replays or records the exchange.
    pub async fn forward_http<B>(&self, request: Request<B>) -> Result<ResponseDescriptor, EngineError>
    where
        B: hyper::body::Body,
        B::Error: std::error::Error + Send + Sync + 'static,
    {
        let (parts, body) = request.into_parts();
        let collected = body
            .collect()
            .await
            .context("read inbound request body")
            .map_err(EngineError::InboundBody)?;
        let trailers = collected
            .trailers()
            .map(header_fields_from_map)
            .unwrap_or_default();
        let url = parts
            .uri
            .path_and_query()
            .map(|value| value.as_str().to_owned())
            .unwrap_or_else(|| parts.uri.path().to_owned());

        self.forward_request(RequestDescriptor {
            method: parts.method.as_str().to_owned(),
            url,
            headers: header_fields_from_map(&parts.headers),
            trailers,
            body: collected.to_bytes(),
        })
        .await
    }

    /// Replays the stored fixture for `request`, or forwards it upstream and
    /// records the exchange. Callers cannot tell the two paths apart.
    pub async fn forward_request(
        &self,
        request: RequestDescriptor,
    ) -> Result<ResponseDescriptor, EngineError> {
        let mut state = PipelineState::LookupKey { request };
        loop {
            tracing::trace!(state = state.label(), "pipeline transition");
            state = match state {
                PipelineState::LookupKey { request } => self.lookup_key(request),
                PipelineState::StoreLookup {
                    request,
                    annotated,
                    key,
                    ticket,
                } => self.store_lookup(request, annotated, key, ticket).await,
                PipelineState::ConsistencyCheck {
                    request,
                    annotated,
                    key,
                    ticket,
                } => self.consistency_check(request, annotated, key, ticket).await,
                PipelineState::Forwarding {
                    request,
                    annotated,
                    key,
                } => self.forwarding(request, annotated, key).await,
                PipelineState::Persisting {
                    annotated,
                    key,
                    response,
                } => self.persisting(annotated, key, response).await,
                PipelineState::ReplayHit { key, record } => replay(&key, &record),
                PipelineState::Done(response) => return Ok(response),
                PipelineState::Errored(err) => {
                    tracing::debug!(kind = err.kind(), "forward request failed: {err}");
                    return Err(err);
                }
            };
        }
    }

    /// Attempts to delete every listed fixture and reports the first failure.
    pub async fn remove_fixtures(&self, keys: &[String]) -> Result<(), EngineError> {
        if keys.is_empty() {
            return Ok(());
        }
        tracing::info!(count = keys.len(), "removing fixtures");
        let mut first_err = None;
        for key in keys {
            if let Err(err) = self.store.delete(key).await {
                tracing::warn!(key = %key, "failed to delete fixture: {err:#}");
                first_err.get_or_insert(err.context(format!("delete fixture `{key}`")));
            }
        }
        match first_err {
            Some(err) => Err(EngineError::Store(err)),
            None => Ok(()),
        }
    }

    // The key is computed and appended to the series chain before the first
    // await, so chain order is dispatch order.
    fn lookup_key(&self, request: RequestDescriptor) -> PipelineState {
        let dispatched = self.series.dispatch(|series| {
            let annotated = matching::annotate_request(&request, series);
            let key = matching::compute_connection_key(
                &annotated,
                self.scrub.as_ref(),
                self.normalize.as_ref(),
            )?;
            Ok::<_, EngineError>((key, annotated))
        });

        match dispatched {
            Ok((key, annotated, ticket)) => PipelineState::StoreLookup {
                request,
                annotated,
                key,
                ticket,
            },
            Err(err) => PipelineState::Errored(err),
        }
    }

    async fn store_lookup(
        &self,
        request: RequestDescriptor,
        annotated: RequestDescriptor,
        key: String,
        ticket: Option<DispatchTicket>,
    ) -> PipelineState {
        // Later requests of the series wait on this before judging their own miss.
        let head_resolution = ticket.as_ref().and_then(DispatchTicket::head_resolution);
        let found = match self.store.get(&key).await {
            Ok(found) => found,
            Err(err) => {
                return PipelineState::Errored(EngineError::Store(
                    err.context(format!("look up fixture `{key}`")),
                ));
            }
        };
        if let Some(head_resolution) = head_resolution {
            head_resolution.resolve(found.is_some());
        }

        if let Some(record) = found {
            tracing::debug!(key = %key, "fixture hit");
            return PipelineState::ReplayHit { key, record };
        }

        tracing::debug!(key = %key, "fixture miss");
        if self.prevent_recording {
            return PipelineState::Errored(EngineError::RecordingPrevented { key });
        }
        match ticket {
            Some(ticket) => PipelineState::ConsistencyCheck {
                request,
                annotated,
                key,
                ticket,
            },
            None => PipelineState::Forwarding {
                request,
                annotated,
                key,
            },
        }
    }

    async fn consistency_check(
        &self,
        request: RequestDescriptor,
        annotated: RequestDescriptor,
        key: String,
        ticket: DispatchTicket,
    ) -> PipelineState {
        let head = if ticket.position == 0 {
            HeadOutcome::Miss
        } else {
            ticket.head_outcome().await
        };
        let stale_keys = match self.series.check_miss(&ticket, head) {
            ConsistencyDecision::StartNewRecording => {
                tracing::info!(series = %ticket.series_key, "recording new series");
                return PipelineState::Forwarding {
                    request,
                    annotated,
                    key,
                };
            }
            ConsistencyDecision::ContinueNewRecording | ConsistencyDecision::SeriesEnded => {
                return PipelineState::Forwarding {
                    request,
                    annotated,
                    key,
                };
            }
            ConsistencyDecision::Corrupted { stale_keys } => stale_keys,
        };

        tracing::warn!(
            series = %ticket.series_key,
            position = ticket.position,
            key = %key,
            removed = stale_keys.len(),
            "series diverged from its recording; removing fixtures from the start of the series"
        );
        // A failed cleanup leaves the store inconsistent, so it wins over the
        // corruption error.
        if let Err(err) = self.remove_fixtures(&stale_keys).await {
            return PipelineState::Errored(err);
        }
        PipelineState::Errored(EngineError::CorruptedSeries {
            series_key: ticket.series_key,
            removed_keys: stale_keys,
        })
    }

    async fn forwarding(
        &self,
        request: RequestDescriptor,
        annotated: RequestDescriptor,
        key: String,
    ) -> PipelineState {
        let upstream_request = match build_upstream_request(&self.origin, &request) {
            Ok(upstream_request) => upstream_request,
            Err(err) => return PipelineState::Errored(EngineError::Upstream(err)),
        };
        tracing::debug!(
            key = %key,
            method = %upstream_request.method,
            uri = %upstream_request.uri,
            "forwarding request upstream"
        );

        match self.upstream.send(upstream_request).await {
            Ok(response) => PipelineState::Persisting {
                annotated,
                key,
                response,
            },
            Err(err) => PipelineState::Errored(EngineError::Upstream(err)),
        }
    }

    async fn persisting(
        &self,
        annotated: RequestDescriptor,
        key: String,
        response: ResponseDescriptor,
    ) -> PipelineState {
        let mut exchange = Exchange {
            request: annotated,
            response: Some(response),
        };
        if let Some(scrub) = self.scrub.as_ref() {
            exchange = scrub(exchange);
        }
        let Exchange {
            request,
            response: Some(response),
        } = exchange
        else {
            return PipelineState::Errored(EngineError::Usage(
                "scrub function dropped the response from the exchange".to_owned(),
            ));
        };

        let record = ConnectionRecord::from_exchange(&request, &response);
        if let Err(err) = self.store.set(&key, record.clone()).await {
            return PipelineState::Errored(EngineError::Store(
                err.context(format!("save fixture `{key}`")),
            ));
        }
        tracing::info!(key = %key, status = response.status_code, "fixture recorded");
        PipelineState::ReplayHit { key, record }
    }
}

fn replay(key: &str, record: &ConnectionRecord) -> PipelineState {
    match record.response.to_descriptor() {
        Ok(response) => PipelineState::Done(response),
        Err(err) => PipelineState::Errored(EngineError::Store(
            anyhow::Error::new(err).context(format!("decode fixture `{key}` response body")),
        )),
    }
}
