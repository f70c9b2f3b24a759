use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;

use crate::{error::EngineError, matching::SeriesContext};

/// An ordered recording session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Series {
    pub series_key: String,
    pub past_request_keys: Vec<String>,
    pub is_new_recording: bool,
    epoch: u64,
}

/// How the store lookup for the first request of a series turned out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadOutcome {
    Pending,
    /// The head was already recorded, so the series is being replayed.
    Hit,
    /// The head was missing, so the series is being recorded.
    Miss,
    /// The head lookup failed or was cancelled.
    Unknown,
}

type HeadSender = Arc<watch::Sender<HeadOutcome>>;

#[derive(Debug)]
enum SeriesState {
    Idle,
    Active { series: Series, head: HeadSender },
}

#[derive(Debug)]
struct TrackerInner {
    state: SeriesState,
    next_epoch: u64,
}

/// Where a dispatched request landed in the active series.
#[derive(Debug, Clone)]
pub struct DispatchTicket {
    pub series_key: String,
    pub position: usize,
    epoch: u64,
    head: HeadSender,
}

impl DispatchTicket {
    /// Waits until the head of the series has resolved its store lookup.
    ///
    /// Store lookups may complete out of dispatch order, so a later request
    /// must not judge its own miss before the head's outcome is known.
    pub async fn head_outcome(&self) -> HeadOutcome {
        let mut outcome = self.head.subscribe();
        let resolved = outcome
            .wait_for(|outcome| *outcome != HeadOutcome::Pending)
            .await
            .map(|resolved| *resolved);
        resolved.unwrap_or(HeadOutcome::Unknown)
    }

    /// Publishes the head outcome when dropped; resolves to
    /// [`HeadOutcome::Unknown`] unless [`HeadResolution::resolve`] ran first.
    ///
    /// Returns `None` for tickets that are not the head of their series.
    pub fn head_resolution(&self) -> Option<HeadResolution> {
        (self.position == 0).then(|| HeadResolution {
            head: Arc::clone(&self.head),
            outcome: HeadOutcome::Unknown,
        })
    }
}

/// Drop guard publishing the head's lookup outcome to later requests.
#[derive(Debug)]
pub struct HeadResolution {
    head: HeadSender,
    outcome: HeadOutcome,
}

impl HeadResolution {
    pub fn resolve(mut self, found: bool) {
        self.outcome = if found {
            HeadOutcome::Hit
        } else {
            HeadOutcome::Miss
        };
    }
}

impl Drop for HeadResolution {
    fn drop(&mut self) {
        self.head.send_replace(self.outcome);
    }
}

/// What to do with a store miss for a request dispatched inside a series.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsistencyDecision {
    /// First request of a series that has never been recorded.
    StartNewRecording,
    /// Later request of a series whose head is being recorded in this run.
    ContinueNewRecording,
    /// The chain diverged from a fully recorded series.
    Corrupted { stale_keys: Vec<String> },
    /// The series the request was dispatched into is no longer active.
    SeriesEnded,
}

/// Miss decision for position `position` given how the series head resolved.
///
/// Only a replayed head makes a later miss a divergence; when the head lookup
/// failed the chain is recorded rather than torn down.
pub fn decide_on_miss(position: usize, head: HeadOutcome) -> ConsistencyDecision {
    match (position, head) {
        (0, _) => ConsistencyDecision::StartNewRecording,
        (_, HeadOutcome::Hit) => ConsistencyDecision::Corrupted {
            stale_keys: Vec::new(),
        },
        _ => ConsistencyDecision::ContinueNewRecording,
    }
}

/// Holds at most one active series per engine.
#[derive(Debug)]
pub struct SeriesTracker {
    inner: Mutex<TrackerInner>,
}

impl Default for SeriesTracker {
    fn default() -> Self {
        Self {
            inner: Mutex::new(TrackerInner {
                state: SeriesState::Idle,
                next_epoch: 0,
            }),
        }
    }
}

impl SeriesTracker {
    pub fn start(&self, series_key: &str) -> Result<(), EngineError> {
        if series_key.trim().is_empty() {
            return Err(EngineError::Usage(
                "starting a series requires a non-empty series key".to_owned(),
            ));
        }

        let mut inner = self.lock();
        if let SeriesState::Active { series, .. } = &inner.state {
            return Err(EngineError::Usage(format!(
                "series `{}` is already active; stop it before starting `{series_key}`",
                series.series_key
            )));
        }

        let epoch = inner.next_epoch;
        inner.next_epoch += 1;
        let (head, _) = watch::channel(HeadOutcome::Pending);
        inner.state = SeriesState::Active {
            series: Series {
                series_key: series_key.to_owned(),
                past_request_keys: Vec::new(),
                is_new_recording: false,
                epoch,
            },
            head: Arc::new(head),
        };
        Ok(())
    }

    pub fn stop(&self) -> Option<Series> {
        match std::mem::replace(&mut self.lock().state, SeriesState::Idle) {
            SeriesState::Active { series, .. } => Some(series),
            SeriesState::Idle => None,
        }
    }

    pub fn active(&self) -> Option<Series> {
        match &self.lock().state {
            SeriesState::Active { series, .. } => Some(series.clone()),
            SeriesState::Idle => None,
        }
    }

    /// Computes a key with the current chain context and appends it to the
    /// chain in one critical section, so chain order equals dispatch order.
    /// Outside a series the key is computed without holding the lock.
    ///
    /// `compute_key` returns the key plus any by-product the caller wants back.
    pub fn dispatch<T, E>(
        &self,
        compute_key: impl FnOnce(Option<SeriesContext<'_>>) -> Result<(String, T), E>,
    ) -> Result<(String, T, Option<DispatchTicket>), E> {
        let mut inner = self.lock();
        let SeriesState::Active { series, head } = &mut inner.state else {
            drop(inner);
            let (key, extra) = compute_key(None)?;
            return Ok((key, extra, None));
        };

        let (key, extra) = compute_key(Some(SeriesContext {
            series_key: &series.series_key,
            past_keys: &series.past_request_keys,
        }))?;
        let ticket = DispatchTicket {
            series_key: series.series_key.clone(),
            position: series.past_request_keys.len(),
            epoch: series.epoch,
            head: Arc::clone(head),
        };
        series.past_request_keys.push(key.clone());
        Ok((key, extra, Some(ticket)))
    }

    /// Applies the miss rule for `ticket` once the head outcome is known,
    /// flagging the series as a new recording when the miss is at the head.
    pub fn check_miss(&self, ticket: &DispatchTicket, head: HeadOutcome) -> ConsistencyDecision {
        let mut inner = self.lock();
        let SeriesState::Active { series, .. } = &mut inner.state else {
            return ConsistencyDecision::SeriesEnded;
        };
        if series.epoch != ticket.epoch {
            return ConsistencyDecision::SeriesEnded;
        }

        match decide_on_miss(ticket.position, head) {
            ConsistencyDecision::StartNewRecording => {
                series.is_new_recording = true;
                ConsistencyDecision::StartNewRecording
            }
            ConsistencyDecision::Corrupted { .. } => ConsistencyDecision::Corrupted {
                stale_keys: series.past_request_keys[..ticket.position].to_vec(),
            },
            decision => decision,
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::{ConsistencyDecision, HeadOutcome, SeriesTracker, decide_on_miss};
    use crate::error::EngineError;

    fn dispatch(tracker: &SeriesTracker, key: &str) -> Option<super::DispatchTicket> {
        tracker
            .dispatch(|_| Ok::<_, EngineError>((key.to_owned(), ())))
            .unwrap()
            .2
    }

    #[test]
    fn start_rejects_empty_keys_and_double_start() {
        let tracker = SeriesTracker::default();
        assert!(matches!(tracker.start(""), Err(EngineError::Usage(_))));
        assert!(matches!(tracker.start("  "), Err(EngineError::Usage(_))));

        tracker.start("crud").unwrap();
        let err = tracker.start("other").unwrap_err();
        assert!(err.to_string().contains("already active"), "unexpected: {err}");
        assert_eq!(tracker.active().unwrap().series_key, "crud");
    }

    #[test]
    fn stop_is_idempotent_and_allows_restart() {
        let tracker = SeriesTracker::default();
        assert!(tracker.stop().is_none());
        tracker.start("one").unwrap();
        assert!(tracker.stop().is_some());
        assert!(tracker.stop().is_none());
        tracker.start("two").unwrap();
        let active = tracker.active().unwrap();
        assert!(active.past_request_keys.is_empty());
        assert!(!active.is_new_recording);
    }

    #[test]
    fn dispatch_outside_series_has_no_context() {
        let tracker = SeriesTracker::default();
        let (key, (), ticket) = tracker
            .dispatch(|context| {
                assert!(context.is_none());
                Ok::<_, EngineError>(("k".to_owned(), ()))
            })
            .unwrap();
        assert_eq!(key, "k");
        assert!(ticket.is_none());
    }

    #[test]
    fn dispatch_sees_prior_keys_and_records_in_order() {
        let tracker = SeriesTracker::default();
        tracker.start("crud").unwrap();

        for (idx, key) in ["a", "b", "c"].into_iter().enumerate() {
            let (_, (), ticket) = tracker
                .dispatch(|context| {
                    let context = context.expect("series context");
                    assert_eq!(context.series_key, "crud");
                    assert_eq!(context.past_keys.len(), idx);
                    Ok::<_, EngineError>((key.to_owned(), ()))
                })
                .unwrap();
            assert_eq!(ticket.unwrap().position, idx);
        }
        assert_eq!(tracker.active().unwrap().past_request_keys, ["a", "b", "c"]);
    }

    #[test]
    fn failed_key_computation_leaves_chain_untouched() {
        let tracker = SeriesTracker::default();
        tracker.start("crud").unwrap();
        let result = tracker.dispatch(|_| Err::<(String, ()), _>("boom"));
        assert!(result.is_err());
        assert!(tracker.active().unwrap().past_request_keys.is_empty());
    }

    #[test]
    fn dispatch_outside_series_releases_the_lock_while_hashing() {
        let tracker = SeriesTracker::default();
        let (_, active, ticket) = tracker
            .dispatch(|_| Ok::<_, EngineError>(("k".to_owned(), tracker.active())))
            .unwrap();
        assert!(active.is_none());
        assert!(ticket.is_none());
    }

    #[test]
    fn decision_table() {
        assert_eq!(
            decide_on_miss(0, HeadOutcome::Pending),
            ConsistencyDecision::StartNewRecording
        );
        assert_eq!(
            decide_on_miss(3, HeadOutcome::Miss),
            ConsistencyDecision::ContinueNewRecording
        );
        assert_eq!(
            decide_on_miss(2, HeadOutcome::Unknown),
            ConsistencyDecision::ContinueNewRecording
        );
        assert!(matches!(
            decide_on_miss(1, HeadOutcome::Hit),
            ConsistencyDecision::Corrupted { .. }
        ));
    }

    #[tokio::test]
    async fn later_tickets_wait_for_the_head_to_resolve() {
        let tracker = SeriesTracker::default();
        tracker.start("crud").unwrap();
        let head = dispatch(&tracker, "a").unwrap();
        let second = dispatch(&tracker, "b").unwrap();
        assert!(second.head_resolution().is_none());

        let resolution = head.head_resolution().unwrap();
        let waiter = tokio::spawn(async move { second.head_outcome().await });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        resolution.resolve(false);
        assert_eq!(waiter.await.unwrap(), HeadOutcome::Miss);
    }

    #[tokio::test]
    async fn dropped_head_resolution_reports_unknown() {
        let tracker = SeriesTracker::default();
        tracker.start("crud").unwrap();
        let head = dispatch(&tracker, "a").unwrap();
        let second = dispatch(&tracker, "b").unwrap();

        drop(head.head_resolution());
        assert_eq!(second.head_outcome().await, HeadOutcome::Unknown);
    }

    #[test]
    fn miss_at_head_marks_new_recording() {
        let tracker = SeriesTracker::default();
        tracker.start("crud").unwrap();
        let first = dispatch(&tracker, "a").unwrap();
        let second = dispatch(&tracker, "b").unwrap();

        assert_eq!(
            tracker.check_miss(&first, HeadOutcome::Miss),
            ConsistencyDecision::StartNewRecording
        );
        assert!(tracker.active().unwrap().is_new_recording);
        assert_eq!(
            tracker.check_miss(&second, HeadOutcome::Miss),
            ConsistencyDecision::ContinueNewRecording
        );
    }

    #[test]
    fn miss_after_replayed_head_reports_stale_prefix() {
        let tracker = SeriesTracker::default();
        tracker.start("crud").unwrap();
        dispatch(&tracker, "a");
        dispatch(&tracker, "b");
        let third = dispatch(&tracker, "c").unwrap();
        dispatch(&tracker, "d");

        assert_eq!(
            tracker.check_miss(&third, HeadOutcome::Hit),
            ConsistencyDecision::Corrupted {
                stale_keys: vec!["a".to_owned(), "b".to_owned()]
            }
        );
    }

    #[test]
    fn tickets_from_a_stopped_series_are_ignored() {
        let tracker = SeriesTracker::default();
        tracker.start("one").unwrap();
        dispatch(&tracker, "a");
        let stale = dispatch(&tracker, "b").unwrap();
        tracker.stop();
        assert_eq!(
            tracker.check_miss(&stale, HeadOutcome::Miss),
            ConsistencyDecision::SeriesEnded
        );

        tracker.start("one").unwrap();
        assert_eq!(
            tracker.check_miss(&stale, HeadOutcome::Miss),
            ConsistencyDecision::SeriesEnded
        );
    }
}
