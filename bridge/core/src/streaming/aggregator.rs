//! Stream Aggregator Implementation
//!
//! Consumes one fragment stream, accumulates its text and drives a throttled
//! publisher.

use std::time::Instant;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::backend::{Fragment, FragmentStream};
use crate::error::{BridgeError, Result};

// ============================================================================
// Configuration
// ============================================================================

/// Publish interval used when configuration does not provide one
pub const DEFAULT_PUBLISH_EVERY: u32 = 10;

/// How often partial answers are published
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PublishPolicy {
    /// Publish after every `every`-th fragment
    every: u32,
}

impl Default for PublishPolicy {
    fn default() -> Self {
        Self::every(DEFAULT_PUBLISH_EVERY)
    }
}

impl PublishPolicy {
    /// Publish after every `k`-th fragment (0 is treated as 1)
    #[must_use]
    pub fn every(k: u32) -> Self {
        Self { every: k.max(1) }
    }

    /// The configured interval
    #[must_use]
    pub fn interval(&self) -> u32 {
        self.every
    }

    /// Whether a partial publish is due after `fragments` fragments
    #[must_use]
    pub fn is_due(&self, fragments: u32) -> bool {
        fragments > 0 && fragments % self.every == 0
    }
}

// ============================================================================
// Publisher
// ============================================================================

/// Destination for partial and final answers
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Show `text` to the user; `is_final` marks the complete answer
    async fn publish(&self, text: &str, is_final: bool) -> Result<()>;
}

// ============================================================================
// State
// ============================================================================

/// Lifecycle of an aggregation run
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AggregatorState {
    /// No fragment consumed yet
    Idle,
    /// Consuming fragments
    Streaming,
    /// Answer complete and published
    Completed,
    /// Stream or final publish failed
    Failed,
    /// Stopped by the caller
    Cancelled,
}

impl AggregatorState {
    /// Whether the run has ended
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Text accumulated for one in-flight request
#[derive(Clone, Debug, Default)]
pub struct StreamState {
    /// Accumulated text so far
    pub text: String,
    /// Fragments received
    pub fragments: u32,
    /// Text of the last successful publish
    pub last_published: Option<String>,
}

/// How an aggregation run ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamOutcome {
    /// The backend finished and the final answer was published
    Completed {
        /// Complete answer
        text: String,
        /// Fragments received
        fragments: u32,
    },
    /// The stream or the final publish failed
    Failed {
        /// What went wrong
        error: BridgeError,
        /// Text accumulated before the failure
        partial: String,
    },
    /// The caller cancelled the run
    Cancelled {
        /// Text accumulated before cancellation
        partial: String,
    },
}

// ============================================================================
// Aggregator
// ============================================================================

/// Folds fragments and publishes under a [`PublishPolicy`]
#[derive(Debug)]
pub struct StreamAggregator {
    policy: PublishPolicy,
    state: AggregatorState,
    stream: StreamState,
    publishes: u32,
    started_at: Option<Instant>,
}

impl StreamAggregator {
    /// Create an idle aggregator
    #[must_use]
    pub fn new(policy: PublishPolicy) -> Self {
        Self {
            policy,
            state: AggregatorState::Idle,
            stream: StreamState::default(),
            publishes: 0,
            started_at: None,
        }
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> AggregatorState {
        self.state
    }

    /// Accumulated text and counters
    #[must_use]
    pub fn stream_state(&self) -> &StreamState {
        &self.stream
    }

    /// Successful publishes so far
    #[must_use]
    pub fn publishes(&self) -> u32 {
        self.publishes
    }

    /// Add a fragment; returns whether a partial publish is due
    fn accept(&mut self, delta: &str) -> bool {
        self.stream.text.push_str(delta);
        self.stream.fragments += 1;
        self.policy.is_due(self.stream.fragments)
            && self.stream.last_published.as_deref() != Some(self.stream.text.as_str())
    }

    async fn publish_partial<P: Publisher + ?Sized>(&mut self, publisher: &P) {
        match publisher.publish(&self.stream.text, false).await {
            Ok(()) => {
                self.publishes += 1;
                self.stream.last_published = Some(self.stream.text.clone());
                tracing::debug!(fragments = self.stream.fragments, "Published partial answer");
            }
            Err(e) => {
                // A missed intermediate edit is superseded by a later one
                tracing::warn!(
                    error = %e,
                    fragments = self.stream.fragments,
                    "Partial publish failed"
                );
            }
        }
    }

    async fn finish<P: Publisher + ?Sized>(&mut self, publisher: &P) -> StreamOutcome {
        let elapsed_ms = self
            .started_at
            .map(|s| s.elapsed().as_millis())
            .unwrap_or_default();

        match publisher.publish(&self.stream.text, true).await {
            Ok(()) => {
                self.publishes += 1;
                self.stream.last_published = Some(self.stream.text.clone());
                self.state = AggregatorState::Completed;
                tracing::info!(
                    fragments = self.stream.fragments,
                    publishes = self.publishes,
                    elapsed_ms = elapsed_ms as u64,
                    "Stream completed"
                );
                StreamOutcome::Completed {
                    text: self.stream.text.clone(),
                    fragments: self.stream.fragments,
                }
            }
            Err(e) => {
                let error = if matches!(e, BridgeError::Publish(_)) {
                    e
                } else {
                    BridgeError::Publish(e.to_string())
                };
                self.fail(error)
            }
        }
    }

    fn fail(&mut self, error: BridgeError) -> StreamOutcome {
        self.state = AggregatorState::Failed;
        tracing::warn!(
            error = %error,
            fragments = self.stream.fragments,
            "Stream failed"
        );
        StreamOutcome::Failed {
            error,
            partial: self.stream.text.clone(),
        }
    }

    /// Consume `stream` until it ends or `cancel` fires
    ///
    /// The stream is closed before this returns, whatever the outcome.
    pub async fn run<P: Publisher + ?Sized>(
        &mut self,
        mut stream: FragmentStream,
        publisher: &P,
        cancel: &CancellationToken,
    ) -> StreamOutcome {
        self.state = AggregatorState::Streaming;
        self.started_at = Some(Instant::now());

        let outcome = loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                next = stream.next() => Some(next),
            };

            match next {
                None => {
                    self.state = AggregatorState::Cancelled;
                    tracing::info!(fragments = self.stream.fragments, "Stream cancelled");
                    break StreamOutcome::Cancelled {
                        partial: self.stream.text.clone(),
                    };
                }
                Some(Some(Fragment::Delta(delta))) => {
                    if self.accept(&delta) {
                        self.publish_partial(publisher).await;
                    }
                }
                Some(Some(Fragment::Done)) => break self.finish(publisher).await,
                Some(Some(Fragment::Failed(error))) => break self.fail(error),
                Some(None) => {
                    break self.fail(BridgeError::Stream("stream already finished".to_string()))
                }
            }
        };

        stream.close();
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    /// Records every publish; optionally fails partial or final ones
    #[derive(Default)]
    struct RecordingPublisher {
        calls: Mutex<Vec<(String, bool)>>,
        fail_partial: bool,
        fail_final: bool,
    }

    #[async_trait]
    impl Publisher for RecordingPublisher {
        async fn publish(&self, text: &str, is_final: bool) -> Result<()> {
            if (is_final && self.fail_final) || (!is_final && self.fail_partial) {
                return Err(BridgeError::Publish("edit rejected".to_string()));
            }
            self.calls.lock().push((text.to_string(), is_final));
            Ok(())
        }
    }

    fn deltas(parts: &[&str], terminal: Fragment) -> FragmentStream {
        let mut fragments: Vec<Fragment> = parts
            .iter()
            .map(|p| Fragment::Delta((*p).to_string()))
            .collect();
        fragments.push(terminal);
        FragmentStream::from_fragments(fragments)
    }

    #[test]
    fn test_policy_zero_becomes_one() {
        assert_eq!(PublishPolicy::every(0).interval(), 1);
        assert_eq!(PublishPolicy::default().interval(), DEFAULT_PUBLISH_EVERY);
        assert!(!PublishPolicy::every(3).is_due(0));
        assert!(PublishPolicy::every(3).is_due(6));
    }

    #[tokio::test]
    async fn test_publishes_every_kth_and_final() {
        let publisher = RecordingPublisher::default();
        let mut aggregator = StreamAggregator::new(PublishPolicy::every(2));

        let outcome = aggregator
            .run(
                deltas(&["Hel", "lo, ", "world"], Fragment::Done),
                &publisher,
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(
            outcome,
            StreamOutcome::Completed {
                text: "Hello, world".to_string(),
                fragments: 3,
            }
        );
        assert_eq!(
            *publisher.calls.lock(),
            vec![
                ("Hello, ".to_string(), false),
                ("Hello, world".to_string(), true),
            ]
        );
        assert_eq!(aggregator.state(), AggregatorState::Completed);
        assert_eq!(aggregator.publishes(), 2);
    }

    #[tokio::test]
    async fn test_final_publish_even_when_aligned() {
        let publisher = RecordingPublisher::default();
        let mut aggregator = StreamAggregator::new(PublishPolicy::every(2));

        aggregator
            .run(
                deltas(&["a", "b"], Fragment::Done),
                &publisher,
                &CancellationToken::new(),
            )
            .await;

        let calls = publisher.calls.lock();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls.iter().filter(|(_, is_final)| *is_final).count(), 1);
        assert_eq!(calls[1], ("ab".to_string(), true));
    }

    #[tokio::test]
    async fn test_empty_stream_publishes_final_only() {
        let publisher = RecordingPublisher::default();
        let mut aggregator = StreamAggregator::new(PublishPolicy::every(10));

        let outcome = aggregator
            .run(deltas(&[], Fragment::Done), &publisher, &CancellationToken::new())
            .await;

        assert!(matches!(outcome, StreamOutcome::Completed { fragments: 0, .. }));
        assert_eq!(*publisher.calls.lock(), vec![(String::new(), true)]);
    }

    #[tokio::test]
    async fn test_stream_failure_keeps_partial_and_skips_final() {
        let publisher = RecordingPublisher::default();
        let mut aggregator = StreamAggregator::new(PublishPolicy::every(1));

        let outcome = aggregator
            .run(
                deltas(
                    &["par", "tial"],
                    Fragment::Failed(BridgeError::Stream("reset".to_string())),
                ),
                &publisher,
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(
            outcome,
            StreamOutcome::Failed {
                error: BridgeError::Stream("reset".to_string()),
                partial: "partial".to_string(),
            }
        );
        assert_eq!(aggregator.state(), AggregatorState::Failed);
        assert!(publisher.calls.lock().iter().all(|(_, is_final)| !is_final));
    }

    #[tokio::test]
    async fn test_partial_publish_failure_is_not_fatal() {
        let publisher = RecordingPublisher {
            fail_partial: true,
            ..Default::default()
        };
        let mut aggregator = StreamAggregator::new(PublishPolicy::every(1));

        let outcome = aggregator
            .run(
                deltas(&["a", "b", "c"], Fragment::Done),
                &publisher,
                &CancellationToken::new(),
            )
            .await;

        assert!(matches!(outcome, StreamOutcome::Completed { .. }));
        assert_eq!(*publisher.calls.lock(), vec![("abc".to_string(), true)]);
        assert_eq!(aggregator.stream_state().last_published.as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn test_final_publish_failure_fails_run() {
        let publisher = RecordingPublisher {
            fail_final: true,
            ..Default::default()
        };
        let mut aggregator = StreamAggregator::new(PublishPolicy::every(5));

        let outcome = aggregator
            .run(
                deltas(&["done"], Fragment::Done),
                &publisher,
                &CancellationToken::new(),
            )
            .await;

        assert!(matches!(
            outcome,
            StreamOutcome::Failed {
                error: BridgeError::Publish(_),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_cancellation_stops_without_error() {
        let publisher = RecordingPublisher::default();
        let mut aggregator = StreamAggregator::new(PublishPolicy::every(1));
        let cancel = CancellationToken::new();

        let (tx, stream) = FragmentStream::channel();
        tx.send(Fragment::Delta("half".to_string())).await.unwrap();

        let run = async {
            let outcome = aggregator.run(stream, &publisher, &cancel).await;
            (outcome, aggregator.state())
        };
        let trigger = async {
            tokio::task::yield_now().await;
            cancel.cancel();
        };
        let ((outcome, state), ()) = tokio::join!(run, trigger);

        assert_eq!(
            outcome,
            StreamOutcome::Cancelled {
                partial: "half".to_string(),
            }
        );
        assert_eq!(state, AggregatorState::Cancelled);
        assert!(tx.is_closed());
    }
}
