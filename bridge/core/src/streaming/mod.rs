//! Streaming Aggregation
//!
//! Folds the fragments of a backend reply into the full answer and decides
//! when the partial answer is pushed to the chat.
//!
//! # Architecture
//!
//! ```text
//! FragmentStream ──▶ StreamAggregator ──▶ Publisher (chat message edit)
//!   Delta("Hel")        text += delta        every K-th fragment: publish(text, false)
//!   Delta("lo")         fragments += 1
//!   Done                                     always:              publish(text, true)
//! ```
//!
//! Chat platforms rate-limit message edits, so partial answers are only
//! published on every K-th fragment. The final answer is always published
//! once, superseding whatever partial edit came before it.
//!
//! # Example
//!
//! ```ignore
//! use bridge_core::streaming::{PublishPolicy, StreamAggregator};
//!
//! let mut aggregator = StreamAggregator::new(PublishPolicy::every(10));
//! let outcome = aggregator.run(stream, &publisher, &shutdown).await;
//! ```

mod aggregator;

pub use aggregator::{
    AggregatorState, PublishPolicy, Publisher, StreamAggregator, StreamOutcome, StreamState,
    DEFAULT_PUBLISH_EVERY,
};

// Re-export fragment types from backend for convenience
pub use crate::backend::{Fragment, FragmentStream};
