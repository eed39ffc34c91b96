//! The download engine: probe, stream, retry, and orchestration.
//!
//! Entry point is [`Coordinator::run`], which drives a URL + destination
//! pair to a terminal [`Outcome`] while checkpointing progress into the
//! state ledger.

pub mod constants;
pub mod coordinator;
pub mod error;
pub mod probe;
pub mod retry;
pub mod stream;

pub use coordinator::{Coordinator, Outcome};
pub use error::DownloadError;
pub use probe::{ProbeResult, probe};
pub use retry::{
    FailureType, RetryDecision, RetryPolicy, classify_error, parse_retry_after,
    retry_after_delay,
};
pub use stream::{StreamEnd, StreamOutcome, stream_to_part};
