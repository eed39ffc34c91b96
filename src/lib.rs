//! Resumable download engine with durable progress state.
//!
//! The pipeline: [`classify`](classify::classify) tags a URL, a
//! [`Resolver`](resolver::Resolver) turns it into a fetchable source, and
//! the [`Coordinator`](download::Coordinator) probes, streams, retries, and
//! verifies the transfer while checkpointing into the
//! [`StateStore`](state::StateStore) ledger so an interrupted download
//! continues from its last flushed byte.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::missing_panics_doc)]

pub mod classify;
pub mod config;
pub mod download;
pub mod progress;
pub mod resolver;
pub mod state;

pub use classify::{SourceKind, classify, looks_like_playlist};
pub use config::EngineConfig;
pub use download::{Coordinator, DownloadError, Outcome};
pub use progress::{ProgressEvent, ProgressSink, format_duration, format_rate, format_size};
pub use resolver::{DirectResolver, ResolvedSource, Resolver, resolver_for};
pub use state::{
    DownloadRecord, DownloadStatus, RecordPatch, ResumeCandidate, StateError, StateStore,
    partial_path,
};
