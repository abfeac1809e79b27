//! `statsig_core` is the local evaluation cache and event delivery core of a Statsig client SDK.
//!
//! # Overview
//!
//! [`EvaluationSnapshot`] is an immutable set of gate, dynamic config and layer results received
//! from the `initialize` endpoint. It is only ever replaced as a whole.
//!
//! [`LocalValueStore`] holds the current snapshot for one [`UserIdentity`] together with a table
//! of *sticky* layer values. A sticky lookup lets a user keep the value of an experiment they were
//! bucketed into for as long as that experiment stays active, even if the server has since moved
//! them elsewhere. Both the snapshot and the sticky values are persisted to a [`DurableStore`], so
//! they survive restarts.
//!
//! [`NetworkDispatcher`] sends requests through a [`Transport`] with a hard cap on concurrently
//! open requests; the rest wait in a FIFO queue. Failed requests are reported with their original
//! body so the caller can retry them. [`NetworkService`] builds `initialize` and `log_event`
//! requests on top of it, and [`EventBuffer`] batches analytics events and re-sends failed
//! payloads.
//!
//! Gate, config and layer names are looked up by [`HashedName`], never by their display name.
//!
//! # Error Handling
//!
//! Errors are represented by the [`Error`] enum. Lookups never fail: missing values, storage
//! failures and malformed entities all degrade to cached or default results.
//!
//! # Logging
//!
//! The crate uses the [`log`](https://docs.rs/log/latest/log/) crate with the `statsig` target.
//! Consider integrating a `log`-compatible logger implementation for better visibility into SDK
//! operations.

#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

mod config;
mod dispatcher;
mod durable_store;
mod error;
mod events;
mod hashed_name;
mod local_store;
mod network_service;
mod snapshot;
mod sticky;
pub mod transport;
mod user;

pub use config::{SdkMetadata, StatsigOptions};
pub use dispatcher::{DispatchError, DispatchResult, NetworkDispatcher};
pub use durable_store::{DurableStore, FileStore, InMemoryStore};
pub use error::{Error, Result};
pub use events::{Event, EventBuffer, MAX_FAILED_PAYLOADS};
pub use hashed_name::HashedName;
pub use local_store::LocalValueStore;
pub use network_service::NetworkService;
pub use snapshot::{ConfigResult, EvaluationSnapshot, DEFAULT_RULE_ID};
pub use transport::{ReqwestTransport, Transport};
pub use user::UserIdentity;
