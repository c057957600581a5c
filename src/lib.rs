//! feedvault: a self-hosted feed aggregator engine.
//!
//! Fetches syndication feeds, stores their entries in SQLite, archives the
//! remote resources their content references into a local cache, rewrites
//! references to the cache, and reference-count garbage-collects cached
//! files. The HTTP API is a thin layer over [`service::Service`].

pub mod archive;
pub mod config;
pub mod error;
pub mod feed;
pub mod service;
pub mod storage;

pub use config::Config;
pub use error::Error;
pub use service::{FeedAction, Service};
