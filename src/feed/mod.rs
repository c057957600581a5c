//! Feed synchronization: the parser-collaborator boundary and the
//! fetch-diff-upsert pipeline.

mod fetcher;
mod model;

pub use fetcher::{rearchive, sync, FeedFailure, SyncOptions, SyncReport};
pub use model::{parse_document, ParsedEntry, ParsedFeed};
