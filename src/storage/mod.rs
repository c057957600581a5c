//! Relational store: schema, coalesce-upsert primitives, query surface, and
//! the reference-counted deletion paths the garbage collector rides on.

mod entries;
mod feeds;
mod resources;
mod schema;
mod types;

pub use entries::{EntryFilter, ENTRY_COLUMNS};
pub use feeds::FEED_COLUMNS;
pub use schema::Database;
pub use types::{
    content_hash, retained_by_cutoff, Content, Enclosure, EntryKey, EntryRecord, EntryServerData,
    FeedInput, FeedPolicy, FeedRecord, FeedServerData, JsonMap,
};

pub(crate) use entries::{get_entry_tx, update_entry_content, upsert_entry};
pub(crate) use feeds::{get_feed_tx, upsert_feed};
pub(crate) use resources::add_resources;
