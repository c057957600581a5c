//! Resource archiving: tag walking over HTML fragments and the
//! content-addressed download cache.

mod archiver;
mod html;

pub use archiver::{ArchivePolicy, ArchivedResource, Archiver};
pub use html::TagFilter;
