//! On-disk artifact store with atomic commits and age-based purging
//!
//! Artifacts are plain files laid out under a root directory, one file per
//! request path. Writes go to a uniquely named `.part.` sibling first and
//! become visible only through a rename on commit. A background
//! [`PurgeScheduler`] periodically removes entries older than a threshold.

mod error;
mod scheduler;
mod store;
mod types;

pub use error::{Result, StoreError};
pub use scheduler::{PurgeScheduler, PurgeSchedulerHandle};
pub use store::{ArtifactStore, PartialWrite, Purger};
pub use types::{PurgeEvent, PurgeSelector, StoreCount, StoreStats, PURGE_HISTORY_LEN};
