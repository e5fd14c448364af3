//! # index-helper
//!
//! Keeps a repository's index parsed and republished in named shared memory,
//! so short-lived processes can map a ready snapshot instead of re-reading
//! and re-parsing the index file on every invocation.
//!
//! ## Key Features
//!
//! - **Content-addressed**: segments are named after the index hash, so
//!   republishing identical content changes nothing
//! - **Lock-free readers**: the trailing hash is written last and is the only
//!   validity signal a reader needs
//! - **Verified**: each publish can be re-read through the client path and
//!   compared with its source before it becomes live
//! - **Split aware**: base and overlay indexes publish independently
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use index_helper::{load_index, IndexSource};
//! use std::path::Path;
//!
//! let loaded = load_index(Path::new(".git"), "git-", false)?;
//! if loaded.source == IndexSource::SharedMemory {
//!     println!("{} entries from shared memory", loaded.snapshot.len());
//! }
//! # Ok::<(), index_helper::IndexHelperError>(())
//! ```

pub mod config;
pub mod daemon;
pub mod error;
pub mod index;
pub mod publish;
pub mod shm;
pub mod verify;
pub mod watcher;

// Re-exports for convenience
pub use config::{HelperConfig, IdleTimeout};
pub use error::{IndexHelperError, Result};
pub use index::{FileIndexStore, IndexEntry, IndexSnapshot, IndexStore, ObjectId};
pub use publish::{load_index, open_published, IndexSource, LoadedIndex, Publisher, SegmentRegistry};
pub use shm::{Role, SegmentName};
pub use verify::{compare_snapshots, verify_segment};
pub use watcher::{ChangeNotifier, IndexWatcher, WatchCursor};
