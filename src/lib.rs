//! Image caching and fetch pipeline for a feed reader.
//!
//! Remote article images are downloaded once, shared between every consumer that asks for
//! them while the download is in flight, and written through to a disk cache bounded by a
//! byte budget. Each download is tracked as a leaf in an observable task tree so a UI can
//! show, pause and abort network activity.

pub mod api;
pub mod config;
pub mod detect;
pub mod engine;
pub mod error;
pub mod net;
pub mod source;

pub use api::{init_logging, ImageService};
pub use config::EngineConfig;
pub use engine::cache::{CacheKey, DiskCache};
pub use engine::fetcher::{FetchCoordinator, FetchOrigin, ImageStream};
pub use error::FetchError;
pub use net::{NetManager, NetTask, TaskEvent, TaskId, TaskStatus};
