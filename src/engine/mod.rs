// Engine: disk cache, fetch coordination and background maintenance.

pub mod cache;
pub mod fetcher;
pub mod stats;
pub mod sweeper;
