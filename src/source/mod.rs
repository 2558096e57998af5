// Data source abstraction: pluggable backends for fetching image bytes.

pub mod http_source;
pub mod traits;

pub use http_source::HttpSource;
pub use traits::{ImageSource, SourceBody, SourceInfo};
