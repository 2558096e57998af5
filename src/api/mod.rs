// Public entry points: service wiring and logging setup.

pub mod image_api;
pub mod logging;

pub use image_api::ImageService;
pub use logging::init_logging;
