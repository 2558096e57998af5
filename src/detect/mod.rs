// Content sniffing: decide whether a downloaded body is worth caching.

pub mod image;

pub use image::{detect_image_format, ImageFormat};
