#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Png,
    Jpeg,
    Gif,
    Bmp,
    WebP,
    Ico,
    Unknown,
}

impl ImageFormat {
    pub fn mime_type(&self) -> &'static str {
        match self {
            ImageFormat::Png => "image/png",
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::Gif => "image/gif",
            ImageFormat::Bmp => "image/bmp",
            ImageFormat::WebP => "image/webp",
            ImageFormat::Ico => "image/x-icon",
            ImageFormat::Unknown => "application/octet-stream",
        }
    }

    pub fn is_known(&self) -> bool {
        *self != ImageFormat::Unknown
    }
}

/// Detect an image format from the first bytes of a body.
///
/// Needs at most 12 bytes; shorter headers only match formats whose magic fits.
pub fn detect_image_format(header: &[u8]) -> ImageFormat {
    // PNG: fixed 8-byte signature
    if header.len() >= 8 && header[0..8] == [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A] {
        return ImageFormat::Png;
    }

    // JPEG: SOI marker followed by the start of another marker
    if header.len() >= 3 && header[0..3] == [0xFF, 0xD8, 0xFF] {
        return ImageFormat::Jpeg;
    }

    // GIF: "GIF87a" or "GIF89a"
    if header.len() >= 6 && (&header[0..6] == b"GIF87a" || &header[0..6] == b"GIF89a") {
        return ImageFormat::Gif;
    }

    // WebP: RIFF container with "WEBP" form type at offset 8
    if header.len() >= 12 && &header[0..4] == b"RIFF" && &header[8..12] == b"WEBP" {
        return ImageFormat::WebP;
    }

    // BMP: "BM"
    if header.len() >= 2 && &header[0..2] == b"BM" {
        return ImageFormat::Bmp;
    }

    // ICO: reserved 0, type 1
    if header.len() >= 4 && header[0..4] == [0x00, 0x00, 0x01, 0x00] {
        return ImageFormat::Ico;
    }

    ImageFormat::Unknown
}
