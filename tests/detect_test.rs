use bb_image_engine::detect::{detect_image_format, ImageFormat};

#[test]
fn test_detect_png() {
    let header = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 13];
    assert_eq!(detect_image_format(&header), ImageFormat::Png);
    assert_eq!(ImageFormat::Png.mime_type(), "image/png");
}

#[test]
fn test_detect_jpeg() {
    let header = [0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, b'J', b'F', b'I', b'F'];
    assert_eq!(detect_image_format(&header), ImageFormat::Jpeg);
}

#[test]
fn test_detect_gif_both_versions() {
    assert_eq!(detect_image_format(b"GIF87a\x01\x00"), ImageFormat::Gif);
    assert_eq!(detect_image_format(b"GIF89a\x01\x00"), ImageFormat::Gif);
}

#[test]
fn test_detect_webp() {
    // RIFF size field is irrelevant for detection.
    let mut header = Vec::new();
    header.extend_from_slice(b"RIFF");
    header.extend_from_slice(&1234u32.to_le_bytes());
    header.extend_from_slice(b"WEBPVP8 ");
    assert_eq!(detect_image_format(&header), ImageFormat::WebP);
}

#[test]
fn test_riff_without_webp_is_unknown() {
    let mut header = Vec::new();
    header.extend_from_slice(b"RIFF");
    header.extend_from_slice(&1234u32.to_le_bytes());
    header.extend_from_slice(b"WAVE");
    assert_eq!(detect_image_format(&header), ImageFormat::Unknown);
}

#[test]
fn test_detect_bmp_and_ico() {
    assert_eq!(detect_image_format(b"BM\x36\x00\x00\x00"), ImageFormat::Bmp);
    assert_eq!(detect_image_format(&[0, 0, 1, 0, 1, 0]), ImageFormat::Ico);
}

#[test]
fn test_html_error_page_is_unknown() {
    let body = b"<!DOCTYPE html><html><body>Not Found</body></html>";
    let format = detect_image_format(body);
    assert_eq!(format, ImageFormat::Unknown);
    assert!(!format.is_known());
}

#[test]
fn test_short_headers() {
    assert_eq!(detect_image_format(&[]), ImageFormat::Unknown);
    assert_eq!(detect_image_format(&[0xFF, 0xD8]), ImageFormat::Unknown);
    assert_eq!(detect_image_format(&[0xFF, 0xD8, 0xFF]), ImageFormat::Jpeg);
}
