//! JPEG payload encoding for wire responses.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use std::io::Cursor;

/// Encode an image as JPEG at the given quality and return the raw bytes.
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, image::ImageError> {
    let mut bytes = Vec::new();
    let encoder = JpegEncoder::new_with_quality(Cursor::new(&mut bytes), quality);
    image.write_with_encoder(encoder)?;
    Ok(bytes)
}

/// Base64 of the JPEG bytes, without any URI prefix.
pub fn jpeg_base64(image: &RgbImage, quality: u8) -> Result<String, image::ImageError> {
    Ok(BASE64.encode(encode_jpeg(image, quality)?))
}

/// `data:image/jpeg;base64,...` URI for embedding in JSON payloads.
pub fn jpeg_data_uri(image: &RgbImage, quality: u8) -> Result<String, image::ImageError> {
    Ok(format!("data:image/jpeg;base64,{}", jpeg_base64(image, quality)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn data_uri_has_jpeg_prefix_and_magic() {
        let img = RgbImage::from_pixel(16, 16, Rgb([120, 80, 40]));
        let uri = jpeg_data_uri(&img, 88).unwrap();
        assert!(uri.starts_with("data:image/jpeg;base64,"));
        let b64 = uri.trim_start_matches("data:image/jpeg;base64,");
        let bytes = BASE64.decode(b64).unwrap();
        // JPEG SOI marker
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn encoding_is_deterministic() {
        let img = RgbImage::from_pixel(8, 8, Rgb([10, 200, 30]));
        assert_eq!(jpeg_base64(&img, 88).unwrap(), jpeg_base64(&img, 88).unwrap());
    }
}
