use base64::Engine as _;

use crate::CoreError;

/// One image attached to a completion request, still base64-encoded.
#[derive(Debug, Clone)]
pub struct ImageData {
    pub id: i32,
    /// Base64-encoded image file (PNG or JPEG).
    pub data: String,
}

/// An image bound to a slot: decoded pixels, and after encoding, the
/// embedding block spliced into the decode stream.
///
/// The slot exclusively owns both buffers; they are dropped on slot reset.
#[derive(Debug, Default)]
pub(crate) struct SlotImage {
    pub id: i32,
    pub request_encode: bool,
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Embedding rows this image occupies in the context (patches).
    pub n_tokens: usize,
    pub embedding: Vec<f32>,
    /// Text that must precede this image in the decode stream.
    pub prefix_prompt: String,
}

impl SlotImage {
    pub fn from_request(img: &ImageData) -> Result<Self, CoreError> {
        let (pixels, width, height) = decode_image(&img.data)?;
        Ok(Self {
            id: img.id,
            request_encode: true,
            pixels,
            width,
            height,
            n_tokens: 0,
            embedding: Vec::new(),
            prefix_prompt: String::new(),
        })
    }
}

/// Decode a base64 image payload into a raw RGB8 pixel buffer.
pub(crate) fn decode_image(data_b64: &str) -> Result<(Vec<u8>, u32, u32), CoreError> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(data_b64.trim())
        .map_err(|err| CoreError::InvalidImage(format!("invalid base64 payload: {err}")))?;
    let decoded = image::load_from_memory(&bytes)
        .map_err(|err| CoreError::InvalidImage(format!("unsupported image data: {err}")))?;
    let rgb = decoded.to_rgb8();
    let (width, height) = (rgb.width(), rgb.height());
    Ok((rgb.into_raw(), width, height))
}

// ── Tests ──────────────────────────────────────────────────────────────────────
