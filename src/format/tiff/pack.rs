//! Pixel packing for directory entry payloads.
//!
//! Acquisition hardware delivers RGB images with four samples per pixel
//! (the fourth is unused). TIFF strips store three, so every fourth sample
//! is dropped. Grayscale 8-bit buffers pass through untouched; 16-bit samples
//! are serialized in the session byte order into a pooled buffer.

use bytes::Bytes;
use tracing::warn;

use super::layout::IfdLayout;
use crate::io::{BufferPool, WriteBuffer};
use crate::metadata::PixelBuffer;

/// Drop every fourth byte of a 4-samples-per-pixel 8-bit buffer.
///
/// The packed length is exactly `src.len() * 3 / 4`.
pub fn pack_rgb_u8(src: &[u8]) -> Vec<u8> {
    let mut packed = Vec::with_capacity(src.len() * 3 / 4);
    for pixel in src.chunks_exact(4) {
        packed.extend_from_slice(&pixel[..3]);
    }
    packed
}

/// Drop every fourth sample of a 4-samples-per-pixel 16-bit buffer.
pub fn pack_rgb_u16(src: &[u16]) -> Vec<u16> {
    let mut packed = Vec::with_capacity(src.len() * 3 / 4);
    for pixel in src.chunks_exact(4) {
        packed.extend_from_slice(&pixel[..3]);
    }
    packed
}

/// Produce the pixel payload for one directory entry.
///
/// The result is always exactly `layout.bytes_per_image()` bytes long. A
/// buffer of the wrong size is logged and padded with zeros or truncated, so
/// the offsets already computed for the entry stay valid.
pub fn pack_pixels(layout: &IfdLayout, pixels: &PixelBuffer, pool: &BufferPool) -> WriteBuffer {
    let expected = layout.bytes_per_image() as usize;
    let pixel_count = layout.width as usize * layout.height as usize;

    match pixels {
        PixelBuffer::U8(bytes) => {
            if layout.rgb && layout.byte_depth == 1 && bytes.len() == pixel_count * 4 {
                WriteBuffer::Shared(Bytes::from(pack_rgb_u8(bytes)))
            } else if bytes.len() == expected {
                WriteBuffer::Shared(bytes.clone())
            } else {
                warn!(
                    "Pixel buffer has {} bytes, expected {}; resizing",
                    bytes.len(),
                    expected
                );
                let mut fixed = bytes.to_vec();
                fixed.resize(expected, 0);
                WriteBuffer::Shared(Bytes::from(fixed))
            }
        }
        PixelBuffer::U16(samples) => {
            let packed;
            let samples: &[u16] = if layout.rgb && samples.len() == pixel_count * 4 {
                packed = pack_rgb_u16(samples);
                &packed
            } else {
                &samples[..]
            };

            let mut buf = pool.checkout(expected);
            for &sample in samples {
                buf.extend_from_slice(&layout.byte_order.u16_bytes(sample));
            }
            if buf.len() != expected {
                warn!(
                    "Pixel buffer has {} bytes, expected {}; resizing",
                    buf.len(),
                    expected
                );
                buf.resize(expected, 0);
            }
            WriteBuffer::Pooled(buf)
        }
    }
}

/// All-zero pixel payload for blank entries.
pub fn blank_pixels(layout: &IfdLayout) -> Bytes {
    Bytes::from(vec![0u8; layout.bytes_per_image() as usize])
}
