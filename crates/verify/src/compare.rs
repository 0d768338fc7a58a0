//! Fragment extraction and similarity metric.

use taskgrid_types::CropRegion;

/// Byte-wise similarity between two equal-length fragments, in `[0, 1]`.
///
/// `1.0` means identical; each byte contributes its normalized absolute
/// difference. Returns `None` for empty or length-mismatched inputs so the
/// caller can treat the comparison as inconclusive rather than wrong.
pub fn similarity(reference: &[u8], candidate: &[u8]) -> Option<f32> {
    if reference.is_empty() || reference.len() != candidate.len() {
        return None;
    }

    let total_diff: u64 = reference
        .iter()
        .zip(candidate.iter())
        .map(|(a, b)| u64::from(a.abs_diff(*b)))
        .sum();
    let max_diff = reference.len() as u64 * u64::from(u8::MAX);
    Some(1.0 - (total_diff as f64 / max_diff as f64) as f32)
}

/// Extract the bytes of `crop` from a row-major pixel buffer covering
/// `part`, with `bytes_per_pixel` bytes per pixel.
///
/// `crop` is given in the same coordinate space as `part` and must lie
/// entirely inside it; otherwise, or when the buffer is short, `None`.
pub fn extract_fragment(
    data: &[u8],
    part: CropRegion,
    crop: CropRegion,
    bytes_per_pixel: u64,
) -> Option<Vec<u8>> {
    if crop.x < part.x
        || crop.y < part.y
        || crop.x + crop.width > part.x + part.width
        || crop.y + crop.height > part.y + part.height
    {
        return None;
    }

    let stride = u64::from(part.width) * bytes_per_pixel;
    let expected = stride * u64::from(part.height);
    if (data.len() as u64) < expected {
        return None;
    }

    let rel_x = u64::from(crop.x - part.x);
    let rel_y = u64::from(crop.y - part.y);
    let row_bytes = u64::from(crop.width) * bytes_per_pixel;

    let mut fragment = Vec::with_capacity((row_bytes * u64::from(crop.height)) as usize);
    for row in 0..u64::from(crop.height) {
        let start = (rel_y + row) * stride + rel_x * bytes_per_pixel;
        let end = start + row_bytes;
        fragment.extend_from_slice(&data[start as usize..end as usize]);
    }
    Some(fragment)
}
