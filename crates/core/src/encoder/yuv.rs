//! NV21 to I420 conversion.
//!
//! NV21 stores a full-resolution Y plane followed by one interleaved plane of
//! V/U pairs at half resolution in both directions. I420 stores Y, then U,
//! then V as three separate planes. Rotation is applied during the copy so
//! the frame is only touched once.

use crate::encoder::Rotation;
use crate::frame::Size;

/// Convert `src` (NV21, `size`) into `dst` (I420), rotating clockwise by
/// `rotation`. Returns the size of the converted picture.
///
/// `dst` is resized as needed so it can be reused across frames. `size` must
/// have even dimensions and `src` must hold a complete frame.
pub fn nv21_to_i420(src: &[u8], size: Size, rotation: Rotation, dst: &mut Vec<u8>) -> Size {
    let (w, h) = (size.width as usize, size.height as usize);
    let (cw, ch) = (w / 2, h / 2);
    let luma_len = w * h;
    let chroma_len = cw * ch;

    dst.resize(luma_len + 2 * chroma_len, 0);
    let (y_out, uv_out) = dst.split_at_mut(luma_len);
    let (u_out, v_out) = uv_out.split_at_mut(chroma_len);

    let y_in = &src[..luma_len];
    let vu_in = &src[luma_len..luma_len + 2 * chroma_len];

    for y in 0..h {
        for x in 0..w {
            y_out[target(x, y, w, h, rotation)] = y_in[y * w + x];
        }
    }

    for cy in 0..ch {
        for cx in 0..cw {
            let i = target(cx, cy, cw, ch, rotation);
            let s = cy * w + 2 * cx;
            v_out[i] = vu_in[s];
            u_out[i] = vu_in[s + 1];
        }
    }

    if rotation.swaps_dimensions() {
        Size::new(size.height, size.width)
    } else {
        size
    }
}

/// Index in the rotated plane of source pixel `(x, y)` of a `w`x`h` plane.
#[inline]
fn target(x: usize, y: usize, w: usize, h: usize, rotation: Rotation) -> usize {
    match rotation {
        Rotation::Deg0 => y * w + x,
        // Rotated plane is h wide.
        Rotation::Deg90 => x * h + (h - 1 - y),
        Rotation::Deg180 => (h - 1 - y) * w + (w - 1 - x),
        Rotation::Deg270 => (w - 1 - x) * h + y,
    }
}
