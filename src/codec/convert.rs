//! CPU pixel conversions for the software codec (BT.601, limited range)

use crate::capture::PixelFormat;

fn clamp(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = (i32::from(y) - 16) * 298;
    let d = i32::from(u) - 128;
    let e = i32::from(v) - 128;
    [
        clamp((c + 409 * e + 128) >> 8),
        clamp((c - 100 * d - 208 * e + 128) >> 8),
        clamp((c + 516 * d + 128) >> 8),
    ]
}

fn rgb_to_yuv(rgb: &[u8]) -> (u8, u8, u8) {
    let (r, g, b) = (i32::from(rgb[0]), i32::from(rgb[1]), i32::from(rgb[2]));
    let y = ((66 * r + 129 * g + 25 * b + 128) >> 8) + 16;
    let u = ((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128;
    let v = ((112 * r - 94 * g - 18 * b + 128) >> 8) + 128;
    (clamp(y), clamp(u), clamp(v))
}

/// Packed RGB24 to NV12 with 2x2 chroma subsampling (top-left sample)
pub fn rgb_to_nv12(rgb: &[u8], width: usize, height: usize, nv12: &mut Vec<u8>) {
    nv12.clear();
    nv12.resize(width * height * 3 / 2, 128);
    let (luma, chroma) = nv12.split_at_mut(width * height);

    for y in 0..height {
        for x in 0..width {
            let i = (y * width + x) * 3;
            let Some(px) = rgb.get(i..i + 3) else {
                return;
            };
            let (l, u, v) = rgb_to_yuv(px);
            luma[y * width + x] = l;
            if y % 2 == 0 && x % 2 == 0 {
                let c = (y / 2) * width + x;
                if let Some(pair) = chroma.get_mut(c..c + 2) {
                    pair[0] = u;
                    pair[1] = v;
                }
            }
        }
    }
}

/// Raw frame to packed RGB24; `None` for compressed formats or short input
pub fn to_rgb(
    format: PixelFormat,
    data: &[u8],
    width: usize,
    height: usize,
    stride: usize,
) -> Option<Vec<u8>> {
    let mut rgb = Vec::with_capacity(width * height * 3);
    match format {
        PixelFormat::Nv12 | PixelFormat::Yuv420 => {
            let stride = stride.max(width);
            if data.len() < stride * height * 3 / 2 {
                return None;
            }
            let luma_size = stride * height;
            for y in 0..height {
                for x in 0..width {
                    let l = data[y * stride + x];
                    let (u, v) = if format == PixelFormat::Nv12 {
                        let c = luma_size + (y / 2) * stride + (x / 2) * 2;
                        (data[c], data[c + 1])
                    } else {
                        let chroma_stride = stride / 2;
                        let u_plane = luma_size;
                        let v_plane = u_plane + chroma_stride * height / 2;
                        let c = (y / 2) * chroma_stride + x / 2;
                        (data[u_plane + c], data[v_plane + c])
                    };
                    rgb.extend_from_slice(&yuv_to_rgb(l, u, v));
                }
            }
        }
        PixelFormat::Yuyv => {
            let stride = stride.max(width * 2);
            if data.len() < stride * height {
                return None;
            }
            for y in 0..height {
                let row = &data[y * stride..y * stride + width * 2];
                for quad in row.chunks_exact(4) {
                    rgb.extend_from_slice(&yuv_to_rgb(quad[0], quad[1], quad[3]));
                    rgb.extend_from_slice(&yuv_to_rgb(quad[2], quad[1], quad[3]));
                }
            }
        }
        PixelFormat::Mjpeg | PixelFormat::H264 => return None,
    }
    Some(rgb)
}
