//! Mask filtering and region extraction on single-channel planes.
//!
//! Masks are `u8` planes holding 0 or 1. Windows are clipped at the frame
//! border rather than padded.

use super::result::MotionArea;

/// Separable box blur of radius `radius`. Returns the blurred plane as `f32`.
pub fn box_blur(plane: &[u8], width: usize, height: usize, radius: usize) -> Vec<f32> {
    let src: Vec<f32> = plane.iter().map(|&v| v as f32).collect();
    if radius == 0 || width == 0 || height == 0 {
        return src;
    }
    let horizontal = blur_pass(&src, width, height, radius, true);
    blur_pass(&horizontal, width, height, radius, false)
}

fn blur_pass(src: &[f32], width: usize, height: usize, radius: usize, along_rows: bool) -> Vec<f32> {
    let mut out = vec![0.0f32; src.len()];
    let (lines, len) = if along_rows { (height, width) } else { (width, height) };
    let index = |line: usize, i: usize| {
        if along_rows {
            line * width + i
        } else {
            i * width + line
        }
    };
    for line in 0..lines {
        // Running sum over the clipped window [i - radius, i + radius].
        let mut sum = 0.0f32;
        let mut count = 0usize;
        for i in 0..radius.min(len) {
            sum += src[index(line, i)];
            count += 1;
        }
        for i in 0..len {
            let enter = i + radius;
            if enter < len {
                sum += src[index(line, enter)];
                count += 1;
            }
            if i > radius {
                sum -= src[index(line, i - radius - 1)];
                count -= 1;
            }
            out[index(line, i)] = sum / count as f32;
        }
    }
    out
}

fn extremum_pass(
    src: &[u8],
    width: usize,
    height: usize,
    radius: usize,
    along_rows: bool,
    take_max: bool,
) -> Vec<u8> {
    let mut out = vec![0u8; src.len()];
    for y in 0..height {
        for x in 0..width {
            let (pos, len) = if along_rows { (x, width) } else { (y, height) };
            let lo = pos.saturating_sub(radius);
            let hi = (pos + radius).min(len - 1);
            let mut acc = if take_max { 0u8 } else { 1u8 };
            for k in lo..=hi {
                let v = if along_rows {
                    src[y * width + k]
                } else {
                    src[k * width + x]
                };
                if take_max {
                    acc = acc.max(v);
                    if acc == 1 {
                        break;
                    }
                } else {
                    acc = acc.min(v);
                    if acc == 0 {
                        break;
                    }
                }
            }
            out[y * width + x] = acc;
        }
    }
    out
}

fn erode(mask: &[u8], width: usize, height: usize, radius: usize) -> Vec<u8> {
    let h = extremum_pass(mask, width, height, radius, true, false);
    extremum_pass(&h, width, height, radius, false, false)
}

fn dilate(mask: &[u8], width: usize, height: usize, radius: usize) -> Vec<u8> {
    let h = extremum_pass(mask, width, height, radius, true, true);
    extremum_pass(&h, width, height, radius, false, true)
}

/// Morphological opening (erode then dilate) with a square element of side `2 * radius + 1`.
pub fn open(mask: &[u8], width: usize, height: usize, radius: usize) -> Vec<u8> {
    if radius == 0 || mask.is_empty() {
        return mask.to_vec();
    }
    dilate(&erode(mask, width, height, radius), width, height, radius)
}

/// Morphological closing (dilate then erode) with a square element of side `2 * radius + 1`.
pub fn close(mask: &[u8], width: usize, height: usize, radius: usize) -> Vec<u8> {
    if radius == 0 || mask.is_empty() {
        return mask.to_vec();
    }
    erode(&dilate(mask, width, height, radius), width, height, radius)
}

/// 8-connected foreground regions of `mask`, in scan order of their first pixel.
pub fn connected_regions(mask: &[u8], width: usize, height: usize) -> Vec<MotionArea> {
    let mut visited = vec![false; mask.len()];
    let mut regions = Vec::new();
    let mut stack = Vec::new();

    for start in 0..mask.len() {
        if mask[start] == 0 || visited[start] {
            continue;
        }
        visited[start] = true;
        stack.push(start);

        let (mut min_x, mut min_y) = (usize::MAX, usize::MAX);
        let (mut max_x, mut max_y) = (0usize, 0usize);
        let mut area = 0u32;

        while let Some(idx) = stack.pop() {
            let x = idx % width;
            let y = idx / width;
            area += 1;
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);

            for ny in y.saturating_sub(1)..=(y + 1).min(height - 1) {
                for nx in x.saturating_sub(1)..=(x + 1).min(width - 1) {
                    let n = ny * width + nx;
                    if mask[n] != 0 && !visited[n] {
                        visited[n] = true;
                        stack.push(n);
                    }
                }
            }
        }

        regions.push(MotionArea {
            x: min_x as u32,
            y: min_y as u32,
            width: (max_x - min_x + 1) as u32,
            height: (max_y - min_y + 1) as u32,
            area,
        });
    }
    regions
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square_mask(w: usize, h: usize, x0: usize, y0: usize, side: usize) -> Vec<u8> {
        let mut mask = vec![0u8; w * h];
        for y in y0..y0 + side {
            for x in x0..x0 + side {
                mask[y * w + x] = 1;
            }
        }
        mask
    }

    #[test]
    fn opening_removes_speckle_and_keeps_blobs() {
        let (w, h) = (40, 40);
        let mut mask = square_mask(w, h, 10, 10, 12);
        mask[2 * w + 30] = 1; // isolated speckle
        let opened = open(&mask, w, h, 2);
        assert_eq!(opened[2 * w + 30], 0);
        assert_eq!(opened.iter().filter(|&&v| v == 1).count(), 144);
    }

    #[test]
    fn closing_fills_small_gaps() {
        let (w, h) = (40, 40);
        let mut mask = square_mask(w, h, 10, 10, 12);
        mask[15 * w + 15] = 0;
        mask[15 * w + 16] = 0;
        let closed = close(&mask, w, h, 2);
        assert_eq!(closed[15 * w + 15], 1);
        assert_eq!(closed[15 * w + 16], 1);
    }

    #[test]
    fn finds_separate_regions_with_boxes() {
        let (w, h) = (30, 20);
        let mut mask = square_mask(w, h, 1, 1, 3);
        for (i, v) in square_mask(w, h, 20, 10, 5).into_iter().enumerate() {
            mask[i] |= v;
        }
        let regions = connected_regions(&mask, w, h);
        assert_eq!(regions.len(), 2);
        assert_eq!(
            regions[0],
            MotionArea {
                x: 1,
                y: 1,
                width: 3,
                height: 3,
                area: 9
            }
        );
        assert_eq!(regions[1].area, 25);
        assert_eq!((regions[1].x, regions[1].y), (20, 10));
    }

    #[test]
    fn diagonal_pixels_are_connected() {
        let (w, h) = (4, 4);
        let mut mask = vec![0u8; 16];
        mask[0] = 1;
        mask[5] = 1;
        mask[10] = 1;
        assert_eq!(connected_regions(&mask, w, h).len(), 1);
    }

    #[test]
    fn blur_preserves_flat_plane() {
        let plane = vec![100u8; 25];
        let blurred = box_blur(&plane, 5, 5, 2);
        assert!(blurred.iter().all(|&v| (v - 100.0).abs() < 1e-3));
    }
}
