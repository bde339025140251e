//! Geometric helpers shared by the capture and extraction pipelines.

use crate::types::BoxDetection;
use image::{imageops, Rgb, RgbImage};
use imageproc::geometric_transformations::{warp_into, Interpolation, Projection};

/// Order four unordered corner points as [top-left, top-right, bottom-right,
/// bottom-left].
///
/// Top-left minimizes x+y, bottom-right maximizes it; of the remaining
/// diagonal, top-right maximizes x−y and bottom-left minimizes it. The result
/// is invariant under any permutation of the input.
pub fn order_corners(points: [(f32, f32); 4]) -> [(f32, f32); 4] {
    let mut tl = points[0];
    let mut tr = points[0];
    let mut br = points[0];
    let mut bl = points[0];
    for p in points {
        if p.0 + p.1 < tl.0 + tl.1 {
            tl = p;
        }
        if p.0 + p.1 > br.0 + br.1 {
            br = p;
        }
        if p.0 - p.1 > tr.0 - tr.1 {
            tr = p;
        }
        if p.0 - p.1 < bl.0 - bl.1 {
            bl = p;
        }
    }
    [tl, tr, br, bl]
}

/// Shoelace area of a polygon.
pub fn polygon_area(points: &[(f32, f32)]) -> f32 {
    if points.len() < 3 {
        return 0.0;
    }
    let mut twice = 0.0;
    for i in 0..points.len() {
        let (x1, y1) = points[i];
        let (x2, y2) = points[(i + 1) % points.len()];
        twice += x1 * y2 - x2 * y1;
    }
    (twice / 2.0).abs()
}

/// Closed-polygon perimeter.
pub fn polygon_perimeter(points: &[(f32, f32)]) -> f32 {
    let mut total = 0.0;
    for i in 0..points.len() {
        let (x1, y1) = points[i];
        let (x2, y2) = points[(i + 1) % points.len()];
        total += ((x2 - x1).powi(2) + (y2 - y1).powi(2)).sqrt();
    }
    total
}

pub fn distance(a: (f32, f32), b: (f32, f32)) -> f32 {
    ((a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)).sqrt()
}

/// Downscale so the longest edge fits `cap`, preserving aspect. Frames
/// already within the cap are returned unchanged.
pub fn resize_long_edge(image: &RgbImage, cap: u32) -> RgbImage {
    let (w, h) = image.dimensions();
    let long = w.max(h);
    if long <= cap {
        return image.clone();
    }
    let scale = cap as f32 / long as f32;
    let nw = ((w as f32 * scale).round() as u32).max(1);
    let nh = ((h as f32 * scale).round() as u32).max(1);
    imageops::resize(image, nw, nh, imageops::FilterType::Triangle)
}

/// Rotate about the image center, expanding the canvas to hold the full
/// rotated bounds. Uncovered corners are filled black. Exact quarter turns
/// are lossless.
pub fn rotate_expanded(image: &RgbImage, degrees: u32) -> RgbImage {
    match degrees % 360 {
        0 => image.clone(),
        90 => imageops::rotate90(image),
        180 => imageops::rotate180(image),
        270 => imageops::rotate270(image),
        d => {
            let (w, h) = image.dimensions();
            let theta = (d as f32).to_radians();
            let (sin, cos) = (theta.sin().abs(), theta.cos().abs());
            let new_w = ((h as f32 * sin + w as f32 * cos).ceil() as u32).max(1);
            let new_h = ((h as f32 * cos + w as f32 * sin).ceil() as u32).max(1);
            let projection = Projection::translate(new_w as f32 / 2.0, new_h as f32 / 2.0)
                * Projection::rotate(theta)
                * Projection::translate(-(w as f32) / 2.0, -(h as f32) / 2.0);
            let mut out = RgbImage::new(new_w, new_h);
            warp_into(
                image,
                &projection,
                Interpolation::Bilinear,
                Rgb([0, 0, 0]),
                &mut out,
            );
            out
        }
    }
}

/// Bounding box of non-background content: pixels with any channel above
/// `threshold`. Returns (x1, y1, x2, y2) with exclusive ends, or `None` for
/// an entirely dark image.
pub fn content_bbox(image: &RgbImage, threshold: u8) -> Option<(u32, u32, u32, u32)> {
    let (w, h) = image.dimensions();
    let mut x1 = w;
    let mut y1 = h;
    let mut x2 = 0u32;
    let mut y2 = 0u32;
    let mut any = false;
    for (x, y, px) in image.enumerate_pixels() {
        if px.0.iter().any(|&c| c > threshold) {
            any = true;
            x1 = x1.min(x);
            y1 = y1.min(y);
            x2 = x2.max(x + 1);
            y2 = y2.max(y + 1);
        }
    }
    if any {
        Some((x1, y1, x2, y2))
    } else {
        None
    }
}

/// Crop a pixel rectangle, clamping to image bounds. Returns `None` when the
/// clamped region is empty.
pub fn crop_rect(image: &RgbImage, x1: i64, y1: i64, x2: i64, y2: i64) -> Option<RgbImage> {
    let (w, h) = image.dimensions();
    let cx1 = x1.clamp(0, w as i64) as u32;
    let cy1 = y1.clamp(0, h as i64) as u32;
    let cx2 = x2.clamp(0, w as i64) as u32;
    let cy2 = y2.clamp(0, h as i64) as u32;
    if cx2 <= cx1 || cy2 <= cy1 {
        return None;
    }
    Some(imageops::crop_imm(image, cx1, cy1, cx2 - cx1, cy2 - cy1).to_image())
}

/// Crop a detection box with symmetric padding proportional to box size.
pub fn crop_with_padding(image: &RgbImage, bbox: &BoxDetection, pad_ratio: f32) -> Option<RgbImage> {
    let pad_w = (bbox.width() * pad_ratio) as i64;
    let pad_h = (bbox.height() * pad_ratio) as i64;
    crop_rect(
        image,
        bbox.x1 as i64 - pad_w,
        bbox.y1 as i64 - pad_h,
        bbox.x2 as i64 + pad_w,
        bbox.y2 as i64 + pad_h,
    )
}

/// Crop a face box with asymmetric padding: equal horizontally, 1.25× on top
/// and 0.85× on the bottom, favoring forehead and hair over chin.
pub fn crop_face(image: &RgbImage, bbox: &BoxDetection, pad_ratio: f32) -> Option<RgbImage> {
    if bbox.width() <= 1.0 || bbox.height() <= 1.0 {
        return None;
    }
    let pad_w = bbox.width() * pad_ratio;
    let pad_h = bbox.height() * pad_ratio;
    crop_rect(
        image,
        (bbox.x1 - pad_w).round() as i64,
        (bbox.y1 - pad_h * 1.25).round() as i64,
        (bbox.x2 + pad_w).round() as i64,
        (bbox.y2 + pad_h * 0.85).round() as i64,
    )
}

/// Surround the image with a black border `ratio` of its size on each side.
pub fn pad_border(image: &RgbImage, ratio: f32) -> RgbImage {
    if ratio <= 0.0 {
        return image.clone();
    }
    let (w, h) = image.dimensions();
    let pad_x = (w as f32 * ratio) as u32;
    let pad_y = (h as f32 * ratio) as u32;
    let mut canvas = RgbImage::new(w + 2 * pad_x, h + 2 * pad_y);
    imageops::replace(&mut canvas, image, pad_x as i64, pad_y as i64);
    canvas
}

/// Upscale so the shorter side reaches `min_side`; images already large
/// enough are returned unchanged.
pub fn upscale_min_side(image: &RgbImage, min_side: u32) -> RgbImage {
    let (w, h) = image.dimensions();
    let short = w.min(h);
    if short >= min_side || short == 0 {
        return image.clone();
    }
    let scale = min_side as f32 / short as f32;
    imageops::resize(
        image,
        (w as f32 * scale).round() as u32,
        (h as f32 * scale).round() as u32,
        imageops::FilterType::Triangle,
    )
}

/// Perspective-warp the quad spanned by `corners` (ordered tl, tr, br, bl)
/// onto a `width`×`height` canvas.
pub fn warp_quad(
    image: &RgbImage,
    corners: [(f32, f32); 4],
    width: u32,
    height: u32,
) -> Option<RgbImage> {
    let to = [
        (0.0, 0.0),
        (width as f32, 0.0),
        (width as f32, height as f32),
        (0.0, height as f32),
    ];
    let projection = Projection::from_control_points(corners, to)?;
    let mut out = RgbImage::new(width, height);
    warp_into(
        image,
        &projection,
        Interpolation::Bilinear,
        Rgb([0, 0, 0]),
        &mut out,
    );
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const QUAD: [(f32, f32); 4] = [(10.0, 10.0), (90.0, 12.0), (88.0, 60.0), (12.0, 58.0)];

    #[test]
    fn corner_order_invariant_under_permutation() {
        let expected = order_corners(QUAD);
        let permutations: [[usize; 4]; 6] = [
            [0, 1, 2, 3],
            [3, 2, 1, 0],
            [1, 3, 0, 2],
            [2, 0, 3, 1],
            [3, 0, 1, 2],
            [1, 2, 3, 0],
        ];
        for perm in permutations {
            let shuffled = [QUAD[perm[0]], QUAD[perm[1]], QUAD[perm[2]], QUAD[perm[3]]];
            assert_eq!(order_corners(shuffled), expected, "perm {perm:?}");
        }
    }

    #[test]
    fn corner_order_names_match_positions() {
        let [tl, tr, br, bl] = order_corners(QUAD);
        assert_eq!(tl, (10.0, 10.0));
        assert_eq!(tr, (90.0, 12.0));
        assert_eq!(br, (88.0, 60.0));
        assert_eq!(bl, (12.0, 58.0));
    }

    #[test]
    fn shoelace_area_of_rectangle() {
        let rect = [(0.0, 0.0), (100.0, 0.0), (100.0, 50.0), (0.0, 50.0)];
        assert!((polygon_area(&rect) - 5000.0).abs() < 1e-3);
        // winding direction does not matter
        let reversed = [(0.0, 0.0), (0.0, 50.0), (100.0, 50.0), (100.0, 0.0)];
        assert!((polygon_area(&reversed) - 5000.0).abs() < 1e-3);
    }

    #[test]
    fn perimeter_of_rectangle() {
        let rect = [(0.0, 0.0), (100.0, 0.0), (100.0, 50.0), (0.0, 50.0)];
        assert!((polygon_perimeter(&rect) - 300.0).abs() < 1e-3);
    }

    #[test]
    fn quarter_turn_swaps_dimensions() {
        let img = RgbImage::new(120, 40);
        let rotated = rotate_expanded(&img, 90);
        assert_eq!(rotated.dimensions(), (40, 120));
        assert_eq!(rotate_expanded(&img, 180).dimensions(), (120, 40));
        assert_eq!(rotate_expanded(&img, 270).dimensions(), (40, 120));
    }

    #[test]
    fn diagonal_rotation_expands_canvas() {
        let img = RgbImage::new(100, 100);
        let rotated = rotate_expanded(&img, 45);
        let (w, h) = rotated.dimensions();
        // 100 * sqrt(2) ≈ 141.4
        assert!(w >= 141 && w <= 143, "w = {w}");
        assert!(h >= 141 && h <= 143, "h = {h}");
    }

    #[test]
    fn content_bbox_finds_bright_region() {
        let mut img = RgbImage::new(100, 80);
        for y in 20..40 {
            for x in 30..70 {
                img.put_pixel(x, y, Rgb([200, 200, 200]));
            }
        }
        assert_eq!(content_bbox(&img, 10), Some((30, 20, 70, 40)));
    }

    #[test]
    fn content_bbox_none_for_dark_image() {
        let img = RgbImage::from_pixel(50, 50, Rgb([5, 5, 5]));
        assert_eq!(content_bbox(&img, 10), None);
    }

    #[test]
    fn face_crop_pads_more_above_than_below() {
        let img = RgbImage::new(400, 400);
        let bbox = BoxDetection {
            x1: 150.0,
            y1: 150.0,
            x2: 250.0,
            y2: 250.0,
            confidence: 0.9,
            area_ratio: 0.0625,
        };
        let crop = crop_face(&img, &bbox, 0.15).unwrap();
        // width: 100 + 2*15; height: round(131.25..262.75) -> 131..263
        assert_eq!(crop.dimensions(), (130, 132));
    }

    #[test]
    fn crop_rect_clamps_to_bounds() {
        let img = RgbImage::new(50, 50);
        let crop = crop_rect(&img, -10, -10, 30, 30).unwrap();
        assert_eq!(crop.dimensions(), (30, 30));
        assert!(crop_rect(&img, 60, 60, 80, 80).is_none());
    }

    #[test]
    fn resize_long_edge_caps_and_preserves_aspect() {
        let img = RgbImage::new(2560, 1440);
        let resized = resize_long_edge(&img, 1280);
        assert_eq!(resized.dimensions(), (1280, 720));
        let small = RgbImage::new(640, 480);
        assert_eq!(resize_long_edge(&small, 1280).dimensions(), (640, 480));
    }

    #[test]
    fn pad_border_grows_canvas() {
        let img = RgbImage::from_pixel(100, 60, Rgb([255, 255, 255]));
        let padded = pad_border(&img, 0.25);
        assert_eq!(padded.dimensions(), (150, 90));
        // corners are black fill
        assert_eq!(padded.get_pixel(0, 0), &Rgb([0, 0, 0]));
        // original content is centered
        assert_eq!(padded.get_pixel(25, 15), &Rgb([255, 255, 255]));
    }

    #[test]
    fn upscale_reaches_min_side() {
        let img = RgbImage::new(100, 80);
        let up = upscale_min_side(&img, 256);
        assert_eq!(up.dimensions().1, 256);
        assert_eq!(up.dimensions().0, 320);
        let big = RgbImage::new(300, 300);
        assert_eq!(upscale_min_side(&big, 256).dimensions(), (300, 300));
    }

    #[test]
    fn warp_quad_produces_canonical_canvas() {
        let img = RgbImage::from_pixel(200, 200, Rgb([128, 128, 128]));
        let corners = [(20.0, 20.0), (180.0, 25.0), (175.0, 120.0), (25.0, 115.0)];
        let warped = warp_quad(&img, corners, 700, 400).unwrap();
        assert_eq!(warped.dimensions(), (700, 400));
    }
}
