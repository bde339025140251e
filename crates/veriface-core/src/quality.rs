//! One-shot card capture: quadrilateral detection and quality scoring.
//!
//! Classical pipeline, no models: grayscale → blur → Canny → morphological
//! close → external contours → Douglas-Peucker polygon approximation. Each
//! surviving quad is warped to a canonical rectangle and scored on coverage,
//! brightness, sharpness and tilt.

use crate::geometry;
use image::{imageops, GrayImage, RgbImage};
use imageproc::contours::{find_contours, BorderType};
use imageproc::edges::canny;
use imageproc::filter::{gaussian_blur_f32, laplacian_filter};
use imageproc::geometry::approximate_polygon_dp;
use imageproc::distance_transform::Norm;
use imageproc::morphology::close;

pub const CANONICAL_WIDTH: u32 = 700;
pub const CANONICAL_HEIGHT: u32 = 400;

const BLUR_SIGMA: f32 = 1.4;
const CANNY_LOW: f32 = 50.0;
const CANNY_HIGH: f32 = 150.0;
const APPROX_EPSILON_RATIO: f32 = 0.02;
const MIN_QUAD_AREA_RATIO: f32 = 0.12;
const ASPECT_MIN: f32 = 1.3;
const ASPECT_MAX: f32 = 2.2;
const TOP_SLOPE_PX: f32 = 15.0;
const EDGE_DIFF_PX: f32 = 20.0;
const MIN_COVERAGE: f32 = 0.70;
const MIN_BRIGHTNESS: f32 = 65.0;
const MIN_SHARPNESS: f32 = 80.0;
const NOT_READY_PENALTY: f32 = 0.8;

/// A detected card outline with its quality metrics. Valid only for the
/// assessment call that produced it.
#[derive(Debug, Clone)]
pub struct CardQuad {
    /// Ordered corners: top-left, top-right, bottom-right, bottom-left.
    pub corners: [(f32, f32); 4],
    /// Quad area as a fraction of frame area.
    pub coverage: f32,
    /// Mean intensity of the warped card.
    pub brightness: f32,
    /// Variance of the Laplacian response over the warped card.
    pub sharpness: f32,
    /// Human-readable guidance; empty when the capture is ready.
    pub feedback: Vec<String>,
    pub ready: bool,
}

/// Assessment result: the winning quad plus its canonical warp.
pub struct CardCapture {
    pub quad: CardQuad,
    pub warped: RgbImage,
}

/// Assess a single frame, returning the best card candidate or `None` when
/// no qualifying quadrilateral is found.
pub fn assess(frame: &RgbImage) -> Option<CardCapture> {
    let (fw, fh) = frame.dimensions();
    let frame_area = (fw * fh) as f32;
    if frame_area == 0.0 {
        return None;
    }

    let gray = imageops::grayscale(frame);
    let blurred = gaussian_blur_f32(&gray, BLUR_SIGMA);
    let edges = canny(&blurred, CANNY_LOW, CANNY_HIGH);
    let closed = close(&edges, Norm::LInf, 1);

    let mut best: Option<(f32, CardCapture)> = None;
    for contour in find_contours::<i32>(&closed) {
        if contour.border_type != BorderType::Outer {
            continue;
        }
        let outline: Vec<(f32, f32)> = contour
            .points
            .iter()
            .map(|p| (p.x as f32, p.y as f32))
            .collect();
        let epsilon = (APPROX_EPSILON_RATIO * geometry::polygon_perimeter(&outline)) as f64;
        let approx = approximate_polygon_dp(&contour.points, epsilon, true);
        if approx.len() != 4 {
            continue;
        }
        let corners = geometry::order_corners([
            (approx[0].x as f32, approx[0].y as f32),
            (approx[1].x as f32, approx[1].y as f32),
            (approx[2].x as f32, approx[2].y as f32),
            (approx[3].x as f32, approx[3].y as f32),
        ]);
        let area = geometry::polygon_area(&corners);
        if area < MIN_QUAD_AREA_RATIO * frame_area {
            continue;
        }
        if !aspect_in_envelope(&corners) {
            continue;
        }
        let Some(warped) = geometry::warp_quad(frame, corners, CANONICAL_WIDTH, CANONICAL_HEIGHT)
        else {
            continue;
        };

        let warped_gray = imageops::grayscale(&warped);
        let coverage = area / frame_area;
        let brightness = mean_brightness(&warped_gray);
        let sharpness = laplacian_variance(&warped_gray);

        let mut feedback = tilt_feedback(&corners);
        if coverage < MIN_COVERAGE {
            feedback.push("Move the card closer".to_string());
        }
        if brightness < MIN_BRIGHTNESS {
            feedback.push("Increase the lighting".to_string());
        }
        if sharpness < MIN_SHARPNESS {
            feedback.push("Hold the card steady".to_string());
        }
        let ready = feedback.is_empty();

        let score = coverage * if ready { 1.0 } else { NOT_READY_PENALTY };
        let better = match &best {
            // strict comparison keeps the first-seen quad on ties
            Some((best_score, _)) => score > *best_score,
            None => true,
        };
        if better {
            best = Some((
                score,
                CardCapture {
                    quad: CardQuad {
                        corners,
                        coverage,
                        brightness,
                        sharpness,
                        feedback,
                        ready,
                    },
                    warped,
                },
            ));
        }
    }

    best.map(|(_, capture)| capture)
}

/// Accept width/height ratios within the ID-card envelope, in either
/// orientation.
fn aspect_in_envelope(corners: &[(f32, f32); 4]) -> bool {
    let [tl, tr, br, bl] = *corners;
    let width = (geometry::distance(tl, tr) + geometry::distance(bl, br)) / 2.0;
    let height = (geometry::distance(tl, bl) + geometry::distance(tr, br)) / 2.0;
    if width <= 0.0 || height <= 0.0 {
        return false;
    }
    let ratio = width / height;
    let ratio = if ratio < 1.0 { 1.0 / ratio } else { ratio };
    (ASPECT_MIN..=ASPECT_MAX).contains(&ratio)
}

/// Tilt guidance from corner geometry: vertical slope across the top edge,
/// and left-vs-right edge length imbalance.
fn tilt_feedback(corners: &[(f32, f32); 4]) -> Vec<String> {
    let [tl, tr, br, bl] = *corners;
    let mut feedback = Vec::new();

    let top_slope = tr.1 - tl.1;
    if top_slope > TOP_SLOPE_PX {
        feedback.push("Lower the left edge".to_string());
    } else if top_slope < -TOP_SLOPE_PX {
        feedback.push("Lower the right edge".to_string());
    }

    let left_len = geometry::distance(tl, bl);
    let right_len = geometry::distance(tr, br);
    let edge_diff = left_len - right_len;
    if edge_diff > EDGE_DIFF_PX {
        feedback.push("Tilt the card forward".to_string());
    } else if edge_diff < -EDGE_DIFF_PX {
        feedback.push("Tilt the card back".to_string());
    }

    feedback
}

pub fn mean_brightness(gray: &GrayImage) -> f32 {
    let pixels = gray.as_raw();
    if pixels.is_empty() {
        return 0.0;
    }
    pixels.iter().map(|&p| p as f32).sum::<f32>() / pixels.len() as f32
}

/// Variance of a 3×3 Laplacian response; low values indicate blur.
pub fn laplacian_variance(gray: &GrayImage) -> f32 {
    let response = laplacian_filter(gray);
    let values = response.as_raw();
    if values.is_empty() {
        return 0.0;
    }
    let mean = values.iter().map(|&v| v as f64).sum::<f64>() / values.len() as f64;
    let variance = values
        .iter()
        .map(|&v| {
            let d = v as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / values.len() as f64;
    variance as f32
}
