//! Shared overlay rendering (spec §4.9 "Overlay rendering").
//!
//! Draws directly on an interleaved RGB24 buffer. Renders on a clone of
//! the incoming frame; the caller's original `Frame` (and therefore
//! anything else holding its `Arc<[u8]>`) is never touched.

use std::sync::Arc;

use crate::types::{BBox, BehaviorEventType, Detection, Frame, LocalTrackId, Roi};

#[derive(Debug, Clone, Default)]
pub struct SystemInfoOverlay {
    pub detection_count: usize,
    pub tracked_count: usize,
    pub recognized_count: usize,
    pub fps: f32,
}

/// Everything the renderer needs for one frame. Built by the pipeline's
/// fan-out stage from the frame's `FrameResult`.
pub struct OverlayInput<'a> {
    pub detections: &'a [Detection],
    pub local_track_ids: &'a [LocalTrackId],
    pub face_labels: &'a [String],
    pub plate_labels: &'a [String],
    pub active_rois: &'a [Roi],
    pub alarm_active: bool,
    pub active_event_types: &'a [BehaviorEventType],
    pub system_info: SystemInfoOverlay,
}

/// Render all overlay layers onto a cloned copy of `frame`'s pixels,
/// assuming an RGB24 (3 bytes/pixel) layout. Never mutates `frame`.
pub fn render(frame: &Frame, input: &OverlayInput) -> Frame {
    let mut pixels: Vec<u8> = frame.pixels.to_vec();
    let stride = frame.width as usize * 3;

    for roi in input.active_rois {
        fill_polygon_translucent(&mut pixels, frame.width, frame.height, stride, &roi.polygon, roi_color(roi.priority));
    }

    for (idx, detection) in input.detections.iter().enumerate() {
        let color = class_color(&detection.class_label);
        draw_rect_outline(&mut pixels, frame.width, frame.height, stride, &detection.bbox, color);
        draw_corner_markers(&mut pixels, frame.width, frame.height, stride, &detection.bbox, color);
        if let Some(&track_id) = input.local_track_ids.get(idx) {
            stamp_marker(&mut pixels, frame.width, frame.height, stride, detection.bbox.x, detection.bbox.y, track_id as u8);
        }
        let pct = (detection.confidence * 100.0).round() as i32;
        draw_text(&mut pixels, frame.width, frame.height, stride, detection.bbox.x, detection.bbox.y - 8, &format!("{pct}%"), color);
    }

    let mut badge_y = 2;
    for label in input.face_labels.iter() {
        draw_badge(&mut pixels, frame.width, frame.height, stride, 2, badge_y, &format!("FACE:{label}"), [255, 255, 0]);
        badge_y += 9;
    }
    for label in input.plate_labels.iter() {
        draw_badge(&mut pixels, frame.width, frame.height, stride, 2, badge_y, &format!("PLATE:{label}"), [0, 255, 255]);
        badge_y += 9;
    }

    if input.alarm_active {
        draw_border_flash(&mut pixels, frame.width, frame.height, stride, [255, 0, 0]);
        let mut event_y = 2;
        for event_type in input.active_event_types {
            let label = event_type_label(*event_type);
            let x = frame.width as i32 - 6 - text_width(label);
            draw_badge(&mut pixels, frame.width, frame.height, stride, x, event_y, label, [255, 0, 0]);
            event_y += 9;
        }
    }

    let info = &input.system_info;
    let summary = format!("DET:{} TRK:{} REC:{}", info.detection_count, info.tracked_count, info.recognized_count);
    let fps_line = format!("FPS:{:.1}", info.fps);
    let summary_y = frame.height as i32 - 18;
    let fps_y = frame.height as i32 - 9;
    draw_badge(&mut pixels, frame.width, frame.height, stride, 2, summary_y, &summary, [255, 255, 255]);
    draw_badge(&mut pixels, frame.width, frame.height, stride, 2, fps_y, &fps_line, [255, 255, 255]);

    Frame {
        pixels: Arc::from(pixels),
        width: frame.width,
        height: frame.height,
        capture_time: frame.capture_time,
        sequence_number: frame.sequence_number,
        camera_id: frame.camera_id.clone(),
    }
}

fn class_color(class_label: &str) -> [u8; 3] {
    let mut hash: u32 = 2166136261;
    for b in class_label.bytes() {
        hash ^= b as u32;
        hash = hash.wrapping_mul(16777619);
    }
    [
        ((hash >> 16) & 0xFF) as u8,
        ((hash >> 8) & 0xFF) as u8,
        (hash & 0xFF) as u8,
    ]
}

fn roi_color(priority: u8) -> [u8; 3] {
    match priority {
        1 => [0, 128, 0],
        2 => [128, 128, 0],
        3 => [255, 165, 0],
        4 => [255, 69, 0],
        _ => [255, 0, 0],
    }
}

fn set_pixel(pixels: &mut [u8], width: u32, height: u32, stride: usize, x: i32, y: i32, color: [u8; 3]) {
    if x < 0 || y < 0 || x as u32 >= width || y as u32 >= height {
        return;
    }
    let offset = y as usize * stride + x as usize * 3;
    if offset + 2 < pixels.len() {
        pixels[offset] = color[0];
        pixels[offset + 1] = color[1];
        pixels[offset + 2] = color[2];
    }
}

fn draw_rect_outline(pixels: &mut [u8], width: u32, height: u32, stride: usize, bbox: &BBox, color: [u8; 3]) {
    for x in bbox.x..bbox.x + bbox.width {
        set_pixel(pixels, width, height, stride, x, bbox.y, color);
        set_pixel(pixels, width, height, stride, x, bbox.y + bbox.height - 1, color);
    }
    for y in bbox.y..bbox.y + bbox.height {
        set_pixel(pixels, width, height, stride, bbox.x, y, color);
        set_pixel(pixels, width, height, stride, bbox.x + bbox.width - 1, y, color);
    }
}

fn draw_corner_markers(pixels: &mut [u8], width: u32, height: u32, stride: usize, bbox: &BBox, color: [u8; 3]) {
    let len = (bbox.width.min(bbox.height) / 4).max(1);
    for corner in [
        (bbox.x, bbox.y, 1, 1),
        (bbox.x + bbox.width - 1, bbox.y, -1, 1),
        (bbox.x, bbox.y + bbox.height - 1, 1, -1),
        (bbox.x + bbox.width - 1, bbox.y + bbox.height - 1, -1, -1),
    ] {
        let (cx, cy, dx, dy) = corner;
        for i in 0..len {
            set_pixel(pixels, width, height, stride, cx + i * dx, cy, color);
            set_pixel(pixels, width, height, stride, cx, cy + i * dy, color);
        }
    }
}

fn stamp_marker(pixels: &mut [u8], width: u32, height: u32, stride: usize, x: i32, y: i32, value: u8) {
    // A single-pixel id marker; text rendering of the numeric id is a
    // rasterization concern this crate leaves to the overlay's consumer.
    set_pixel(pixels, width, height, stride, x, y.saturating_sub(2), [value, value, value]);
}

fn event_type_label(event_type: BehaviorEventType) -> &'static str {
    match event_type {
        BehaviorEventType::Intrusion => "INTRUSION",
        BehaviorEventType::UnauthorizedAccess => "UNAUTH ACCESS",
        BehaviorEventType::MotionDetected => "MOTION",
        BehaviorEventType::ObjectDetected => "OBJECT",
        BehaviorEventType::Loitering => "LOITERING",
        BehaviorEventType::AbandonedObject => "ABANDONED OBJ",
        BehaviorEventType::Other => "EVENT",
    }
}

/// Width in pixels a `draw_text` call of this string would occupy, 6px/glyph
/// (5 pixel-wide glyph plus 1px of spacing).
fn text_width(text: &str) -> i32 {
    text.chars().count() as i32 * 6
}

/// 5x7 pixel-font glyphs for the characters overlay text actually uses:
/// digits, uppercase letters, and a few punctuation marks. Each row's bits
/// run from the glyph's leftmost (bit 4) to rightmost (bit 0) column.
/// Unsupported characters (including space) render blank.
fn glyph(ch: char) -> [u8; 7] {
    match ch.to_ascii_uppercase() {
        '0' => [0x0E, 0x11, 0x13, 0x15, 0x19, 0x11, 0x0E],
        '1' => [0x04, 0x0C, 0x04, 0x04, 0x04, 0x04, 0x0E],
        '2' => [0x0E, 0x11, 0x01, 0x02, 0x04, 0x08, 0x1F],
        '3' => [0x1F, 0x02, 0x04, 0x02, 0x01, 0x11, 0x0E],
        '4' => [0x02, 0x06, 0x0A, 0x12, 0x1F, 0x02, 0x02],
        '5' => [0x1F, 0x10, 0x1E, 0x01, 0x01, 0x11, 0x0E],
        '6' => [0x06, 0x08, 0x10, 0x1E, 0x11, 0x11, 0x0E],
        '7' => [0x1F, 0x01, 0x02, 0x04, 0x08, 0x08, 0x08],
        '8' => [0x0E, 0x11, 0x11, 0x0E, 0x11, 0x11, 0x0E],
        '9' => [0x0E, 0x11, 0x11, 0x0F, 0x01, 0x02, 0x0C],
        'A' => [0x0E, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11],
        'B' => [0x1E, 0x11, 0x11, 0x1E, 0x11, 0x11, 0x1E],
        'C' => [0x0E, 0x11, 0x10, 0x10, 0x10, 0x11, 0x0E],
        'D' => [0x1C, 0x12, 0x11, 0x11, 0x11, 0x12, 0x1C],
        'E' => [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x1F],
        'F' => [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x10],
        'G' => [0x0E, 0x11, 0x10, 0x17, 0x11, 0x11, 0x0F],
        'H' => [0x11, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11],
        'I' => [0x0E, 0x04, 0x04, 0x04, 0x04, 0x04, 0x0E],
        'J' => [0x01, 0x01, 0x01, 0x01, 0x01, 0x11, 0x0E],
        'K' => [0x11, 0x12, 0x14, 0x18, 0x14, 0x12, 0x11],
        'L' => [0x10, 0x10, 0x10, 0x10, 0x10, 0x10, 0x1F],
        'M' => [0x11, 0x1B, 0x15, 0x15, 0x11, 0x11, 0x11],
        'N' => [0x11, 0x19, 0x15, 0x13, 0x11, 0x11, 0x11],
        'O' => [0x0E, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E],
        'P' => [0x1E, 0x11, 0x11, 0x1E, 0x10, 0x10, 0x10],
        'Q' => [0x0E, 0x11, 0x11, 0x11, 0x15, 0x12, 0x0D],
        'R' => [0x1E, 0x11, 0x11, 0x1E, 0x14, 0x12, 0x11],
        'S' => [0x0F, 0x10, 0x10, 0x0E, 0x01, 0x01, 0x1E],
        'T' => [0x1F, 0x04, 0x04, 0x04, 0x04, 0x04, 0x04],
        'U' => [0x11, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E],
        'V' => [0x11, 0x11, 0x11, 0x11, 0x11, 0x0A, 0x04],
        'W' => [0x11, 0x11, 0x11, 0x15, 0x15, 0x15, 0x0A],
        'X' => [0x11, 0x11, 0x0A, 0x04, 0x0A, 0x11, 0x11],
        'Y' => [0x11, 0x11, 0x0A, 0x04, 0x04, 0x04, 0x04],
        'Z' => [0x1F, 0x01, 0x02, 0x04, 0x08, 0x10, 0x1F],
        ':' => [0x00, 0x0C, 0x0C, 0x00, 0x0C, 0x0C, 0x00],
        '.' => [0x00, 0x00, 0x00, 0x00, 0x00, 0x0C, 0x0C],
        '%' => [0x19, 0x19, 0x02, 0x04, 0x08, 0x13, 0x13],
        '_' => [0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x1F],
        '-' => [0x00, 0x00, 0x00, 0x1F, 0x00, 0x00, 0x00],
        _ => [0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
    }
}

fn draw_text(pixels: &mut [u8], width: u32, height: u32, stride: usize, x: i32, y: i32, text: &str, color: [u8; 3]) {
    let mut cursor_x = x;
    for ch in text.chars() {
        let rows = glyph(ch);
        for (row, bits) in rows.iter().enumerate() {
            for col in 0..5i32 {
                if *bits & (1u8 << (4 - col as u32)) != 0 {
                    set_pixel(pixels, width, height, stride, cursor_x + col, y + row as i32, color);
                }
            }
        }
        cursor_x += 6;
    }
}

fn fill_rect(pixels: &mut [u8], width: u32, height: u32, stride: usize, x: i32, y: i32, w: i32, h: i32, color: [u8; 3], alpha: f32) {
    for row in y..y + h {
        for col in x..x + w {
            blend_pixel(pixels, width, height, stride, col, row, color, alpha);
        }
    }
}

/// Draws a translucent background panel behind `text` so it stays legible
/// over a busy frame, then rasterizes the text on top.
fn draw_badge(pixels: &mut [u8], width: u32, height: u32, stride: usize, x: i32, y: i32, text: &str, color: [u8; 3]) {
    let w = text_width(text) + 2;
    let h = 9;
    fill_rect(pixels, width, height, stride, x - 1, y - 1, w, h, [0, 0, 0], 0.6);
    draw_text(pixels, width, height, stride, x, y, text, color);
}

fn draw_border_flash(pixels: &mut [u8], width: u32, height: u32, stride: usize, color: [u8; 3]) {
    for x in 0..width as i32 {
        set_pixel(pixels, width, height, stride, x, 0, color);
        set_pixel(pixels, width, height, stride, x, height as i32 - 1, color);
    }
    for y in 0..height as i32 {
        set_pixel(pixels, width, height, stride, 0, y, color);
        set_pixel(pixels, width, height, stride, width as i32 - 1, y, color);
    }
}

fn fill_polygon_translucent(
    pixels: &mut [u8],
    width: u32,
    height: u32,
    stride: usize,
    polygon: &[(i32, i32)],
    color: [u8; 3],
) {
    if polygon.len() < 3 {
        return;
    }
    let min_y = polygon.iter().map(|p| p.1).min().unwrap().max(0);
    let max_y = polygon.iter().map(|p| p.1).max().unwrap().min(height as i32 - 1);
    for y in min_y..=max_y {
        for x in 0..width as i32 {
            if point_in_polygon(x, y, polygon) {
                blend_pixel(pixels, width, height, stride, x, y, color, 0.25);
            }
        }
    }
}

fn blend_pixel(pixels: &mut [u8], width: u32, height: u32, stride: usize, x: i32, y: i32, color: [u8; 3], alpha: f32) {
    if x < 0 || y < 0 || x as u32 >= width || y as u32 >= height {
        return;
    }
    let offset = y as usize * stride + x as usize * 3;
    if offset + 2 >= pixels.len() {
        return;
    }
    for c in 0..3 {
        let existing = pixels[offset + c] as f32;
        let blended = existing * (1.0 - alpha) + color[c] as f32 * alpha;
        pixels[offset + c] = blended.round().clamp(0.0, 255.0) as u8;
    }
}

fn point_in_polygon(x: i32, y: i32, polygon: &[(i32, i32)]) -> bool {
    let mut inside = false;
    let n = polygon.len();
    let mut j = n - 1;
    for i in 0..n {
        let (xi, yi) = polygon[i];
        let (xj, yj) = polygon[j];
        if ((yi > y) != (yj > y)) && (x < (xj - xi) * (y - yi) / (yj - yi) + xi) {
            inside = !inside;
        }
        j = i;
    }
    inside
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blank_frame(width: u32, height: u32) -> Frame {
        Frame {
            pixels: Arc::from(vec![0u8; (width * height * 3) as usize]),
            width,
            height,
            capture_time: chrono::Utc::now(),
            sequence_number: 0,
            camera_id: "cam1".into(),
        }
    }

    #[test]
    fn render_never_mutates_the_source_frame() {
        let frame = blank_frame(20, 20);
        let original = frame.pixels.clone();
        let detections = vec![Detection {
            bbox: BBox { x: 2, y: 2, width: 5, height: 5 },
            class_label: "person".into(),
            confidence: 0.9,
            embedding: None,
        }];
        let input = OverlayInput {
            detections: &detections,
            local_track_ids: &[1],
            face_labels: &[],
            plate_labels: &[],
            active_rois: &[],
            alarm_active: false,
            active_event_types: &[],
            system_info: SystemInfoOverlay::default(),
        };
        let rendered = render(&frame, &input);
        assert!(Arc::ptr_eq(&frame.pixels, &original));
        assert_ne!(&*rendered.pixels, &*original);
    }

    #[test]
    fn bbox_outline_is_drawn_within_bounds() {
        let frame = blank_frame(10, 10);
        let detections = vec![Detection {
            bbox: BBox { x: 1, y: 1, width: 4, height: 4 },
            class_label: "car".into(),
            confidence: 0.8,
            embedding: None,
        }];
        let input = OverlayInput {
            detections: &detections,
            local_track_ids: &[],
            face_labels: &[],
            plate_labels: &[],
            active_rois: &[],
            alarm_active: false,
            active_event_types: &[],
            system_info: SystemInfoOverlay::default(),
        };
        let rendered = render(&frame, &input);
        assert_ne!(rendered.pixels.iter().sum::<u8>(), 0);
    }

    #[test]
    fn system_info_panel_is_rasterized_onto_the_frame() {
        let frame = blank_frame(80, 40);
        let input = OverlayInput {
            detections: &[],
            local_track_ids: &[],
            face_labels: &[],
            plate_labels: &[],
            active_rois: &[],
            alarm_active: false,
            active_event_types: &[],
            system_info: SystemInfoOverlay {
                detection_count: 2,
                tracked_count: 1,
                recognized_count: 1,
                fps: 12.5,
            },
        };
        let rendered = render(&frame, &input);
        let bottom_rows_start = 80 * 3 * (40 - 18);
        assert!(rendered.pixels[bottom_rows_start..].iter().any(|&b| b != 0));
    }

    #[test]
    fn face_and_plate_labels_are_rasterized_not_discarded() {
        let frame = blank_frame(80, 40);
        let input = OverlayInput {
            detections: &[],
            local_track_ids: &[],
            face_labels: &["ALICE".to_string()],
            plate_labels: &["ABC123".to_string()],
            active_rois: &[],
            alarm_active: false,
            active_event_types: &[],
            system_info: SystemInfoOverlay::default(),
        };
        let rendered = render(&frame, &input);
        let top_rows_end = 80 * 3 * 20;
        assert!(rendered.pixels[..top_rows_end].iter().any(|&b| b != 0));
    }

    #[test]
    fn detection_confidence_label_is_rasterized_above_the_bbox() {
        let frame = blank_frame(40, 40);
        let detections = vec![Detection {
            bbox: BBox { x: 10, y: 15, width: 8, height: 8 },
            class_label: "person".into(),
            confidence: 0.91,
            embedding: None,
        }];
        let input = OverlayInput {
            detections: &detections,
            local_track_ids: &[],
            face_labels: &[],
            plate_labels: &[],
            active_rois: &[],
            alarm_active: false,
            active_event_types: &[],
            system_info: SystemInfoOverlay::default(),
        };
        let rendered = render(&frame, &input);
        let stride = 40 * 3;
        let label_row_start = stride * 7;
        let label_row_end = stride * 15;
        assert!(rendered.pixels[label_row_start..label_row_end].iter().any(|&b| b != 0));
    }

    #[test]
    fn alarm_banner_flashes_the_frame_border() {
        let frame = blank_frame(10, 10);
        let input = OverlayInput {
            detections: &[],
            local_track_ids: &[],
            face_labels: &[],
            plate_labels: &[],
            active_rois: &[],
            alarm_active: true,
            active_event_types: &[BehaviorEventType::Intrusion],
            system_info: SystemInfoOverlay::default(),
        };
        let rendered = render(&frame, &input);
        let stride = 10 * 3;
        assert_eq!(&rendered.pixels[0..3], &[255, 0, 0]);
        let _ = stride;
    }
}
