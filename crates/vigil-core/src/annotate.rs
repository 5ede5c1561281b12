//! Frame Annotation
//!
//! Draws tracked boxes onto a decoded frame (green for normal, red for
//! abnormal) with an id/score/confidence label for classified persons, and
//! encodes the result as the JPEG evidence shipped with alerts and stored by
//! the recorder.

use ab_glyph::{FontArc, PxScale};
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;

use crate::detect::{BBox, PersonVerdict};
use crate::tracker::TrackedPerson;

/// Evidence JPEG quality
pub const JPEG_QUALITY: u8 = 90;

const NORMAL_COLOR: Rgb<u8> = Rgb([0, 200, 0]);
const ABNORMAL_COLOR: Rgb<u8> = Rgb([220, 40, 40]);
const LABEL_SCALE: f32 = 16.0;

/// Copy the frame and overlay every tracked person. Persons with a verdict
/// get its color and label; persons still filling their buffer get a plain
/// normal box. Labels need a font; without one the annotation is box-only.
pub fn annotate_frame(
    frame: &RgbImage,
    tracked: &[TrackedPerson],
    verdicts: &[PersonVerdict],
    font: Option<&FontArc>,
) -> RgbImage {
    let mut canvas = frame.clone();
    for person in tracked {
        let verdict = verdicts.iter().find(|v| v.person_id == person.person_id);
        let abnormal = verdict.is_some_and(|v| v.is_abnormal);
        let color = if abnormal { ABNORMAL_COLOR } else { NORMAL_COLOR };

        draw_box(&mut canvas, &person.bbox, color);

        if let (Some(font), Some(verdict)) = (font, verdict) {
            let label = format!(
                "#{} {:.2} {}",
                verdict.person_id,
                verdict.score,
                verdict.confidence.as_str()
            );
            let x = (person.bbox.x as i32).max(0);
            let y = (person.bbox.y as i32 - LABEL_SCALE as i32 - 2).max(0);
            draw_text_mut(
                &mut canvas,
                color,
                x,
                y,
                PxScale::from(LABEL_SCALE),
                font,
                &label,
            );
        }
    }
    canvas
}

/// 2px hollow border, drawn as two nested rectangles
fn draw_box(canvas: &mut RgbImage, bbox: &BBox, color: Rgb<u8>) {
    let w = bbox.w.max(1.0) as u32;
    let h = bbox.h.max(1.0) as u32;
    let x = bbox.x as i32;
    let y = bbox.y as i32;

    draw_hollow_rect_mut(canvas, Rect::at(x, y).of_size(w, h), color);
    if w > 2 && h > 2 {
        draw_hollow_rect_mut(canvas, Rect::at(x + 1, y + 1).of_size(w - 2, h - 2), color);
    }
}

pub fn encode_jpeg(frame: &RgbImage, quality: u8) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut buf, quality);
    encoder.encode_image(frame)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::ConfidenceBucket;

    fn person(id: u32) -> TrackedPerson {
        TrackedPerson {
            person_id: id,
            bbox: BBox::new(8.0, 8.0, 16.0, 16.0),
        }
    }

    fn verdict(id: u32, abnormal: bool) -> PersonVerdict {
        PersonVerdict {
            person_id: id,
            frame_number: 0,
            bbox: BBox::new(8.0, 8.0, 16.0, 16.0),
            score: -3.2,
            is_abnormal: abnormal,
            confidence: ConfidenceBucket::High,
        }
    }

    #[test]
    fn test_abnormal_box_is_red() {
        let frame = RgbImage::new(64, 64);
        let canvas = annotate_frame(&frame, &[person(1)], &[verdict(1, true)], None);
        assert_eq!(*canvas.get_pixel(8, 8), ABNORMAL_COLOR);
        assert_eq!(*canvas.get_pixel(8 + 15, 8), ABNORMAL_COLOR);
        // interior untouched
        assert_eq!(*canvas.get_pixel(16, 16), Rgb([0, 0, 0]));
    }

    #[test]
    fn test_unclassified_person_gets_normal_box() {
        let frame = RgbImage::new(64, 64);
        let canvas = annotate_frame(&frame, &[person(2)], &[], None);
        assert_eq!(*canvas.get_pixel(8, 8), NORMAL_COLOR);
    }

    #[test]
    fn test_annotate_does_not_mutate_input() {
        let frame = RgbImage::new(64, 64);
        let _ = annotate_frame(&frame, &[person(1)], &[verdict(1, true)], None);
        assert_eq!(*frame.get_pixel(8, 8), Rgb([0, 0, 0]));
    }

    #[test]
    fn test_encode_jpeg_produces_payload() {
        let frame = RgbImage::new(32, 32);
        let bytes = encode_jpeg(&frame, JPEG_QUALITY).unwrap();
        assert!(!bytes.is_empty());
        // JPEG start-of-image marker
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
    }
}
