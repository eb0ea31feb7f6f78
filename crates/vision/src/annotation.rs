//! CPU drawing of detection boxes and labels onto frames.
//!
//! Text uses a built-in 5x7 bitmap font so no font file is needed at runtime.

use image::{Rgb, RgbImage};
use imageproc::{
    drawing::{draw_filled_rect_mut, draw_hollow_rect_mut},
    rect::Rect,
};
use ml_core::Detection;
use video_ingest::Frame;

const GLYPH_ADVANCE: i32 = 6;
const GLYPH_HEIGHT: i32 = 7;
const LABEL_BG: Rgb<u8> = Rgb([15, 23, 42]);
const DEFAULT_COLOR: Rgb<u8> = Rgb([225, 213, 203]);

/// Box colour for a detection label.
pub fn label_color(label: &str) -> Rgb<u8> {
    let rgb = match label {
        "nino" | "child" => [120, 187, 72],
        "knife" | "cuchillo" => [68, 68, 239],
        "stairs" | "escaleras" => [11, 158, 245],
        "cooker" | "kitchen" | "cocina" => [235, 99, 37],
        "oven" | "horno" => [241, 102, 99],
        "pot" | "pan" | "olla" => [153, 72, 236],
        "handrail" | "baranda" => [247, 85, 168],
        "chair" | "silla" => [238, 211, 34],
        "bar" | "barra" => [246, 130, 59],
        "table" | "mesa" => [129, 185, 16],
        "stool" | "taburete" => [21, 204, 250],
        "counter" | "mostrador" => [60, 146, 251],
        "shelf" | "estante" => [153, 211, 52],
        "tijeras" | "scissors" => [0, 140, 255],
        _ => return DEFAULT_COLOR,
    };
    Rgb(rgb)
}

/// Caption drawn above a detection box.
pub fn label_text(det: &Detection) -> String {
    format!("{} {:.2} ({})", det.label, det.confidence, det.source.label())
}

/// Copy `frame` and draw every detection on it.
pub fn annotate(frame: &Frame, detections: &[Detection]) -> Frame {
    let mut image = frame.image.clone();
    for det in detections {
        let color = label_color(&det.label);
        draw_box(&mut image, det, color);
        let text = label_text(det);
        let x = det.bbox.x1;
        let y = (det.bbox.y1 - GLYPH_HEIGHT - 4).max(0);
        let text_width = text.chars().count() as i32 * GLYPH_ADVANCE;
        fill_rect(&mut image, x - 1, y - 1, text_width + 2, GLYPH_HEIGHT + 2, LABEL_BG);
        draw_text(&mut image, x, y, &text, color);
    }
    Frame {
        image,
        timestamp_ms: frame.timestamp_ms,
        sequence: frame.sequence,
    }
}

fn draw_box(image: &mut RgbImage, det: &Detection, color: Rgb<u8>) {
    let b = det.bbox;
    // Two nested outlines give a 2px stroke.
    for inset in 0..2 {
        let w = b.width() - 2 * inset;
        let h = b.height() - 2 * inset;
        if w <= 0 || h <= 0 {
            break;
        }
        let rect = Rect::at(b.x1 + inset, b.y1 + inset).of_size(w as u32, h as u32);
        draw_hollow_rect_mut(image, rect, color);
    }
}

fn fill_rect(image: &mut RgbImage, x: i32, y: i32, w: i32, h: i32, color: Rgb<u8>) {
    if w <= 0 || h <= 0 {
        return;
    }
    draw_filled_rect_mut(image, Rect::at(x, y).of_size(w as u32, h as u32), color);
}

/// Draw `text` with its top-left corner at (`x`, `y`). Characters without a
/// glyph advance the cursor without drawing.
pub fn draw_text(image: &mut RgbImage, x: i32, y: i32, text: &str, color: Rgb<u8>) {
    let (width, height) = (image.width() as i32, image.height() as i32);
    let mut cursor = x;
    for ch in text.chars().flat_map(char::to_uppercase) {
        if let Some(rows) = glyph(fold_accent(ch)) {
            for (row, bits) in rows.iter().enumerate() {
                let py = y + row as i32;
                if py < 0 || py >= height {
                    continue;
                }
                for col in 0..5 {
                    let px = cursor + col;
                    if (bits >> (4 - col)) & 1 == 1 && px >= 0 && px < width {
                        image.put_pixel(px as u32, py as u32, color);
                    }
                }
            }
        }
        cursor += GLYPH_ADVANCE;
    }
}

fn fold_accent(ch: char) -> char {
    match ch {
        'Á' | 'À' | 'Â' | 'Ä' => 'A',
        'É' | 'È' | 'Ê' | 'Ë' => 'E',
        'Í' | 'Ì' | 'Î' | 'Ï' => 'I',
        'Ó' | 'Ò' | 'Ô' | 'Ö' => 'O',
        'Ú' | 'Ù' | 'Û' | 'Ü' => 'U',
        'Ñ' => 'N',
        '¡' => '!',
        other => other,
    }
}

fn glyph(ch: char) -> Option<[u8; 7]> {
    FONT.iter().find(|(c, _)| *c == ch).map(|(_, rows)| *rows)
}

const FONT: [(char, [u8; 7]); 47] = [
    ('A', [0b01110, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001]),
    ('B', [0b11110, 0b10001, 0b10001, 0b11110, 0b10001, 0b10001, 0b11110]),
    ('C', [0b01110, 0b10001, 0b10000, 0b10000, 0b10000, 0b10001, 0b01110]),
    ('D', [0b11100, 0b10010, 0b10001, 0b10001, 0b10001, 0b10010, 0b11100]),
    ('E', [0b11111, 0b10000, 0b10000, 0b11110, 0b10000, 0b10000, 0b11111]),
    ('F', [0b11111, 0b10000, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000]),
    ('G', [0b01110, 0b10001, 0b10000, 0b10111, 0b10001, 0b10001, 0b01111]),
    ('H', [0b10001, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001]),
    ('I', [0b01110, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110]),
    ('J', [0b00111, 0b00010, 0b00010, 0b00010, 0b00010, 0b10010, 0b01100]),
    ('K', [0b10001, 0b10010, 0b10100, 0b11000, 0b10100, 0b10010, 0b10001]),
    ('L', [0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b11111]),
    ('M', [0b10001, 0b11011, 0b10101, 0b10101, 0b10001, 0b10001, 0b10001]),
    ('N', [0b10001, 0b10001, 0b11001, 0b10101, 0b10011, 0b10001, 0b10001]),
    ('O', [0b01110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110]),
    ('P', [0b11110, 0b10001, 0b10001, 0b11110, 0b10000, 0b10000, 0b10000]),
    ('Q', [0b01110, 0b10001, 0b10001, 0b10001, 0b10101, 0b10010, 0b01101]),
    ('R', [0b11110, 0b10001, 0b10001, 0b11110, 0b10100, 0b10010, 0b10001]),
    ('S', [0b01111, 0b10000, 0b10000, 0b01110, 0b00001, 0b00001, 0b11110]),
    ('T', [0b11111, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100]),
    ('U', [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110]),
    ('V', [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01010, 0b00100]),
    ('W', [0b10001, 0b10001, 0b10001, 0b10101, 0b10101, 0b10101, 0b01010]),
    ('X', [0b10001, 0b10001, 0b01010, 0b00100, 0b01010, 0b10001, 0b10001]),
    ('Y', [0b10001, 0b10001, 0b01010, 0b00100, 0b00100, 0b00100, 0b00100]),
    ('Z', [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b10000, 0b11111]),
    ('0', [0b01110, 0b10001, 0b10011, 0b10101, 0b11001, 0b10001, 0b01110]),
    ('1', [0b00100, 0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110]),
    ('2', [0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b01000, 0b11111]),
    ('3', [0b11111, 0b00010, 0b00100, 0b00010, 0b00001, 0b10001, 0b01110]),
    ('4', [0b00010, 0b00110, 0b01010, 0b10010, 0b11111, 0b00010, 0b00010]),
    ('5', [0b11111, 0b10000, 0b11110, 0b00001, 0b00001, 0b10001, 0b01110]),
    ('6', [0b00110, 0b01000, 0b10000, 0b11110, 0b10001, 0b10001, 0b01110]),
    ('7', [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b01000, 0b01000]),
    ('8', [0b01110, 0b10001, 0b10001, 0b01110, 0b10001, 0b10001, 0b01110]),
    ('9', [0b01110, 0b10001, 0b10001, 0b01111, 0b00001, 0b00010, 0b01100]),
    (' ', [0; 7]),
    ('.', [0, 0, 0, 0, 0, 0b01100, 0b01100]),
    (':', [0, 0b01100, 0b01100, 0, 0b01100, 0b01100, 0]),
    ('(', [0b00010, 0b00100, 0b01000, 0b01000, 0b01000, 0b00100, 0b00010]),
    (')', [0b01000, 0b00100, 0b00010, 0b00010, 0b00010, 0b00100, 0b01000]),
    ('/', [0b00001, 0b00010, 0b00010, 0b00100, 0b01000, 0b01000, 0b10000]),
    ('-', [0, 0, 0, 0b11111, 0, 0, 0]),
    ('_', [0, 0, 0, 0, 0, 0, 0b11111]),
    ('!', [0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0, 0b00100]),
    ('%', [0b11000, 0b11001, 0b00010, 0b00100, 0b01000, 0b10011, 0b00011]),
    ('|', [0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100]),
];
