//! Synthetic card images shared by the integration tests.

#![allow(dead_code)]

use std::io::Cursor;

use image::{DynamicImage, ImageFormat, Rgb, RgbImage};

/// An 8×5 grid of flat gray blocks derived from `seed`. Rescaling keeps the
/// layout, so two sizes of the same seed are perceptual near-duplicates
/// while different seeds are unrelated.
pub fn card(seed: u64, width: u32, height: u32) -> RgbImage {
    const CELLS_X: usize = 8;
    const CELLS_Y: usize = 5;
    let mut state = seed ^ 0x9E37_79B9_7F4A_7C15;
    let levels: Vec<u8> = (0..CELLS_X * CELLS_Y)
        .map(|_| {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            (state >> 56) as u8
        })
        .collect();
    RgbImage::from_fn(width, height, |x, y| {
        let cx = x as usize * CELLS_X / width as usize;
        let cy = y as usize * CELLS_Y / height as usize;
        let v = levels[cy * CELLS_X + cx];
        Rgb([v, v, v])
    })
}

pub fn encode(img: RgbImage, format: ImageFormat) -> Vec<u8> {
    let mut out = Vec::new();
    DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut out), format)
        .unwrap();
    out
}

pub fn png(seed: u64) -> Vec<u8> {
    encode(card(seed, 640, 400), ImageFormat::Png)
}

/// Same card as [`png`], smaller and JPEG-compressed.
pub fn recompressed(seed: u64) -> Vec<u8> {
    encode(card(seed, 480, 300), ImageFormat::Jpeg)
}
