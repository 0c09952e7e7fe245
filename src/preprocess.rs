use image::imageops::FilterType;
use image::ImageFormat;
use ndarray::Array4;

use crate::error::PreprocessingError;

/// Side length of the square grayscale input the model expects.
pub const INPUT_SIZE: u32 = 128;

/// Decodes `image_data`, resizes it to 128x128, converts it to grayscale and
/// scales pixels into `[0, 1]`. The result has shape `(1, 128, 128, 1)`.
pub fn preprocess(image_data: &[u8]) -> Result<Array4<f32>, PreprocessingError> {
    if image_data.is_empty() {
        return Err(PreprocessingError::Empty);
    }

    let img = image::load_from_memory(image_data)?;
    let filter = resample_filter(image_data);
    let resized = img.resize_exact(INPUT_SIZE, INPUT_SIZE, filter).to_rgb8();

    let pixels: Vec<f32> = resized
        .pixels()
        .map(|p| luma_601(p.0) as f32 / 255.0)
        .collect();
    let side = INPUT_SIZE as usize;
    let tensor = Array4::from_shape_vec((1, side, side, 1), pixels)?;

    Ok(tensor)
}

/// ITU-R 601-2 luma in 16-bit fixed point, rounded.
fn luma_601([r, g, b]: [u8; 3]) -> u8 {
    ((r as u32 * 19595 + g as u32 * 38470 + b as u32 * 7471 + 0x8000) >> 16) as u8
}

/// Palette and bilevel images are sampled nearest-neighbour, everything else
/// bicubic.
fn resample_filter(image_data: &[u8]) -> FilterType {
    let indexed = match image::guess_format(image_data) {
        Ok(ImageFormat::Gif) => true,
        Ok(ImageFormat::Png) => png_is_indexed(image_data),
        _ => false,
    };
    if indexed {
        FilterType::Nearest
    } else {
        FilterType::CatmullRom
    }
}

/// Reads bit depth and colour type from the IHDR chunk that directly follows
/// the 8-byte PNG signature.
fn png_is_indexed(image_data: &[u8]) -> bool {
    match (image_data.get(24), image_data.get(25)) {
        (_, Some(3)) => true,
        (Some(1), Some(0)) => true,
        _ => false,
    }
}
