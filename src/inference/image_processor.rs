use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use image::imageops::FilterType;
use image::RgbImage;

// CLIP normalization statistics used by the BLIP image processor
const IMAGE_MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];
const IMAGE_STD: [f32; 3] = [0.268_629_54, 0.261_302_6, 0.275_777_1];

/// Decodes an uploaded payload of any format the `image` crate recognizes and normalizes it to RGB.
pub fn decode_image(bytes: &[u8]) -> Result<RgbImage> {
    let image = image::load_from_memory(bytes).context("Failed to decode image")?;
    Ok(image.to_rgb8())
}

/// Converts an RGB image into a `(3, size, size)` f32 tensor on the given device.
///
/// The image is stretched to a square with a bicubic filter (no cropping), rescaled to `[0, 1]`
/// and normalized per channel.
pub fn preprocess(image: &RgbImage, size: usize, device: &Device) -> Result<Tensor> {
    let side = u32::try_from(size)?;
    let resized = image::imageops::resize(image, side, side, FilterType::CatmullRom);

    let data = Tensor::from_vec(resized.into_raw(), (size, size, 3), &Device::Cpu)?
        .permute((2, 0, 1))?;
    let mean = Tensor::new(&IMAGE_MEAN, &Device::Cpu)?.reshape((3, 1, 1))?;
    let std = Tensor::new(&IMAGE_STD, &Device::Cpu)?.reshape((3, 1, 1))?;

    let normalized = (data.to_dtype(DType::F32)? / 255.)?
        .broadcast_sub(&mean)?
        .broadcast_div(&std)?;
    Ok(normalized.to_device(device)?)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use candle_core::IndexOp;
    use image::{DynamicImage, GrayImage, ImageFormat, Luma, Rgb};

    use super::*;

    fn encode(image: DynamicImage, format: ImageFormat) -> Vec<u8> {
        let mut buffer = Vec::new();
        image.write_to(&mut Cursor::new(&mut buffer), format).unwrap();
        buffer
    }

    #[test]
    fn decodes_png_and_jpeg() {
        let rgb = RgbImage::from_pixel(12, 7, Rgb([200, 10, 30]));

        let png = decode_image(&encode(rgb.clone().into(), ImageFormat::Png)).unwrap();
        assert_eq!(png.dimensions(), (12, 7));
        assert_eq!(png.get_pixel(0, 0), &Rgb([200, 10, 30]));

        let jpeg = decode_image(&encode(rgb.into(), ImageFormat::Jpeg)).unwrap();
        assert_eq!(jpeg.dimensions(), (12, 7));
    }

    #[test]
    fn grayscale_is_expanded_to_rgb() {
        let gray = GrayImage::from_pixel(4, 4, Luma([90]));
        let decoded = decode_image(&encode(gray.into(), ImageFormat::Png)).unwrap();
        assert_eq!(decoded.get_pixel(2, 2), &Rgb([90, 90, 90]));
    }

    #[test]
    fn palette_gif_is_expanded_to_rgb() {
        let rgb = RgbImage::from_pixel(5, 5, Rgb([0, 0, 255]));
        let gif = encode(DynamicImage::ImageRgb8(rgb).to_rgba8().into(), ImageFormat::Gif);
        let decoded = decode_image(&gif).unwrap();
        assert_eq!(decoded.dimensions(), (5, 5));
        let pixel = decoded.get_pixel(0, 0);
        assert!(pixel[2] > 200 && pixel[0] < 50 && pixel[1] < 50);
    }

    #[test]
    fn rejects_non_image_bytes() {
        let err = decode_image(b"definitely not an image").unwrap_err();
        assert!(!err.to_string().is_empty());
        assert!(decode_image(&[]).is_err());
    }

    #[test]
    fn tensor_is_channel_first_at_model_resolution() {
        let image = RgbImage::new(50, 20);
        let tensor = preprocess(&image, 384, &Device::Cpu).unwrap();
        assert_eq!(tensor.dims(), &[3, 384, 384]);
        assert_eq!(tensor.dtype(), DType::F32);
    }

    #[test]
    fn tensor_is_normalized_per_channel() {
        let image = RgbImage::from_pixel(8, 8, Rgb([255, 0, 128]));
        let tensor = preprocess(&image, 16, &Device::Cpu).unwrap();

        let red = tensor.i((0, 3, 3)).unwrap().to_scalar::<f32>().unwrap();
        let green = tensor.i((1, 3, 3)).unwrap().to_scalar::<f32>().unwrap();
        let blue = tensor.i((2, 3, 3)).unwrap().to_scalar::<f32>().unwrap();

        assert!((red - (1.0 - IMAGE_MEAN[0]) / IMAGE_STD[0]).abs() < 1e-4);
        assert!((green - (0.0 - IMAGE_MEAN[1]) / IMAGE_STD[1]).abs() < 1e-4);
        assert!((blue - (128.0 / 255.0 - IMAGE_MEAN[2]) / IMAGE_STD[2]).abs() < 1e-4);
    }
}
