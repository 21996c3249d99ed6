//! Stretching decoded images to the surface's pixel size.

use anyhow::{Result, anyhow, ensure};
use fast_image_resize as fir;
use image::RgbaImage;

/// Lanczos3 scaler kept alive for the life of a surface so its convolution
/// buffers are reused between frames.
pub struct SurfaceScaler {
    resizer: fir::Resizer,
    options: fir::ResizeOptions,
}

impl Default for SurfaceScaler {
    fn default() -> Self {
        Self {
            resizer: fir::Resizer::new(),
            options: fir::ResizeOptions::new()
                .resize_alg(fir::ResizeAlg::Convolution(fir::FilterType::Lanczos3)),
        }
    }
}

impl SurfaceScaler {
    /// Stretch `image` to exactly `width` x `height`. Aspect ratio is not kept.
    pub fn stretch(&mut self, image: &RgbaImage, width: u32, height: u32) -> Result<RgbaImage> {
        ensure!(
            width > 0 && height > 0,
            "cannot scale to an empty {width}x{height} surface"
        );
        if image.dimensions() == (width, height) {
            return Ok(image.clone());
        }

        let (src_w, src_h) = image.dimensions();
        let src = fir::images::ImageRef::new(src_w, src_h, image.as_raw(), fir::PixelType::U8x4)?;
        let mut dst = fir::images::Image::new(width, height, fir::PixelType::U8x4);
        self.resizer.resize(&src, &mut dst, Some(&self.options))?;
        RgbaImage::from_raw(width, height, dst.into_vec())
            .ok_or_else(|| anyhow!("scaled buffer does not fill {width}x{height}"))
    }
}
