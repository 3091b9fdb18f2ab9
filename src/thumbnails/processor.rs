//! Decode, fit and re-encode. Everything here is CPU-bound and runs on the
//! blocking pool.

use bytes::Bytes;
use image::{DynamicImage, ImageFormat, ImageResult};
use std::io::Cursor;
use thiserror::Error;

use crate::models::thumbnail::{THUMBNAIL_VARIANTS, ThumbnailVariant};

#[derive(Debug, Error)]
pub enum ProcessError {
    /// The source is not an image this build can read. Retrying cannot help.
    #[error("cannot decode image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("image task aborted: {0}")]
    Aborted(#[from] tokio::task::JoinError),
}

/// Encoded output for one variant, or why that variant failed.
pub struct Rendered {
    pub variant: ThumbnailVariant,
    pub png: ImageResult<Vec<u8>>,
}

/// Fit `img` inside the variant's box, keeping the aspect ratio. Images that
/// already fit are kept at their original size.
pub fn fit(img: &DynamicImage, variant: ThumbnailVariant) -> DynamicImage {
    if img.width() <= variant.max_width && img.height() <= variant.max_height {
        return img.clone();
    }
    img.thumbnail(variant.max_width, variant.max_height)
}

pub fn encode_png(img: &DynamicImage) -> ImageResult<Vec<u8>> {
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Png)?;
    Ok(out.into_inner())
}

/// Decode `source` once and render every configured variant.
pub async fn render_all(source: Bytes) -> Result<Vec<Rendered>, ProcessError> {
    let rendered = tokio::task::spawn_blocking(move || {
        let img = image::load_from_memory(&source)?;
        Ok::<_, image::ImageError>(
            THUMBNAIL_VARIANTS
                .iter()
                .map(|&variant| Rendered {
                    variant,
                    png: encode_png(&fit(&img, variant)),
                })
                .collect(),
        )
    })
    .await??;
    Ok(rendered)
}
