use std::fmt;
use std::io::Cursor;

use clap::ValueEnum;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageBuffer, ImageFormat, RgbaImage};
use tiny_skia::Pixmap;

use crate::error::ExportError;
use crate::tree::skia_renderer::premultiplied_rgba_to_unmultiplied;

const JPEG_QUALITY: u8 = 95;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, ValueEnum)]
pub enum DownloadFormat {
    Png,
    Jpeg,
    Newick,
}

impl DownloadFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            DownloadFormat::Png => "png",
            DownloadFormat::Jpeg => "jpg",
            DownloadFormat::Newick => "nwk",
        }
    }

    pub fn filter_name(&self) -> &'static str {
        match self {
            DownloadFormat::Png => "PNG Image",
            DownloadFormat::Jpeg => "JPEG Image",
            DownloadFormat::Newick => "Newick Tree",
        }
    }

    pub fn filter_extensions(&self) -> &'static [&'static str] {
        match self {
            DownloadFormat::Png => &["png"],
            DownloadFormat::Jpeg => &["jpg", "jpeg"],
            DownloadFormat::Newick => &["nwk", "newick", "tre"],
        }
    }
}

impl fmt::Display for DownloadFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DownloadFormat::Png => write!(f, "png"),
            DownloadFormat::Jpeg => write!(f, "jpeg"),
            DownloadFormat::Newick => write!(f, "newick"),
        }
    }
}

/// Stack the ruler above the body and encode the result. A narrower surface
/// is padded on the right with transparent pixels.
pub fn encode_frame(header: &Pixmap, body: &Pixmap, format: DownloadFormat) -> Result<Vec<u8>, ExportError> {
    let image = stack(header, body)?;
    let mut out = Cursor::new(Vec::new());
    match format {
        DownloadFormat::Png => image.write_to(&mut out, ImageFormat::Png)?,
        DownloadFormat::Jpeg => {
            // JPEG has no alpha channel.
            let rgb = DynamicImage::ImageRgba8(image).to_rgb8();
            let mut encoder = JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY);
            encoder.encode_image(&DynamicImage::ImageRgb8(rgb))?;
        }
        DownloadFormat::Newick => return Err(ExportError::NotAnImage(format.to_string())),
    }
    Ok(out.into_inner())
}

fn stack(header: &Pixmap, body: &Pixmap) -> Result<RgbaImage, ExportError> {
    let width = header.width().max(body.width());
    let height = header.height() + body.height();
    let mut data = vec![0u8; width as usize * height as usize * 4];
    let mut y_offset = 0usize;
    for pixmap in [header, body] {
        let rows = premultiplied_rgba_to_unmultiplied(pixmap.data());
        let row_bytes = pixmap.width() as usize * 4;
        for (row, chunk) in rows.chunks_exact(row_bytes.max(1)).enumerate() {
            let start = (y_offset + row) * width as usize * 4;
            data[start..start + chunk.len()].copy_from_slice(chunk);
        }
        y_offset += pixmap.height() as usize;
    }
    ImageBuffer::from_raw(width, height, data).ok_or(ExportError::Surface { width, height })
}
