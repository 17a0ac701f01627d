use image::{DynamicImage, GrayImage, ImageBuffer, Luma, RgbaImage};
use pdfium_render::prelude::*;
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use thiserror::Error;

use slipcheck_core::{MimeType, PreprocessSettings};

#[derive(Debug, Error)]
pub enum PreprocessError {
    #[error("Failed to load image: {0}")]
    Load(#[from] image::ImageError),
    #[error("Failed to encode processed image: {0}")]
    Encode(String),
    #[error("Failed to render document page: {0}")]
    Render(String),
}

/// Renders the first page of a multi-page document.
pub trait PageRasterizer: Send + Sync {
    fn first_page(&self, document: &[u8], dpi: u32) -> Result<DynamicImage, PreprocessError>;
}

/// Renders through pdfium. The library is bound on first use, from
/// `library_dir` when set and from the system search path otherwise.
#[derive(Default)]
pub struct PdfiumRasterizer {
    library_dir: Option<PathBuf>,
    pdfium: OnceLock<Result<Pdfium, String>>,
}

impl PdfiumRasterizer {
    pub fn with_library_dir(dir: impl Into<PathBuf>) -> Self {
        Self { library_dir: Some(dir.into()), pdfium: OnceLock::new() }
    }

    fn pdfium(&self) -> Result<&Pdfium, PreprocessError> {
        let bound = self.pdfium.get_or_init(|| {
            let bindings = match &self.library_dir {
                Some(dir) => Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path(dir)),
                None => Pdfium::bind_to_system_library(),
            };
            bindings.map(Pdfium::new).map_err(|e| format!("pdfium unavailable: {e}"))
        });
        bound.as_ref().map_err(|e| PreprocessError::Render(e.clone()))
    }
}

fn render_error(e: PdfiumError) -> PreprocessError {
    PreprocessError::Render(e.to_string())
}

impl PageRasterizer for PdfiumRasterizer {
    fn first_page(&self, document: &[u8], dpi: u32) -> Result<DynamicImage, PreprocessError> {
        let pdfium = self.pdfium()?;
        let doc = pdfium.load_pdf_from_byte_slice(document, None).map_err(render_error)?;
        let page = doc.pages().get(0).map_err(render_error)?;

        // Page size is in points, 72 to the inch.
        let target_width = (page.width().value * dpi as f32 / 72.0).round().max(1.0);
        let config = PdfRenderConfig::new().set_target_width(target_width as _);
        let bitmap = page.render_with_config(&config).map_err(render_error)?;

        let (width, height) = (bitmap.width() as u32, bitmap.height() as u32);
        RgbaImage::from_raw(width, height, bitmap.as_rgba_bytes())
            .map(DynamicImage::ImageRgba8)
            .ok_or_else(|| PreprocessError::Render("bitmap size mismatch".into()))
    }
}

/// Image normalisation ahead of OCR: bounded width, greyscale, contrast
/// stretch, PNG out.
#[derive(Clone)]
pub struct Preprocessor {
    settings: PreprocessSettings,
    rasterizer: Arc<dyn PageRasterizer>,
}

impl Default for Preprocessor {
    fn default() -> Self {
        Self::new(PreprocessSettings::default())
    }
}

impl Preprocessor {
    pub fn new(settings: PreprocessSettings) -> Self {
        Self { settings, rasterizer: Arc::new(PdfiumRasterizer::default()) }
    }

    pub fn with_rasterizer(mut self, rasterizer: Arc<dyn PageRasterizer>) -> Self {
        self.rasterizer = rasterizer;
        self
    }

    /// Never fails: any error is logged and the original bytes come back.
    pub fn preprocess(&self, data: &[u8], mime_type: MimeType) -> Vec<u8> {
        match self.try_preprocess(data, mime_type) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(mime_type = %mime_type, error = %e, "Preprocessing failed, using original bytes");
                data.to_vec()
            }
        }
    }

    pub fn try_preprocess(&self, data: &[u8], mime_type: MimeType) -> Result<Vec<u8>, PreprocessError> {
        let img = if mime_type.is_document() {
            self.rasterizer.first_page(data, self.settings.pdf_dpi)?
        } else {
            image::load_from_memory(data)?
        };
        encode_as_png(normalize(img, self.settings.max_width))
    }
}

/// Bounded-width downscale, then grayscale + contrast stretch.
fn normalize(img: DynamicImage, max_width: u32) -> DynamicImage {
    let img = if img.width() > max_width {
        let height = ((img.height() as u64 * max_width as u64) / img.width() as u64).max(1) as u32;
        img.resize_exact(max_width, height, image::imageops::FilterType::Lanczos3)
    } else {
        img
    };

    let gray: GrayImage = img.to_luma8();

    let (min_px, max_px) = gray
        .pixels()
        .fold((255u8, 0u8), |(mn, mx), p| (mn.min(p[0]), mx.max(p[0])));

    if max_px <= min_px {
        // Uniform or empty image, nothing to stretch.
        return DynamicImage::ImageLuma8(gray);
    }

    let range = (max_px - min_px) as u32;
    let stretched: GrayImage = ImageBuffer::from_fn(gray.width(), gray.height(), |x, y| {
        let p = gray.get_pixel(x, y)[0];
        let v = ((p - min_px) as u32 * 255 / range) as u8;
        Luma([v])
    });

    DynamicImage::ImageLuma8(stretched)
}

fn encode_as_png(img: DynamicImage) -> Result<Vec<u8>, PreprocessError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
        .map_err(|e| PreprocessError::Encode(e.to_string()))?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, GrayImage, ImageBuffer, Luma, Rgb, RgbImage};

    fn solid_gray(width: u32, height: u32, value: u8) -> DynamicImage {
        let img: GrayImage = ImageBuffer::from_fn(width, height, |_, _| Luma([value]));
        DynamicImage::ImageLuma8(img)
    }

    fn gradient_gray(width: u32, height: u32) -> DynamicImage {
        let img: GrayImage = ImageBuffer::from_fn(width, height, |x, _| {
            Luma([(64 + x * 128 / width) as u8])
        });
        DynamicImage::ImageLuma8(img)
    }

    fn png_bytes(img: &DynamicImage) -> Vec<u8> {
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png).unwrap();
        buf
    }

    struct FixedPage(DynamicImage);

    impl PageRasterizer for FixedPage {
        fn first_page(&self, _document: &[u8], _dpi: u32) -> Result<DynamicImage, PreprocessError> {
            Ok(self.0.clone())
        }
    }

    struct BrokenRasterizer;

    impl PageRasterizer for BrokenRasterizer {
        fn first_page(&self, _document: &[u8], _dpi: u32) -> Result<DynamicImage, PreprocessError> {
            Err(PreprocessError::Render("no renderer".into()))
        }
    }

    #[test]
    fn normalize_uniform_image_keeps_size() {
        let result = normalize(solid_gray(10, 10, 128), 1800);
        assert_eq!((result.width(), result.height()), (10, 10));
    }

    #[test]
    fn normalize_gradient_stretches_to_full_range() {
        let gray = normalize(gradient_gray(256, 1), 1800).to_luma8();
        let min = gray.pixels().map(|p| p[0]).min().unwrap();
        let max = gray.pixels().map(|p| p[0]).max().unwrap();
        assert_eq!(min, 0);
        assert_eq!(max, 255);
    }

    #[test]
    fn wide_image_is_bounded_and_keeps_aspect() {
        let img: GrayImage = ImageBuffer::from_fn(400, 100, |_, _| Luma([200u8]));
        let result = normalize(DynamicImage::ImageLuma8(img), 200);
        assert_eq!((result.width(), result.height()), (200, 50));
    }

    #[test]
    fn narrow_image_is_not_upscaled() {
        let result = normalize(solid_gray(50, 80, 10), 200);
        assert_eq!((result.width(), result.height()), (50, 80));
    }

    #[test]
    fn colour_input_becomes_grayscale_png() {
        let rgb: RgbImage = ImageBuffer::from_fn(8, 8, |x, _| Rgb([x as u8 * 30, 10, 200]));
        let bytes = png_bytes(&DynamicImage::ImageRgb8(rgb));
        let out = Preprocessor::default().try_preprocess(&bytes, MimeType::Png).unwrap();
        assert_eq!(&out[..4], b"\x89PNG");
        let decoded = image::load_from_memory(&out).unwrap();
        assert!(matches!(decoded, DynamicImage::ImageLuma8(_)));
    }

    #[test]
    fn undecodable_bytes_fall_back_to_original() {
        let junk = b"definitely not an image".to_vec();
        assert_eq!(Preprocessor::default().preprocess(&junk, MimeType::Jpeg), junk);
    }

    #[test]
    fn pdf_renders_first_page_via_rasterizer() {
        let pre = Preprocessor::default().with_rasterizer(Arc::new(FixedPage(gradient_gray(32, 32))));
        let out = pre.try_preprocess(b"%PDF-1.7 fake", MimeType::Pdf).unwrap();
        assert_eq!(&out[..4], b"\x89PNG");
    }

    #[test]
    fn pdf_render_failure_falls_back_to_original() {
        let pdf = b"%PDF-1.7 fake".to_vec();
        let pre = Preprocessor::default().with_rasterizer(Arc::new(BrokenRasterizer));
        assert!(pre.try_preprocess(&pdf, MimeType::Pdf).is_err());
        assert_eq!(pre.preprocess(&pdf, MimeType::Pdf), pdf);
    }

    #[test]
    fn missing_pdfium_library_is_a_render_error() {
        let r = PdfiumRasterizer::with_library_dir("/nonexistent/slipcheck-pdfium");
        assert!(matches!(r.first_page(b"%PDF", 200), Err(PreprocessError::Render(_))));
        // The failed bind is remembered rather than retried.
        assert!(matches!(r.first_page(b"%PDF", 200), Err(PreprocessError::Render(_))));
    }
}
