use doc_model::AnnotationId;
use image::{ImageBuffer, Rgba};
use lopdf::{Document, Object, ObjectId};
use std::path::PathBuf;

pub mod compose;

pub use compose::{compose, document_position, plan_text_placements, ComposeOptions, TextPlacement};

pub type RgbaImage = ImageBuffer<Rgba<u8>, Vec<u8>>;

/// Scale used for previews when nothing else is configured.
pub const DEFAULT_RENDER_SCALE: f32 = 1.5;

const FALLBACK_PAGE_SIZE: PageSize = PageSize { width_pt: 612.0, height_pt: 792.0 };
const MAX_INHERITANCE_DEPTH: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageSize {
    pub width_pt: f32,
    pub height_pt: f32,
}

#[derive(Debug, Clone)]
pub struct RasterizedPage {
    pub image: RgbaImage,
    pub display_width: f32,
    pub display_height: f32,
    pub intrinsic_width: f32,
    pub intrinsic_height: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RasterizerConfig {
    pub background: [u8; 4],
    pub outline: Option<[u8; 4]>,
    /// Renders wider or taller than this fail instead of allocating.
    pub max_dimension_px: u32,
    /// Directory holding the pdfium shared library; system paths are searched when unset.
    pub library_dir: Option<PathBuf>,
}

impl Default for RasterizerConfig {
    fn default() -> Self {
        Self {
            background: [255, 255, 255, 255],
            outline: Some([220, 220, 220, 255]),
            max_dimension_px: 8192,
            library_dir: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PdfEngineError {
    #[error("invalid document: {0}")]
    InvalidDocument(#[from] lopdf::Error),
    #[error("encrypted PDFs are not supported in the default backend")]
    EncryptedUnsupported,
    #[error("page {page} out of range (page_count={page_count})")]
    PageOutOfRange { page: u32, page_count: u32 },
    #[error("failed to render page {page}: {reason}")]
    RenderFailure { page: u32, reason: String },
    #[error("scale must be a positive finite number, got {0}")]
    InvalidScale(f32),
    #[error("annotation {id} cannot be drawn: {reason}")]
    InvalidAnnotation { id: AnnotationId, reason: String },
    #[error("backend error: {0}")]
    Backend(String),
}

pub trait Rasterizer {
    /// `page_index` is zero-based.
    fn rasterize(
        &self,
        document: &[u8],
        page_index: u32,
        scale: f32,
    ) -> Result<RasterizedPage, PdfEngineError>;

    fn page_count(&self, document: &[u8]) -> Result<u32, PdfEngineError>;
}

impl<R: Rasterizer + ?Sized> Rasterizer for Box<R> {
    fn rasterize(
        &self,
        document: &[u8],
        page_index: u32,
        scale: f32,
    ) -> Result<RasterizedPage, PdfEngineError> {
        (**self).rasterize(document, page_index, scale)
    }

    fn page_count(&self, document: &[u8]) -> Result<u32, PdfEngineError> {
        (**self).page_count(document)
    }
}

/// Parses `bytes`, refusing documents whose trailer declares an `/Encrypt` dictionary.
pub fn load_document(bytes: &[u8]) -> Result<Document, PdfEngineError> {
    match Document::load_mem(bytes) {
        Ok(doc) if doc.trailer.has(b"Encrypt") => Err(PdfEngineError::EncryptedUnsupported),
        Ok(doc) => Ok(doc),
        Err(_) if trailer_declares_encryption(bytes) => Err(PdfEngineError::EncryptedUnsupported),
        Err(err) => Err(err.into()),
    }
}

/// Looks for `/Encrypt` after the last `trailer` keyword, for files the parser gave up on.
fn trailer_declares_encryption(bytes: &[u8]) -> bool {
    const TRAILER: &[u8] = b"trailer";
    const ENCRYPT: &[u8] = b"/Encrypt";

    bytes
        .windows(TRAILER.len())
        .rposition(|window| window == TRAILER)
        .is_some_and(|start| bytes[start..].windows(ENCRYPT.len()).any(|w| w == ENCRYPT))
}

pub fn page_count(bytes: &[u8]) -> Result<u32, PdfEngineError> {
    Ok(load_document(bytes)?.get_pages().len() as u32)
}

pub fn page_sizes(bytes: &[u8]) -> Result<Vec<PageSize>, PdfEngineError> {
    let doc = load_document(bytes)?;
    Ok(doc.get_pages().into_values().map(|page_id| page_size(&doc, page_id)).collect())
}

pub fn validate_scale(scale: f32) -> Result<f32, PdfEngineError> {
    if scale.is_finite() && scale > 0.0 {
        Ok(scale)
    } else {
        Err(PdfEngineError::InvalidScale(scale))
    }
}

pub(crate) fn page_size(doc: &Document, page_id: ObjectId) -> PageSize {
    inherited_attribute(doc, page_id, b"MediaBox")
        .and_then(|obj| obj.as_array().ok())
        .and_then(|array| {
            if array.len() != 4 {
                return None;
            }
            let x0 = resolve(doc, &array[0]).ok()?.as_float().ok()?;
            let y0 = resolve(doc, &array[1]).ok()?.as_float().ok()?;
            let x1 = resolve(doc, &array[2]).ok()?.as_float().ok()?;
            let y1 = resolve(doc, &array[3]).ok()?.as_float().ok()?;
            Some(PageSize { width_pt: (x1 - x0).abs(), height_pt: (y1 - y0).abs() })
        })
        .unwrap_or(FALLBACK_PAGE_SIZE)
}

/// Looks `key` up on the page, then on its `Parent` chain, dereferencing the result.
pub(crate) fn inherited_attribute<'a>(
    doc: &'a Document,
    page_id: ObjectId,
    key: &[u8],
) -> Option<&'a Object> {
    let mut current = Some(page_id);

    for _ in 0..MAX_INHERITANCE_DEPTH {
        let dict = doc.get_dictionary(current?).ok()?;
        if let Ok(value) = dict.get(key) {
            return resolve(doc, value).ok();
        }
        current = dict.get(b"Parent").and_then(Object::as_reference).ok();
    }

    None
}

pub(crate) fn resolve<'a>(doc: &'a Document, object: &'a Object) -> lopdf::Result<&'a Object> {
    match object {
        Object::Reference(id) => doc.get_object(*id),
        other => Ok(other),
    }
}

/// Draws a blank page of the right size with a thin outline. It does not interpret page content;
/// enable the `pdfium` feature for real previews.
#[derive(Debug, Clone, Default)]
pub struct LopdfEngine {
    config: RasterizerConfig,
}

impl LopdfEngine {
    pub fn new(config: RasterizerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RasterizerConfig {
        &self.config
    }

    fn paint(&self, width: u32, height: u32) -> RgbaImage {
        let mut image = RgbaImage::from_pixel(width, height, Rgba(self.config.background));

        if let Some(outline) = self.config.outline.filter(|_| width >= 4 && height >= 4) {
            for x in 0..width {
                image.put_pixel(x, 0, Rgba(outline));
                image.put_pixel(x, height - 1, Rgba(outline));
            }
            for y in 0..height {
                image.put_pixel(0, y, Rgba(outline));
                image.put_pixel(width - 1, y, Rgba(outline));
            }
        }

        image
    }
}

impl Rasterizer for LopdfEngine {
    fn rasterize(
        &self,
        document: &[u8],
        page_index: u32,
        scale: f32,
    ) -> Result<RasterizedPage, PdfEngineError> {
        let failure = |reason: String| PdfEngineError::RenderFailure { page: page_index, reason };

        let scale = validate_scale(scale).map_err(|err| failure(err.to_string()))?;
        let sizes = page_sizes(document).map_err(|err| failure(err.to_string()))?;
        let size = sizes.get(page_index as usize).copied().ok_or_else(|| {
            failure(
                PdfEngineError::PageOutOfRange { page: page_index, page_count: sizes.len() as u32 }
                    .to_string(),
            )
        })?;

        let (width, height) = pixel_dimensions(size, scale, self.config.max_dimension_px)
            .map_err(|err| failure(err.to_string()))?;

        log::debug!("rasterize page {page_index} at {scale}x -> {width}x{height}");

        Ok(RasterizedPage {
            image: self.paint(width, height),
            display_width: size.width_pt * scale,
            display_height: size.height_pt * scale,
            intrinsic_width: size.width_pt,
            intrinsic_height: size.height_pt,
        })
    }

    fn page_count(&self, document: &[u8]) -> Result<u32, PdfEngineError> {
        page_count(document)
    }
}

fn pixel_dimensions(size: PageSize, scale: f32, max: u32) -> Result<(u32, u32), PdfEngineError> {
    let width = (size.width_pt * scale).round().max(1.0);
    let height = (size.height_pt * scale).round().max(1.0);

    if width > max as f32 || height > max as f32 {
        return Err(PdfEngineError::Backend(format!(
            "{width}x{height} exceeds the {max}px preview limit"
        )));
    }

    Ok((width as u32, height as u32))
}

#[cfg(feature = "pdfium")]
pub mod pdfium_backend {
    use super::*;
    use pdfium_render::prelude::*;

    pub struct PdfiumRasterizer {
        pdfium: Pdfium,
        config: RasterizerConfig,
    }

    impl PdfiumRasterizer {
        pub fn new(config: RasterizerConfig) -> Result<Self, PdfEngineError> {
            let bindings = match &config.library_dir {
                Some(dir) => {
                    Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path(dir))
                }
                None => Pdfium::bind_to_system_library(),
            }
            .map_err(|err| {
                PdfEngineError::Backend(format!("failed to bind pdfium library: {err}"))
            })?;

            Ok(Self { pdfium: Pdfium::new(bindings), config })
        }
    }

    impl Rasterizer for PdfiumRasterizer {
        fn rasterize(
            &self,
            document: &[u8],
            page_index: u32,
            scale: f32,
        ) -> Result<RasterizedPage, PdfEngineError> {
            let failure =
                |reason: String| PdfEngineError::RenderFailure { page: page_index, reason };

            let scale = validate_scale(scale).map_err(|err| failure(err.to_string()))?;
            let pdf = self
                .pdfium
                .load_pdf_from_byte_slice(document, None)
                .map_err(|err| failure(err.to_string()))?;
            let page =
                pdf.pages().get(page_handle(page_index)?).map_err(|err| failure(err.to_string()))?;

            let size = PageSize { width_pt: page.width().value, height_pt: page.height().value };
            let (width, height) = pixel_dimensions(size, scale, self.config.max_dimension_px)
                .map_err(|err| failure(err.to_string()))?;

            let render_config = PdfRenderConfig::new()
                .set_target_width(width as i32)
                .set_target_height(height as i32);
            let bitmap =
                page.render_with_config(&render_config).map_err(|err| failure(err.to_string()))?;

            let image = RgbaImage::from_raw(width, height, bitmap.as_rgba_bytes().to_vec())
                .ok_or_else(|| failure("bitmap size does not match target".to_owned()))?;

            Ok(RasterizedPage {
                image,
                display_width: size.width_pt * scale,
                display_height: size.height_pt * scale,
                intrinsic_width: size.width_pt,
                intrinsic_height: size.height_pt,
            })
        }

        fn page_count(&self, document: &[u8]) -> Result<u32, PdfEngineError> {
            let pdf = self
                .pdfium
                .load_pdf_from_byte_slice(document, None)
                .map_err(|err| PdfEngineError::Backend(err.to_string()))?;
            Ok(pdf.pages().len() as u32)
        }
    }

    /// pdfium addresses pages with a `u16`; larger indices fail instead of wrapping.
    fn page_handle(page_index: u32) -> Result<u16, PdfEngineError> {
        u16::try_from(page_index).map_err(|_| PdfEngineError::RenderFailure {
            page: page_index,
            reason: format!("page index {page_index} exceeds pdfium's range"),
        })
    }

}
