use crate::{InputEvent, InteractionSurface, SurfaceChange};
use doc_model::StoreError;
use pdf_engine::{compose, ComposeOptions, PdfEngineError, RasterizedPage, Rasterizer};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Engine(#[from] PdfEngineError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct PagePreview {
    pub page_index: u32,
    pub scale: f32,
    pub page: RasterizedPage,
}

/// One open document: its bytes, the current page preview and the annotations placed on it.
pub struct EditorSession<R> {
    rasterizer: R,
    document: Vec<u8>,
    page_count: u32,
    surface: InteractionSurface,
    preview: Option<PagePreview>,
}

impl<R: Rasterizer> EditorSession<R> {
    /// Fails only when the document cannot be read; a first page that does not render leaves the
    /// session open without a preview.
    pub fn open(
        rasterizer: R,
        document: Vec<u8>,
        surface: InteractionSurface,
    ) -> Result<Self, SessionError> {
        let page_count = rasterizer.page_count(&document)?;
        let mut session = Self { rasterizer, document, page_count, surface, preview: None };

        if page_count > 0 {
            let first_page = session.surface.page_index().min(page_count - 1);
            if let Err(err) = session.go_to_page(first_page) {
                log::warn!("initial preview failed: {err}");
            }
        }

        Ok(session)
    }

    /// Renders `page_index` and makes it current. On failure the previous page and preview stay.
    pub fn go_to_page(&mut self, page_index: u32) -> Result<&PagePreview, SessionError> {
        let scale = self.surface.scale();
        let page = self.rasterizer.rasterize(&self.document, page_index, scale)?;

        self.surface.set_page_index(page_index);
        Ok(self.preview.insert(PagePreview { page_index, scale, page }))
    }

    /// Re-renders the current page at `scale`. On failure the scale and preview are unchanged.
    pub fn set_scale(&mut self, scale: f32) -> Result<&PagePreview, SessionError> {
        let page_index = self.surface.page_index();
        let page = self.rasterizer.rasterize(&self.document, page_index, scale)?;

        self.surface.set_scale(scale);
        Ok(self.preview.insert(PagePreview { page_index, scale, page }))
    }

    pub fn refresh_preview(&mut self) -> Result<&PagePreview, SessionError> {
        self.go_to_page(self.surface.page_index())
    }

    pub fn handle(&mut self, event: InputEvent) -> Result<SurfaceChange, StoreError> {
        self.surface.handle(event)
    }

    /// Composites a snapshot of the annotations taken when called; edits made while the
    /// returned buffer is being written elsewhere do not affect it.
    pub fn export(&self) -> Result<Vec<u8>, PdfEngineError> {
        let snapshot = self.surface.store().snapshot();
        let options = ComposeOptions {
            scale: self.surface.scale(),
            font_size_units: self.surface.font_size_units(),
        };

        log::info!("exporting {} annotations at scale {}", snapshot.len(), options.scale);
        compose(&self.document, &snapshot, &options)
    }

    pub fn preview(&self) -> Option<&PagePreview> {
        self.preview.as_ref()
    }

    pub fn surface(&self) -> &InteractionSurface {
        &self.surface
    }

    pub fn surface_mut(&mut self) -> &mut InteractionSurface {
        &mut self.surface
    }

    pub fn page_count(&self) -> u32 {
        self.page_count
    }

    pub fn document(&self) -> &[u8] {
        &self.document
    }
}
