use doc_model::{
    Annotation, AnnotationId, AnnotationStore, FontSizeUnits, PlacementDefaults, StoreError,
};

mod session;

pub use session::{EditorSession, PagePreview, SessionError};

/// Pointer position in window (client) coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClientPoint {
    pub x: f32,
    pub y: f32,
}

impl ClientPoint {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Position relative to the page surface's top-left corner, at the active scale.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DisplayPoint {
    pub x: f32,
    pub y: f32,
}

/// Bounding box of the rendered page surface in client coordinates, as measured when the event
/// fired. Scrolling and resizing move it, so every event carries its own.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SurfaceRect {
    pub left: f32,
    pub top: f32,
    pub width: f32,
    pub height: f32,
}

impl SurfaceRect {
    pub fn to_display(&self, pointer: ClientPoint) -> DisplayPoint {
        DisplayPoint { x: pointer.x - self.left, y: pointer.y - self.top }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitTarget {
    Page,
    Annotation(AnnotationId),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DragState {
    Idle,
    Dragging { id: AnnotationId, grab_offset: DisplayPoint },
}

#[derive(Debug, Clone, PartialEq)]
pub enum InputEvent {
    /// Pointer pressed on an annotation's drag handle.
    PointerDown { target: AnnotationId, pointer: ClientPoint, surface: SurfaceRect },
    PointerMove { pointer: ClientPoint, surface: SurfaceRect },
    PointerUp,
    DoubleClick { target: HitTarget, pointer: ClientPoint, surface: SurfaceRect },
    TextEdit { id: AnnotationId, text: String },
    Delete { id: AnnotationId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceChange {
    None,
    Added(AnnotationId),
    Updated(AnnotationId),
    Removed(AnnotationId),
    DragStarted(AnnotationId),
    DragEnded(AnnotationId),
}

#[derive(Debug, Clone)]
pub struct InteractionSurface {
    store: AnnotationStore,
    drag: DragState,
    page_index: u32,
    scale: f32,
    defaults: PlacementDefaults,
    font_size_units: FontSizeUnits,
}

impl Default for InteractionSurface {
    fn default() -> Self {
        Self::new(PlacementDefaults::default(), FontSizeUnits::default(), 1.0)
    }
}

impl InteractionSurface {
    pub fn new(defaults: PlacementDefaults, font_size_units: FontSizeUnits, scale: f32) -> Self {
        Self {
            store: AnnotationStore::new(),
            drag: DragState::Idle,
            page_index: 0,
            scale,
            defaults,
            font_size_units,
        }
    }

    pub fn handle(&mut self, event: InputEvent) -> Result<SurfaceChange, StoreError> {
        match event {
            InputEvent::PointerDown { target, pointer, surface } => {
                self.pointer_down(target, surface.to_display(pointer))
            }
            InputEvent::PointerMove { pointer, surface } => {
                self.pointer_move(surface.to_display(pointer))
            }
            InputEvent::PointerUp => Ok(self.pointer_up()),
            InputEvent::DoubleClick { target: HitTarget::Page, pointer, surface } => {
                self.place(surface.to_display(pointer))
            }
            InputEvent::DoubleClick { target: HitTarget::Annotation(_), .. } => {
                Ok(SurfaceChange::None)
            }
            InputEvent::TextEdit { id, text } => self.edit_text(id, text),
            InputEvent::Delete { id } => Ok(self.delete(id)),
        }
    }

    pub fn pointer_down(
        &mut self,
        id: AnnotationId,
        at: DisplayPoint,
    ) -> Result<SurfaceChange, StoreError> {
        let annotation = self.store.get(id).ok_or(StoreError::NotFound(id))?;
        let grab_offset = DisplayPoint { x: at.x - annotation.x, y: at.y - annotation.y };

        log::debug!("drag start {id} offset ({}, {})", grab_offset.x, grab_offset.y);
        self.drag = DragState::Dragging { id, grab_offset };
        Ok(SurfaceChange::DragStarted(id))
    }

    /// Positions are recomputed from the captured offset each time, so repeated moves never drift.
    pub fn pointer_move(&mut self, at: DisplayPoint) -> Result<SurfaceChange, StoreError> {
        let DragState::Dragging { id, grab_offset } = self.drag else {
            return Ok(SurfaceChange::None);
        };

        let Some(current) = self.store.get(id) else {
            self.drag = DragState::Idle;
            return Err(StoreError::NotFound(id));
        };

        let moved = current.with_position(at.x - grab_offset.x, at.y - grab_offset.y);
        self.store.update(moved)?;
        Ok(SurfaceChange::Updated(id))
    }

    pub fn pointer_up(&mut self) -> SurfaceChange {
        match std::mem::replace(&mut self.drag, DragState::Idle) {
            DragState::Dragging { id, .. } => SurfaceChange::DragEnded(id),
            DragState::Idle => SurfaceChange::None,
        }
    }

    /// Creates a placeholder annotation at a double-click on empty page area.
    pub fn place(&mut self, at: DisplayPoint) -> Result<SurfaceChange, StoreError> {
        let annotation =
            self.defaults.annotation_at(AnnotationId::new_v4(), at.x, at.y, self.page_index);
        let id = annotation.id;

        self.store.add(annotation)?;
        Ok(SurfaceChange::Added(id))
    }

    pub fn edit_text(
        &mut self,
        id: AnnotationId,
        text: impl Into<String>,
    ) -> Result<SurfaceChange, StoreError> {
        let edited = self.store.get(id).ok_or(StoreError::NotFound(id))?.with_text(text);
        self.store.update(edited)?;
        Ok(SurfaceChange::Updated(id))
    }

    /// A repeated delete of the same annotation is a no-op.
    pub fn delete(&mut self, id: AnnotationId) -> SurfaceChange {
        if matches!(self.drag, DragState::Dragging { id: dragged, .. } if dragged == id) {
            self.drag = DragState::Idle;
        }

        match self.store.remove(id) {
            Ok(_) => SurfaceChange::Removed(id),
            Err(StoreError::NotFound(_)) | Err(StoreError::DuplicateId(_)) => SurfaceChange::None,
        }
    }

    /// Topmost (last placed) visible annotation whose box contains `at`.
    pub fn hit_test(&self, at: DisplayPoint) -> HitTarget {
        self.visible_annotations()
            .filter(|annotation| annotation.contains(at.x, at.y))
            .last()
            .map_or(HitTarget::Page, |annotation| HitTarget::Annotation(annotation.id))
    }

    pub fn visible_annotations(&self) -> impl Iterator<Item = &Annotation> + Clone {
        self.store.filter_by_page(self.page_index)
    }

    /// Text size to use on screen so the preview matches what export will draw.
    pub fn preview_font_size(&self, annotation: &Annotation) -> f32 {
        self.font_size_units.display_size(annotation.font_size, self.scale)
    }

    /// Switching pages cancels any drag; annotations on other pages are untouched.
    pub fn set_page_index(&mut self, page_index: u32) {
        if page_index != self.page_index {
            self.drag = DragState::Idle;
        }
        self.page_index = page_index;
    }

    /// Stored positions are not rescaled.
    pub fn set_scale(&mut self, scale: f32) {
        if scale != self.scale && !self.store.is_empty() {
            log::warn!(
                "scale changed from {} to {scale} with {} placed annotations; their positions stay \
                 in the previous scale",
                self.scale,
                self.store.len()
            );
        }
        self.scale = scale;
    }

    pub fn page_index(&self) -> u32 {
        self.page_index
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    pub fn font_size_units(&self) -> FontSizeUnits {
        self.font_size_units
    }

    pub fn drag_state(&self) -> DragState {
        self.drag
    }

    pub fn store(&self) -> &AnnotationStore {
        &self.store
    }
}
