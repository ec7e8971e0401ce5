use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Stable for the annotation's lifetime. Generated with UUID v4.
pub type AnnotationId = uuid::Uuid;

pub const PLACEHOLDER_TEXT: &str = "Nouveau texte";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Annotation {
    pub id: AnnotationId,
    /// Display space: pixels at the active scale, origin at the page surface's top-left.
    pub x: f32,
    pub y: f32,
    /// Advisory box; the rendered text may exceed it.
    pub width: f32,
    pub height: f32,
    pub text: String,
    pub font_size: f32,
    pub page_index: u32,
}

impl Annotation {
    pub fn with_position(&self, x: f32, y: f32) -> Self {
        Self { x, y, ..self.clone() }
    }

    pub fn with_text(&self, text: impl Into<String>) -> Self {
        Self { text: text.into(), ..self.clone() }
    }

    pub fn contains(&self, x: f32, y: f32) -> bool {
        x >= self.x && x <= self.x + self.width && y >= self.y && y <= self.y + self.height
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PlacementDefaults {
    pub width: f32,
    pub height: f32,
    pub font_size: f32,
    pub placeholder_text: String,
    /// Subtracted from the click's y so the new box is roughly centered on the cursor.
    pub vertical_offset: f32,
}

impl Default for PlacementDefaults {
    fn default() -> Self {
        Self {
            width: 200.0,
            height: 30.0,
            font_size: 16.0,
            placeholder_text: PLACEHOLDER_TEXT.to_owned(),
            vertical_offset: 10.0,
        }
    }
}

impl PlacementDefaults {
    pub fn annotation_at(&self, id: AnnotationId, x: f32, y: f32, page_index: u32) -> Annotation {
        Annotation {
            id,
            x,
            y: y - self.vertical_offset,
            width: self.width,
            height: self.height,
            text: self.placeholder_text.clone(),
            font_size: self.font_size,
            page_index,
        }
    }
}

/// Which space `Annotation::font_size` is measured in.
///
/// `Document` draws the stored size unchanged into the output and scales the preview up;
/// `Display` treats it as on-screen pixels and divides by the scale on export.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FontSizeUnits {
    #[default]
    Document,
    /// Only the drawn size is divided by the scale. The baseline drop of `font_size / 2` keeps
    /// using the stored size, so at scales above 1 the text sits slightly below its box center.
    Display,
}

impl FontSizeUnits {
    pub fn document_size(self, font_size: f32, scale: f32) -> f32 {
        match self {
            Self::Document => font_size,
            Self::Display => font_size / scale,
        }
    }

    pub fn display_size(self, font_size: f32, scale: f32) -> f32 {
        match self {
            Self::Document => font_size * scale,
            Self::Display => font_size,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("annotation {0} already exists")]
    DuplicateId(AnnotationId),
    #[error("annotation {0} not found")]
    NotFound(AnnotationId),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnnotationStore {
    annotations: Vec<Annotation>,
}

impl AnnotationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, annotation: Annotation) -> Result<(), StoreError> {
        if self.position(annotation.id).is_some() {
            return Err(StoreError::DuplicateId(annotation.id));
        }

        log::debug!("add annotation {} on page {}", annotation.id, annotation.page_index);
        self.annotations.push(annotation);
        Ok(())
    }

    pub fn update(&mut self, annotation: Annotation) -> Result<(), StoreError> {
        let index = self.position(annotation.id).ok_or(StoreError::NotFound(annotation.id))?;
        self.annotations[index] = annotation;
        Ok(())
    }

    pub fn remove(&mut self, id: AnnotationId) -> Result<Annotation, StoreError> {
        let index = self.position(id).ok_or(StoreError::NotFound(id))?;

        log::debug!("remove annotation {id}");
        Ok(self.annotations.remove(index))
    }

    pub fn filter_by_page(&self, page_index: u32) -> impl Iterator<Item = &Annotation> + Clone {
        self.annotations.iter().filter(move |annotation| annotation.page_index == page_index)
    }

    pub fn get(&self, id: AnnotationId) -> Option<&Annotation> {
        self.annotations.iter().find(|annotation| annotation.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Annotation> {
        self.annotations.iter()
    }

    pub fn len(&self) -> usize {
        self.annotations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.annotations.is_empty()
    }

    pub fn page_indices(&self) -> BTreeSet<u32> {
        self.annotations.iter().map(|annotation| annotation.page_index).collect()
    }

    /// Owned copy for compositing, unaffected by edits made afterwards.
    pub fn snapshot(&self) -> Vec<Annotation> {
        self.annotations.clone()
    }

    fn position(&self, id: AnnotationId) -> Option<usize> {
        self.annotations.iter().position(|annotation| annotation.id == id)
    }
}
