//! Burns text annotations into page content.
//!
//! Annotations carry display-space positions (top-left origin, scaled); pages use PDF user
//! space (bottom-left origin, unscaled). Each annotation becomes a Helvetica text run in a new
//! content stream appended to its page.

use crate::{inherited_attribute, load_document, page_size, validate_scale, PageSize};
use crate::{PdfEngineError, DEFAULT_RENDER_SCALE};
use doc_model::{Annotation, FontSizeUnits};
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Dictionary, Document, Object, ObjectId, Stream, StringFormat};
use std::collections::BTreeMap;

const FONT_RESOURCE_PREFIX: &str = "FAnnot";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ComposeOptions {
    /// Display scale that was active when the annotation positions were captured.
    pub scale: f32,
    pub font_size_units: FontSizeUnits,
}

impl Default for ComposeOptions {
    fn default() -> Self {
        Self { scale: DEFAULT_RENDER_SCALE, font_size_units: FontSizeUnits::default() }
    }
}

impl ComposeOptions {
    pub fn new(scale: f32) -> Self {
        Self { scale, ..Self::default() }
    }
}

/// A text run in document space, ready to be drawn.
#[derive(Debug, Clone, PartialEq)]
pub struct TextPlacement {
    pub page_index: u32,
    pub x: f32,
    pub y: f32,
    pub font_size: f32,
    pub text: String,
}

/// Maps a display-space annotation onto a page of intrinsic height `page_height`.
///
/// The `font_size / 2` term lines the box's visual center up with the text baseline. It is an
/// approximation, good enough for short single-line labels.
pub fn document_position(annotation: &Annotation, page_height: f32, scale: f32) -> (f32, f32) {
    let x = annotation.x / scale;
    let y = page_height - annotation.y / scale - annotation.font_size / 2.0;
    (x, y)
}

/// Annotations whose page does not exist in `page_sizes` are skipped. A placement that does not
/// land on finite coordinates fails the whole plan.
pub fn plan_text_placements(
    annotations: &[Annotation],
    page_sizes: &[PageSize],
    options: &ComposeOptions,
) -> Result<Vec<TextPlacement>, PdfEngineError> {
    let mut placements = Vec::with_capacity(annotations.len());

    for annotation in annotations {
        let Some(size) = page_sizes.get(annotation.page_index as usize) else {
            log::debug!(
                "skipping annotation {} on page {} (document has {} pages)",
                annotation.id,
                annotation.page_index,
                page_sizes.len()
            );
            continue;
        };

        let (x, y) = document_position(annotation, size.height_pt, options.scale);
        let font_size = options.font_size_units.document_size(annotation.font_size, options.scale);
        if !(x.is_finite() && y.is_finite() && font_size.is_finite()) {
            return Err(PdfEngineError::InvalidAnnotation {
                id: annotation.id,
                reason: format!("position ({x}, {y}) at size {font_size} is not finite"),
            });
        }

        placements.push(TextPlacement {
            page_index: annotation.page_index,
            x,
            y,
            font_size,
            text: annotation.text.clone(),
        });
    }

    Ok(placements)
}

/// Returns a new document with every annotation drawn onto its page.
///
/// Either the whole buffer is produced or an error is returned; `document` is never modified.
pub fn compose(
    document: &[u8],
    annotations: &[Annotation],
    options: &ComposeOptions,
) -> Result<Vec<u8>, PdfEngineError> {
    validate_scale(options.scale)?;

    let mut doc = load_document(document)?;
    let page_ids: Vec<ObjectId> = doc.get_pages().into_values().collect();
    let sizes: Vec<PageSize> = page_ids.iter().map(|page_id| page_size(&doc, *page_id)).collect();

    let placements = plan_text_placements(annotations, &sizes, options)?;
    let mut by_page: BTreeMap<u32, Vec<&TextPlacement>> = BTreeMap::new();
    for placement in &placements {
        by_page.entry(placement.page_index).or_default().push(placement);
    }

    if !by_page.is_empty() {
        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Helvetica",
            "Encoding" => "WinAnsiEncoding",
        });

        for (page_index, runs) in &by_page {
            let page_id = page_ids[*page_index as usize];
            let font_name = install_font(&mut doc, page_id, font_id)?;
            let content = encode_text_runs(&font_name, runs)?;
            append_page_content(&mut doc, page_id, content)?;
        }
    }

    let mut output = Vec::new();
    doc.save_to(&mut output)
        .map_err(|err| PdfEngineError::Backend(format!("failed to serialize document: {err}")))?;

    log::info!(
        "composed {} of {} annotations onto {} pages",
        placements.len(),
        annotations.len(),
        by_page.len()
    );

    Ok(output)
}

/// Registers the font in the page's own resource dictionary and returns its resource name.
///
/// Inherited resources are copied down first so existing content keeps resolving its names.
fn install_font(
    doc: &mut Document,
    page_id: ObjectId,
    font_id: ObjectId,
) -> Result<Vec<u8>, PdfEngineError> {
    let mut resources = inherited_attribute(doc, page_id, b"Resources")
        .and_then(|obj| obj.as_dict().ok())
        .cloned()
        .unwrap_or_default();

    let mut fonts = match resources.get(b"Font") {
        Ok(Object::Reference(id)) => doc.get_dictionary(*id).cloned().unwrap_or_default(),
        Ok(Object::Dictionary(dict)) => dict.clone(),
        _ => Dictionary::new(),
    };

    let name = unused_resource_name(&fonts);
    fonts.set(name.clone(), Object::Reference(font_id));
    resources.set("Font", Object::Dictionary(fonts));

    doc.get_object_mut(page_id)
        .and_then(Object::as_dict_mut)?
        .set("Resources", Object::Dictionary(resources));

    Ok(name)
}

fn unused_resource_name(fonts: &Dictionary) -> Vec<u8> {
    let mut suffix = 0_u32;
    loop {
        let candidate = if suffix == 0 {
            FONT_RESOURCE_PREFIX.to_owned()
        } else {
            format!("{FONT_RESOURCE_PREFIX}{suffix}")
        };
        if !fonts.has(candidate.as_bytes()) {
            return candidate.into_bytes();
        }
        suffix += 1;
    }
}

fn encode_text_runs(font_name: &[u8], runs: &[&TextPlacement]) -> Result<Vec<u8>, PdfEngineError> {
    let mut operations = Vec::with_capacity(runs.len() * 8);

    for run in runs {
        operations.extend([
            Operation::new("q", vec![]),
            Operation::new("BT", vec![]),
            Operation::new("Tf", vec![Object::Name(font_name.to_vec()), run.font_size.into()]),
            Operation::new("rg", vec![Object::Integer(0), Object::Integer(0), Object::Integer(0)]),
            Operation::new("Td", vec![run.x.into(), run.y.into()]),
            Operation::new("Tj", vec![Object::String(win_ansi(&run.text), StringFormat::Literal)]),
            Operation::new("ET", vec![]),
            Operation::new("Q", vec![]),
        ]);
    }

    Content { operations }
        .encode()
        .map_err(|err| PdfEngineError::Backend(format!("failed to encode text content: {err}")))
}

/// Appends `content` as a new stream, isolating the existing streams in `q ... Q`.
fn append_page_content(
    doc: &mut Document,
    page_id: ObjectId,
    content: Vec<u8>,
) -> Result<(), PdfEngineError> {
    let existing = match doc.get_dictionary(page_id)?.get(b"Contents") {
        Ok(Object::Reference(id)) => match doc.get_object(*id)? {
            Object::Array(items) => items.clone(),
            _ => vec![Object::Reference(*id)],
        },
        Ok(Object::Array(items)) => items.clone(),
        _ => Vec::new(),
    };

    let mut contents: Vec<Object> = Vec::with_capacity(existing.len() + 3);
    if !existing.is_empty() {
        contents.push(doc.add_object(Stream::new(Dictionary::new(), b"q\n".to_vec())).into());
        contents.extend(existing);
        contents.push(doc.add_object(Stream::new(Dictionary::new(), b"\nQ\n".to_vec())).into());
    }
    contents.push(doc.add_object(Stream::new(Dictionary::new(), content)).into());

    doc.get_object_mut(page_id)
        .and_then(Object::as_dict_mut)?
        .set("Contents", Object::Array(contents));

    Ok(())
}

/// Helvetica is drawn with WinAnsiEncoding; anything it cannot represent becomes `?`.
fn win_ansi(text: &str) -> Vec<u8> {
    let mut substituted = 0_usize;
    let bytes = text
        .chars()
        .map(|ch| match ch {
            ' '..='~' | '\u{a0}'..='\u{ff}' => ch as u8,
            '€' => 0x80,
            '‚' => 0x82,
            'ƒ' => 0x83,
            '„' => 0x84,
            '…' => 0x85,
            '†' => 0x86,
            '‡' => 0x87,
            'ˆ' => 0x88,
            '‰' => 0x89,
            'Š' => 0x8a,
            '‹' => 0x8b,
            'Œ' => 0x8c,
            'Ž' => 0x8e,
            '‘' => 0x91,
            '’' => 0x92,
            '“' => 0x93,
            '”' => 0x94,
            '•' => 0x95,
            '–' => 0x96,
            '—' => 0x97,
            '˜' => 0x98,
            '™' => 0x99,
            'š' => 0x9a,
            '›' => 0x9b,
            'œ' => 0x9c,
            'ž' => 0x9e,
            'Ÿ' => 0x9f,
            _ => {
                substituted += 1;
                b'?'
            }
        })
        .collect();

    if substituted > 0 {
        log::warn!("{substituted} character(s) of {text:?} are not drawable in Helvetica");
    }

    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::pdf_with_pages;
    use crate::page_sizes;
    use doc_model::AnnotationId;

    fn annotation(x: f32, y: f32, font_size: f32, page_index: u32, text: &str) -> Annotation {
        Annotation {
            id: AnnotationId::new_v4(),
            x,
            y,
            width: 200.0,
            height: 30.0,
            text: text.to_owned(),
            font_size,
            page_index,
        }
    }

    fn text_runs(bytes: &[u8], page_index: usize) -> Vec<(f32, f32, f32, Vec<u8>)> {
        let doc = Document::load_mem(bytes).expect("output should parse");
        let page_id = doc.get_pages().into_values().nth(page_index).expect("page expected");
        let content = doc.get_page_content(page_id).expect("page content expected");
        let operations = Content::decode(&content).expect("content should decode").operations;

        let mut runs = Vec::new();
        let mut size = 0.0;
        let mut position = (0.0, 0.0);
        for op in operations {
            match op.operator.as_str() {
                "Tf" => size = op.operands[1].as_float().expect("size expected"),
                "Td" => {
                    position = (
                        op.operands[0].as_float().expect("x expected"),
                        op.operands[1].as_float().expect("y expected"),
                    )
                }
                "Tj" => {
                    let Object::String(text, _) = &op.operands[0] else {
                        panic!("string operand expected");
                    };
                    runs.push((position.0, position.1, size, text.clone()));
                }
                _ => {}
            }
        }
        runs
    }

    fn assert_close(actual: f32, expected: f32) {
        assert!((actual - expected).abs() < 1e-2, "expected {expected}, got {actual}");
    }

    #[test]
    fn document_position_flips_and_unscales() {
        let placed = annotation(100.0, 50.0, 16.0, 0, "a");
        let (x, y) = document_position(&placed, 792.0, 1.5);

        assert_close(x, 66.67);
        assert_close(y, 750.67);
    }

    #[test]
    fn document_position_is_exact_at_unit_scale() {
        let placed = annotation(40.0, 100.0, 12.0, 0, "a");
        assert_eq!(document_position(&placed, 500.0, 1.0), (40.0, 394.0));
    }

    #[test]
    fn plan_skips_pages_outside_the_document() {
        let sizes = [PageSize { width_pt: 612.0, height_pt: 792.0 }];
        let annotations = vec![
            annotation(10.0, 10.0, 16.0, 4, "gone"),
            annotation(10.0, 10.0, 16.0, 0, "kept"),
        ];

        let plan = plan_text_placements(&annotations, &sizes, &ComposeOptions::new(1.0))
            .expect("plan should succeed");

        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].text, "kept");
    }

    #[test]
    fn font_size_units_at_non_unit_scale() {
        let sizes = [PageSize { width_pt: 612.0, height_pt: 792.0 }];
        let annotations = vec![annotation(100.0, 50.0, 16.0, 0, "a")];

        let document_units =
            ComposeOptions { scale: 2.0, font_size_units: FontSizeUnits::Document };
        let display_units = ComposeOptions { scale: 2.0, font_size_units: FontSizeUnits::Display };

        let as_document = plan_text_placements(&annotations, &sizes, &document_units)
            .expect("plan should succeed");
        let as_display = plan_text_placements(&annotations, &sizes, &display_units)
            .expect("plan should succeed");

        assert_eq!(as_document[0].font_size, 16.0);
        assert_eq!(as_display[0].font_size, 8.0);
        // Position does not depend on the unit choice.
        assert_eq!((as_document[0].x, as_document[0].y), (as_display[0].x, as_display[0].y));
    }

    #[test]
    fn compose_draws_text_at_document_position() {
        let bytes = pdf_with_pages(&[(612, 792)]);
        let annotations = vec![annotation(100.0, 50.0, 16.0, 0, "Hello (world)")];

        let output =
            compose(&bytes, &annotations, &ComposeOptions::new(1.5)).expect("compose should work");

        let runs = text_runs(&output, 0);
        let (x, y, size, text) = runs.last().expect("annotation run expected").clone();
        assert_close(x, 66.67);
        assert_close(y, 750.67);
        assert_eq!(size, 16.0);
        assert_eq!(text, b"Hello (world)".to_vec());
    }

    #[test]
    fn compose_keeps_existing_content_and_resources() {
        let bytes = pdf_with_pages(&[(612, 792)]);
        let annotations = vec![annotation(10.0, 10.0, 12.0, 0, "note")];

        let output =
            compose(&bytes, &annotations, &ComposeOptions::new(1.0)).expect("compose should work");

        let texts: Vec<Vec<u8>> = text_runs(&output, 0).into_iter().map(|run| run.3).collect();
        assert_eq!(texts, vec![b"fixture".to_vec(), b"note".to_vec()]);

        let doc = Document::load_mem(&output).expect("output should parse");
        let page_id = doc.get_pages().into_values().next().expect("page expected");
        let resources = doc
            .get_dictionary(page_id)
            .and_then(|page| page.get(b"Resources"))
            .and_then(Object::as_dict)
            .expect("page resources expected");
        let fonts = resources.get(b"Font").and_then(Object::as_dict).expect("fonts expected");
        assert!(fonts.has(b"F1"));
        assert!(fonts.has(b"FAnnot"));
    }

    #[test]
    fn compose_skips_out_of_range_without_aborting() {
        let bytes = pdf_with_pages(&[(612, 792), (612, 792)]);
        let annotations = vec![
            annotation(10.0, 10.0, 12.0, 9, "lost"),
            annotation(10.0, 10.0, 12.0, 1, "second page"),
        ];

        let output =
            compose(&bytes, &annotations, &ComposeOptions::new(1.0)).expect("compose should work");

        let first: Vec<Vec<u8>> = text_runs(&output, 0).into_iter().map(|run| run.3).collect();
        let second: Vec<Vec<u8>> = text_runs(&output, 1).into_iter().map(|run| run.3).collect();
        assert_eq!(first, vec![b"fixture".to_vec()]);
        assert_eq!(second, vec![b"fixture".to_vec(), b"second page".to_vec()]);
        assert_eq!(page_sizes(&output).expect("sizes expected").len(), 2);
    }

    #[test]
    fn compose_without_annotations_still_round_trips() {
        let bytes = pdf_with_pages(&[(300, 400)]);

        let output = compose(&bytes, &[], &ComposeOptions::default()).expect("compose should work");

        assert_eq!(page_sizes(&output).expect("sizes expected")[0].height_pt, 400.0);
    }

    #[test]
    fn compose_rejects_malformed_input() {
        let annotations = vec![annotation(10.0, 10.0, 12.0, 0, "x")];

        let err = compose(b"not a pdf at all", &annotations, &ComposeOptions::default())
            .expect_err("compose should fail");
        assert!(matches!(err, PdfEngineError::InvalidDocument(_)));
    }

    #[test]
    fn compose_rejects_invalid_scale() {
        let bytes = pdf_with_pages(&[(612, 792)]);

        let err = compose(&bytes, &[], &ComposeOptions::new(0.0)).expect_err("compose should fail");
        assert!(matches!(err, PdfEngineError::InvalidScale(_)));
    }

    #[test]
    fn compose_rejects_non_finite_positions() {
        let bytes = pdf_with_pages(&[(612, 792)]);
        let broken = annotation(f32::NAN, f32::INFINITY, 12.0, 0, "x");
        let broken_id = broken.id;
        let annotations = vec![annotation(10.0, 10.0, 12.0, 0, "fine"), broken];

        let err = compose(&bytes, &annotations, &ComposeOptions::new(1.0))
            .expect_err("compose should fail");
        assert!(matches!(err, PdfEngineError::InvalidAnnotation { id, .. } if id == broken_id));
    }

    #[test]
    fn plan_rejects_non_finite_font_size() {
        let sizes = [PageSize { width_pt: 612.0, height_pt: 792.0 }];
        let annotations = vec![annotation(10.0, 10.0, f32::INFINITY, 0, "x")];

        let result = plan_text_placements(&annotations, &sizes, &ComposeOptions::new(1.0));
        assert!(matches!(result, Err(PdfEngineError::InvalidAnnotation { .. })));
    }

    #[test]
    fn plan_ignores_non_finite_annotation_on_missing_page() {
        let sizes = [PageSize { width_pt: 612.0, height_pt: 792.0 }];
        let annotations = vec![annotation(f32::NAN, 10.0, 12.0, 3, "x")];

        let plan = plan_text_placements(&annotations, &sizes, &ComposeOptions::new(1.0))
            .expect("plan should succeed");
        assert!(plan.is_empty());
    }

    #[test]
    fn win_ansi_maps_latin_and_substitutes_the_rest() {
        assert_eq!(win_ansi("Café – ok"), b"Caf\xe9 \x96 ok".to_vec());
        assert_eq!(win_ansi("Š ž ™ † ƒ Ÿ"), b"\x8a \x9e \x99 \x86 \x83 \x9f".to_vec());
        assert_eq!(win_ansi("‰‹›ˆ˜‡šŽ"), b"\x89\x8b\x9b\x88\x98\x87\x9a\x8e".to_vec());
        assert_eq!(win_ansi("日本"), b"??".to_vec());
    }
}
