use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pdf_engine::{validate_scale, Rasterizer, RasterizerConfig};
use serde::Serialize;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use storage::{EditorConfig, Storage};
use viewer_core::{
    ClientPoint, EditorSession, HitTarget, InputEvent, InteractionSurface, SurfaceChange,
    SurfaceRect,
};

#[derive(Debug, Parser)]
#[command(name = "pdf-annotate")]
#[command(about = "Place text notes on PDF pages and burn them into the document")]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print machine-readable PDF metadata.
    Info {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
    /// Render a page preview PNG.
    Render {
        #[arg(value_name = "FILE")]
        file: PathBuf,
        #[arg(long, default_value_t = 1)]
        page: u32,
        /// Defaults to the configured scale.
        #[arg(long)]
        scale: Option<f32>,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Place notes as if double-clicked on the preview, then write the composed PDF.
    Stamp {
        #[arg(value_name = "FILE")]
        file: PathBuf,
        /// `PAGE:X:Y:TEXT`, with a 1-based page and X/Y in preview pixels at `--scale`.
        #[arg(long = "note", value_name = "PAGE:X:Y:TEXT", required = true)]
        notes: Vec<Note>,
        #[arg(long)]
        scale: Option<f32>,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Print the effective configuration.
    Config {
        /// Print the config file location instead.
        #[arg(long, conflicts_with = "init")]
        path: bool,
        /// Write the effective configuration to the config file, keeping any values already set.
        #[arg(long)]
        init: bool,
    },
    /// Print CLI version.
    Version,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Note {
    pub page: u32,
    pub x: f32,
    pub y: f32,
    pub text: String,
}

impl FromStr for Note {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let mut parts = value.splitn(4, ':');
        let (Some(page), Some(x), Some(y), Some(text)) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(format!("expected PAGE:X:Y:TEXT, got `{value}`"));
        };

        let page = page.parse::<u32>().map_err(|err| format!("invalid page `{page}`: {err}"))?;
        if page == 0 {
            return Err("page is 1-based and must be >= 1".to_owned());
        }

        Ok(Self { page, x: coordinate("x", x)?, y: coordinate("y", y)?, text: text.to_owned() })
    }
}

fn coordinate(axis: &str, value: &str) -> Result<f32, String> {
    let parsed = value.parse::<f32>().map_err(|err| format!("invalid {axis} `{value}`: {err}"))?;
    if !parsed.is_finite() {
        return Err(format!("{axis} must be a finite number, got `{value}`"));
    }
    Ok(parsed)
}

#[derive(Debug, Serialize)]
struct InfoOutput {
    path: String,
    page_count: u32,
    pages: Vec<PageSizeOutput>,
}

#[derive(Debug, Serialize)]
struct PageSizeOutput {
    width: f32,
    height: f32,
}

pub fn run<I, T>(args: I) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = Cli::parse_from(args);

    match cli.command {
        Commands::Info { file } => run_info(&file),
        Commands::Render { file, page, scale, output } => {
            run_render(&file, page, scale, output.as_deref())
        }
        Commands::Stamp { file, notes, scale, output } => {
            run_stamp(&file, &notes, scale, output.as_deref())
        }
        Commands::Config { path, init } => run_config(path, init),
        Commands::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn run_info(file: &Path) -> Result<()> {
    let bytes = read_pdf(file)?;
    let sizes = pdf_engine::page_sizes(&bytes).context("failed to open PDF")?;

    let payload = InfoOutput {
        path: file.display().to_string(),
        page_count: sizes.len() as u32,
        pages: sizes
            .iter()
            .map(|size| PageSizeOutput { width: size.width_pt, height: size.height_pt })
            .collect(),
    };

    let json = serde_json::to_string_pretty(&payload)?;
    println!("{json}");

    Ok(())
}

fn run_render(file: &Path, page: u32, scale: Option<f32>, output: Option<&Path>) -> Result<()> {
    let bytes = read_pdf(file)?;

    if page == 0 {
        anyhow::bail!("--page is 1-based and must be >= 1");
    }

    let config = load_config()?;
    let scale = validate_scale(scale.unwrap_or(config.scale))?;
    let rasterizer = rasterizer(&config)?;

    let rendered =
        rasterizer.rasterize(&bytes, page - 1, scale).context("failed to render page")?;

    let output = output.map(ToOwned::to_owned).unwrap_or_else(|| {
        sibling_output(file, &format!("page-{page}"), "png")
    });
    create_parent(&output)?;

    rendered
        .image
        .save(&output)
        .with_context(|| format!("failed to write image to {}", output.display()))?;

    println!("{}", output.display());

    Ok(())
}

fn run_stamp(file: &Path, notes: &[Note], scale: Option<f32>, output: Option<&Path>) -> Result<()> {
    let bytes = read_pdf(file)?;

    let config = load_config()?;
    let scale = validate_scale(scale.unwrap_or(config.scale))?;
    let surface = InteractionSurface::new(config.placement.clone(), config.font_size_units, scale);

    let mut session =
        EditorSession::open(rasterizer(&config)?, bytes, surface).context("failed to open PDF")?;

    // Notes are given in preview pixels, so the surface sits at the client origin.
    let origin = SurfaceRect { left: 0.0, top: 0.0, width: 0.0, height: 0.0 };

    for note in notes {
        let page_index = note.page - 1;
        if page_index >= session.page_count() {
            anyhow::bail!(
                "note page {} out of range (document has {} pages)",
                note.page,
                session.page_count()
            );
        }
        session.surface_mut().set_page_index(page_index);

        let change = session.handle(InputEvent::DoubleClick {
            target: HitTarget::Page,
            pointer: ClientPoint::new(note.x, note.y),
            surface: origin,
        })?;
        let SurfaceChange::Added(id) = change else {
            anyhow::bail!("note on page {} was not placed", note.page);
        };

        session.handle(InputEvent::TextEdit { id, text: note.text.clone() })?;
    }

    let composed = session.export().context("failed to compose annotations")?;

    let output =
        output.map(ToOwned::to_owned).unwrap_or_else(|| sibling_output(file, "annotated", "pdf"));
    create_parent(&output)?;

    fs::write(&output, composed)
        .with_context(|| format!("failed to write PDF to {}", output.display()))?;

    log::info!("stamped {} notes into {}", notes.len(), output.display());
    println!("{}", output.display());

    Ok(())
}

fn run_config(path: bool, init: bool) -> Result<()> {
    let storage = Storage::from_environment().context("failed to locate configuration")?;

    if path {
        println!("{}", storage.config_path().display());
        return Ok(());
    }

    let config = storage.load_config().context("failed to load configuration")?;

    if init {
        storage.save_config(&config).context("failed to write configuration")?;
        println!("{}", storage.config_path().display());
        return Ok(());
    }

    println!("{}", serde_json::to_string_pretty(&config)?);

    Ok(())
}

fn load_config() -> Result<EditorConfig> {
    Storage::from_environment()
        .and_then(|storage| storage.load_config())
        .context("failed to load configuration")
}

fn rasterizer_config(config: &EditorConfig) -> RasterizerConfig {
    RasterizerConfig {
        max_dimension_px: config.max_preview_dimension_px,
        library_dir: config.pdfium_library_dir.clone(),
        ..RasterizerConfig::default()
    }
}

#[cfg(not(feature = "pdfium"))]
fn rasterizer(config: &EditorConfig) -> Result<Box<dyn Rasterizer>> {
    Ok(Box::new(pdf_engine::LopdfEngine::new(rasterizer_config(config))))
}

#[cfg(feature = "pdfium")]
fn rasterizer(config: &EditorConfig) -> Result<Box<dyn Rasterizer>> {
    let engine = pdf_engine::pdfium_backend::PdfiumRasterizer::new(rasterizer_config(config))
        .context("failed to load pdfium")?;
    Ok(Box::new(engine))
}

fn read_pdf(path: &Path) -> Result<Vec<u8>> {
    ensure_pdf_exists(path)?;
    fs::read(path).with_context(|| format!("failed to read {}", path.display()))
}

fn ensure_pdf_exists(path: &Path) -> Result<()> {
    if !path.exists() {
        anyhow::bail!("file does not exist: {}", path.display());
    }

    if !path.is_file() {
        anyhow::bail!("path is not a file: {}", path.display());
    }

    Ok(())
}

fn create_parent(path: &Path) -> Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => Ok(fs::create_dir_all(parent)?),
        _ => Ok(()),
    }
}

fn sibling_output(file: &Path, suffix: &str, extension: &str) -> PathBuf {
    let stem = file.file_stem().and_then(|name| name.to_str()).unwrap_or("document");

    file.with_file_name(format!("{stem}-{suffix}.{extension}"))
}
