use directories::ProjectDirs;
use doc_model::{FontSizeUnits, PlacementDefaults};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

const CONFIG_SCHEMA_VERSION: u32 = 1;

/// Overrides the platform data directory.
pub const DATA_DIR_ENV: &str = "PDF_ANNOTATE_DATA_DIR";

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("unable to resolve local data directory")]
    NoDataDirectory,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("unsupported config version {0}")]
    UnsupportedVersion(u32),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EditorConfig {
    pub scale: f32,
    pub placement: PlacementDefaults,
    pub font_size_units: FontSizeUnits,
    pub max_preview_dimension_px: u32,
    pub pdfium_library_dir: Option<PathBuf>,
}

impl Default for EditorConfig {
    fn default() -> Self {
        Self {
            scale: 1.5,
            placement: PlacementDefaults::default(),
            font_size_units: FontSizeUnits::default(),
            max_preview_dimension_px: 8192,
            pdfium_library_dir: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Storage {
    root: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ConfigEnvelope {
    version: u32,
    config: EditorConfig,
}

impl Storage {
    /// Uses `PDF_ANNOTATE_DATA_DIR` when set, the platform data directory otherwise.
    pub fn from_environment() -> Result<Self, StorageError> {
        match std::env::var_os(DATA_DIR_ENV) {
            Some(dir) => Ok(Self::with_root(dir)),
            None => Self::from_default_project(),
        }
    }

    pub fn from_default_project() -> Result<Self, StorageError> {
        let dirs = ProjectDirs::from("dev", "PdfAnnotate", "PdfAnnotate")
            .ok_or(StorageError::NoDataDirectory)?;

        Ok(Self { root: dirs.data_local_dir().to_path_buf() })
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.json")
    }

    pub fn load_config(&self) -> Result<EditorConfig, StorageError> {
        let path = self.config_path();
        if !path.exists() {
            log::debug!("no config at {}, using defaults", path.display());
            return Ok(EditorConfig::default());
        }

        let bytes = fs::read(path)?;
        let envelope: ConfigEnvelope = serde_json::from_slice(&bytes)?;
        if envelope.version > CONFIG_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedVersion(envelope.version));
        }

        Ok(envelope.config)
    }

    pub fn save_config(&self, config: &EditorConfig) -> Result<(), StorageError> {
        fs::create_dir_all(&self.root)?;

        let envelope = ConfigEnvelope { version: CONFIG_SCHEMA_VERSION, config: config.clone() };

        let bytes = serde_json::to_vec_pretty(&envelope)?;
        fs::write(self.config_path(), bytes)?;
        Ok(())
    }
}
