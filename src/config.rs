//! Configuration for the local image loader.
//!
//! Handles loading, saving, and validating configuration from JSON files,
//! and building an [`ImageManager`] from it.

use crate::automation::{self, Action};
use crate::canvas::{Canvas, FrameBuffer};
use crate::controller::LoaderSettings;
use crate::decoder::{ImageFormat, MAX_DIMENSION};
use crate::manager::ImageManager;
use crate::resource::ImageOptions;
use crate::storage::{DirectoryProvider, FileProvider};
use crate::transform::{ImageType, Transparency};
use image::Rgba;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Default configuration file path
pub const DEFAULT_CONFIG_PATH: &str = "/etc/local-image/config.json";

/// Options of the generic image schema that local images do not support
const FORBIDDEN_IMAGE_KEYS: [&str; 3] = ["file", "invert_alpha", "dither"];

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config JSON: {0}")]
    ParseError(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError(message.into())
}

/// A directory the images are read from
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    pub id: String,
    /// Directory that image paths are resolved against
    pub root: PathBuf,
}

/// Resize target, either `{"width": w, "height": h}`, `[w, h]` or `"WxH"`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ResizeConfig {
    Size { width: u32, height: u32 },
    Pair([u32; 2]),
    Text(String),
}

impl ResizeConfig {
    /// Width and height
    pub fn dimensions(&self) -> Result<(u32, u32), ConfigError> {
        match self {
            ResizeConfig::Size { width, height } => Ok((*width, *height)),
            ResizeConfig::Pair([width, height]) => Ok((*width, *height)),
            ResizeConfig::Text(text) => {
                let (w, h) = text
                    .split_once(['x', 'X'])
                    .ok_or_else(|| invalid(format!("Invalid resize '{}', expected WxH", text)))?;
                let parse = |v: &str| {
                    v.trim()
                        .parse::<u32>()
                        .map_err(|_| invalid(format!("Invalid resize '{}', expected WxH", text)))
                };
                Ok((parse(w)?, parse(h)?))
            }
        }
    }
}

/// One local image
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ImageConfig {
    pub id: String,

    /// Storage the file is read from
    #[serde(alias = "sd_mmc_card_id")]
    pub storage_id: String,

    pub path: String,

    /// BMP, JPEG (or JPG) or PNG
    pub format: ImageFormat,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resize: Option<ResizeConfig>,

    /// Image shown while this one is not loaded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<String>,

    #[serde(default, rename = "type")]
    pub image_type: ImageType,

    #[serde(default)]
    pub transparency: Transparency,

    /// Canvas position
    #[serde(default)]
    pub x: i32,
    #[serde(default)]
    pub y: i32,

    /// Start loading as soon as the loader runs
    #[serde(default = "default_true")]
    pub load_on_start: bool,

    /// Reload periodically
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_interval_secs: Option<u64>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_load_finished: Vec<Action>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_error: Vec<Action>,
}

/// Work limits of the loader
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct LoaderConfig {
    /// Bytes read per step
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Rows forwarded per step
    #[serde(default = "default_rows_per_step")]
    pub rows_per_step: usize,

    /// Fail a load after this many steps
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_steps: Option<u32>,

    /// Step interval in milliseconds
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,

    /// Largest accepted image, in pixels
    #[serde(default = "default_max_pixels")]
    pub max_pixels: u64,
}

/// Canvas the images are drawn onto
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CanvasConfig {
    #[serde(default = "default_canvas_width")]
    pub width: u32,

    #[serde(default = "default_canvas_height")]
    pub height: u32,

    /// Background colour as [r, g, b]
    #[serde(default)]
    pub background: [u8; 3],
}

fn default_true() -> bool {
    true
}

fn default_chunk_size() -> usize {
    4096
}

fn default_rows_per_step() -> usize {
    64
}

fn default_tick_ms() -> u64 {
    10
}

fn default_max_pixels() -> u64 {
    4096 * 4096
}

fn default_canvas_width() -> u32 {
    320
}

fn default_canvas_height() -> u32 {
    240
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            rows_per_step: default_rows_per_step(),
            max_steps: None,
            tick_ms: default_tick_ms(),
            max_pixels: default_max_pixels(),
        }
    }
}

impl LoaderConfig {
    pub fn settings(&self) -> LoaderSettings {
        LoaderSettings {
            chunk_size: self.chunk_size,
            rows_per_step: self.rows_per_step,
            max_steps: self.max_steps,
            max_pixels: self.max_pixels,
        }
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

impl Default for CanvasConfig {
    fn default() -> Self {
        Self {
            width: default_canvas_width(),
            height: default_canvas_height(),
            background: [0, 0, 0],
        }
    }
}

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub storage: Vec<StorageConfig>,

    #[serde(default)]
    pub images: Vec<ImageConfig>,

    #[serde(default)]
    pub loader: LoaderConfig,

    #[serde(default)]
    pub canvas: CanvasConfig,
}

impl Config {
    /// Load configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Parse and validate configuration JSON
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let value: serde_json::Value = serde_json::from_str(content)?;
        check_forbidden_keys(&value)?;

        let config: Config = serde_json::from_value(value)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a JSON file atomically
    ///
    /// Writes to a temporary file first and renames it over `path`.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_json::to_string_pretty(self)?;

        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)?;

        std::fs::rename(&tmp_path, path).map_err(|e| {
            let _ = std::fs::remove_file(&tmp_path);
            ConfigError::ReadError(e)
        })?;

        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut storage_ids = HashSet::new();
        for storage in &self.storage {
            if storage.id.trim().is_empty() {
                return Err(invalid("Storage id cannot be empty"));
            }
            if !storage_ids.insert(storage.id.as_str()) {
                return Err(invalid(format!("Duplicate storage id: '{}'", storage.id)));
            }
        }

        if self.images.is_empty() {
            return Err(invalid("At least one image is required"));
        }

        let mut image_ids = HashSet::new();
        for image in &self.images {
            if image.id.trim().is_empty() {
                return Err(invalid("Image id cannot be empty"));
            }
            if !image_ids.insert(image.id.as_str()) {
                return Err(invalid(format!("Duplicate image id: '{}'", image.id)));
            }
        }

        for image in &self.images {
            self.validate_image(image, &storage_ids, &image_ids)
                .map_err(|e| match e {
                    ConfigError::ValidationError(msg) => {
                        invalid(format!("Image '{}': {}", image.id, msg))
                    }
                    other => other,
                })?;
        }

        if self.loader.chunk_size == 0 {
            return Err(invalid("loader.chunk_size must be greater than 0"));
        }
        if self.loader.rows_per_step == 0 {
            return Err(invalid("loader.rows_per_step must be greater than 0"));
        }
        if self.loader.tick_ms == 0 {
            return Err(invalid("loader.tick_ms must be greater than 0"));
        }
        if self.loader.max_steps == Some(0) {
            return Err(invalid("loader.max_steps must be greater than 0"));
        }

        let canvas_range = 1..=MAX_DIMENSION;
        if !canvas_range.contains(&self.canvas.width) || !canvas_range.contains(&self.canvas.height) {
            return Err(invalid(format!(
                "canvas size must be between 1 and {} pixels",
                MAX_DIMENSION
            )));
        }

        Ok(())
    }

    fn validate_image(
        &self,
        image: &ImageConfig,
        storage_ids: &HashSet<&str>,
        image_ids: &HashSet<&str>,
    ) -> Result<(), ConfigError> {
        if !storage_ids.contains(image.storage_id.as_str()) {
            return Err(invalid(format!("unknown storage '{}'", image.storage_id)));
        }

        if image.path.trim().is_empty() {
            return Err(invalid("path cannot be empty"));
        }

        let capability = image.format.capability();
        if !capability.enabled {
            return Err(invalid(format!(
                "format {} requires the '{}' feature",
                image.format, capability.feature
            )));
        }

        if let Some(resize) = &image.resize {
            let (width, height) = resize.dimensions()?;
            if width == 0 || height == 0 || width > MAX_DIMENSION || height > MAX_DIMENSION {
                return Err(invalid(format!(
                    "resize {}x{} out of range (1-{})",
                    width, height, MAX_DIMENSION
                )));
            }
        }

        if let Some(placeholder) = &image.placeholder {
            if placeholder == &image.id {
                return Err(invalid("an image cannot be its own placeholder"));
            }
            if !image_ids.contains(placeholder.as_str()) {
                return Err(invalid(format!("unknown placeholder '{}'", placeholder)));
            }
        }

        if image.update_interval_secs == Some(0) {
            return Err(invalid("update_interval_secs must be greater than 0"));
        }

        for action in image.on_load_finished.iter().chain(&image.on_error) {
            if let Some(target) = action.target() {
                if !image_ids.contains(target) {
                    return Err(invalid(format!("action targets unknown image '{}'", target)));
                }
            }
        }

        Ok(())
    }

    /// Directory providers for every configured storage
    pub fn providers(&self) -> HashMap<String, Arc<dyn FileProvider>> {
        self.storage
            .iter()
            .map(|s| {
                let provider: Arc<dyn FileProvider> = Arc::new(DirectoryProvider::new(&s.root));
                (s.id.clone(), provider)
            })
            .collect()
    }

    /// Build a manager drawing onto an in-memory frame
    pub fn build_manager(&self) -> Result<ImageManager<FrameBuffer>, ConfigError> {
        let [r, g, b] = self.canvas.background;
        let canvas = FrameBuffer::new(self.canvas.width, self.canvas.height, Rgba([r, g, b, 0xFF]));
        self.build_manager_with(canvas, &self.providers())
    }

    /// Build a manager with the given canvas and storage providers
    pub fn build_manager_with<C: Canvas>(
        &self,
        canvas: C,
        providers: &HashMap<String, Arc<dyn FileProvider>>,
    ) -> Result<ImageManager<C>, ConfigError> {
        let mut manager = ImageManager::new(canvas, self.loader.settings());
        let to_config_error = |e: crate::controller::LoadError| invalid(e.to_string());

        for image in &self.images {
            let storage = providers
                .get(&image.storage_id)
                .ok_or_else(|| invalid(format!("unknown storage '{}'", image.storage_id)))?;
            let resize = image.resize.as_ref().map(ResizeConfig::dimensions).transpose()?;

            let id = manager
                .add_resource(
                    &image.id,
                    ImageOptions {
                        path: image.path.clone(),
                        format: image.format,
                        resize,
                        image_type: image.image_type,
                        transparency: image.transparency,
                        position: (image.x, image.y),
                        storage_name: image.storage_id.clone(),
                        storage: Arc::clone(storage),
                    },
                )
                .map_err(to_config_error)?;

            let sender = manager.action_sender();
            if !image.on_load_finished.is_empty() {
                manager.on_load_finished(
                    id,
                    automation::finished_listener(
                        image.on_load_finished.clone(),
                        image.id.clone(),
                        sender.clone(),
                    ),
                );
            }
            if !image.on_error.is_empty() {
                manager.on_error(
                    id,
                    automation::error_listener(image.on_error.clone(), image.id.clone(), sender),
                );
            }
        }

        for image in &self.images {
            if let Some(placeholder) = &image.placeholder {
                let id = manager.resolve(&image.id).map_err(to_config_error)?;
                let placeholder = manager.resolve(placeholder).map_err(to_config_error)?;
                manager
                    .set_placeholder(id, Some(placeholder))
                    .map_err(to_config_error)?;
            }
        }

        tracing::info!("Configured {} image(s)", self.images.len());
        Ok(manager)
    }

    /// Images to load when the loader starts
    pub fn startup_images(&self) -> Vec<String> {
        self.images
            .iter()
            .filter(|i| i.load_on_start)
            .map(|i| i.id.clone())
            .collect()
    }

    /// Images with a periodic reload, and their interval
    pub fn update_intervals(&self) -> Vec<(String, Duration)> {
        self.images
            .iter()
            .filter_map(|i| {
                i.update_interval_secs
                    .map(|secs| (i.id.clone(), Duration::from_secs(secs)))
            })
            .collect()
    }

    /// Get image configuration by id
    pub fn get_image(&self, id: &str) -> Option<&ImageConfig> {
        self.images.iter().find(|i| i.id == id)
    }
}

/// Reject options inherited from the generic image schema before the
/// typed parse, so the message names the offending key
fn check_forbidden_keys(value: &serde_json::Value) -> Result<(), ConfigError> {
    let Some(images) = value.get("images").and_then(serde_json::Value::as_array) else {
        return Ok(());
    };

    for image in images.iter().filter_map(serde_json::Value::as_object) {
        if let Some(key) = FORBIDDEN_IMAGE_KEYS.iter().find(|k| image.contains_key(**k)) {
            return Err(invalid(format!("{} is an invalid option for local_image", key)));
        }
    }
    Ok(())
}
