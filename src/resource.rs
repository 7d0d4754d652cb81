//! Addressable image resources.
//!
//! An [`ImageResource`] is what other components refer to: it owns the
//! configured path and render options, the load status and, once loaded,
//! the committed pixel buffer. Status changes go through the crate-internal
//! transition methods so that `pixels` is present exactly when the status is
//! [`LoadStatus::Loaded`].

use crate::controller::ErrorCode;
use crate::decoder::ImageFormat;
use crate::storage::FileProvider;
use crate::transform::{ImageType, Transparency};
use image::RgbaImage;
use std::fmt;
use std::sync::Arc;

/// Handle of a resource registered with the manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(pub(crate) u32);

impl ResourceId {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Monotonic load attempt counter. A newer generation supersedes older ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Generation(pub(crate) u64);

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gen {}", self.0)
    }
}

/// Load status of a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStatus {
    Idle,
    Loading,
    Loaded,
    Failed,
    Released,
}

impl fmt::Display for LoadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoadStatus::Idle => "idle",
            LoadStatus::Loading => "loading",
            LoadStatus::Loaded => "loaded",
            LoadStatus::Failed => "failed",
            LoadStatus::Released => "released",
        };
        f.write_str(name)
    }
}

/// Options a resource is created with
#[derive(Clone)]
pub struct ImageOptions {
    pub path: String,
    pub format: ImageFormat,
    /// Target size; `None` keeps the source size
    pub resize: Option<(u32, u32)>,
    pub image_type: ImageType,
    pub transparency: Transparency,
    /// Canvas origin the image is drawn at
    pub position: (i32, i32),
    /// Name of the storage the file is read from, for logging
    pub storage_name: String,
    pub storage: Arc<dyn FileProvider>,
}

/// An image that can be loaded from storage
pub struct ImageResource {
    id: ResourceId,
    name: String,
    path: String,
    format: ImageFormat,
    resize: Option<(u32, u32)>,
    image_type: ImageType,
    transparency: Transparency,
    position: (i32, i32),
    storage_name: String,
    storage: Arc<dyn FileProvider>,
    /// Weak reference: only the id is kept
    placeholder: Option<ResourceId>,
    status: LoadStatus,
    pixels: Option<RgbaImage>,
    last_error: Option<ErrorCode>,
    generation: Generation,
    /// Rows of the current generation have reached the canvas
    rows_drawn: bool,
}

impl ImageResource {
    pub(crate) fn new(id: ResourceId, name: &str, options: ImageOptions) -> Self {
        Self {
            id,
            name: name.to_string(),
            path: options.path,
            format: options.format,
            resize: options.resize,
            image_type: options.image_type,
            transparency: options.transparency,
            position: options.position,
            storage_name: options.storage_name,
            storage: options.storage,
            placeholder: None,
            status: LoadStatus::Idle,
            pixels: None,
            last_error: None,
            generation: Generation::default(),
            rows_drawn: false,
        }
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn format(&self) -> ImageFormat {
        self.format
    }

    pub fn resize(&self) -> Option<(u32, u32)> {
        self.resize
    }

    pub fn image_type(&self) -> ImageType {
        self.image_type
    }

    pub fn transparency(&self) -> Transparency {
        self.transparency
    }

    pub fn position(&self) -> (i32, i32) {
        self.position
    }

    pub fn storage_name(&self) -> &str {
        &self.storage_name
    }

    pub fn storage(&self) -> &Arc<dyn FileProvider> {
        &self.storage
    }

    pub fn placeholder(&self) -> Option<ResourceId> {
        self.placeholder
    }

    pub fn status(&self) -> LoadStatus {
        self.status
    }

    /// Committed pixels; present only while `Loaded`
    pub fn pixels(&self) -> Option<&RgbaImage> {
        self.pixels.as_ref()
    }

    /// Code of the most recent failed load
    pub fn last_error(&self) -> Option<ErrorCode> {
        self.last_error
    }

    /// Generation of the most recent load attempt
    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Whether the in-flight load has drawn rows of its own, after which
    /// the placeholder no longer stands in for it
    pub fn rows_drawn(&self) -> bool {
        self.status == LoadStatus::Loading && self.rows_drawn
    }

    pub(crate) fn set_path(&mut self, path: &str) {
        self.path = path.to_string();
    }

    pub(crate) fn set_placeholder(&mut self, placeholder: Option<ResourceId>) {
        self.placeholder = placeholder;
    }

    /// `* -> Loading`. Previous pixels are dropped; the new generation's
    /// rows are staged by its job until it finishes.
    pub(crate) fn begin_load(&mut self, generation: Generation) {
        self.generation = generation;
        self.status = LoadStatus::Loading;
        self.pixels = None;
        self.rows_drawn = false;
    }

    pub(crate) fn mark_rows_drawn(&mut self) {
        if self.status == LoadStatus::Loading {
            self.rows_drawn = true;
        }
    }

    /// `Loading -> Loaded`
    pub(crate) fn commit(&mut self, pixels: RgbaImage) {
        self.pixels = Some(pixels);
        self.last_error = None;
        self.status = LoadStatus::Loaded;
    }

    /// `Loading -> Failed`
    pub(crate) fn fail(&mut self, code: ErrorCode) {
        self.pixels = None;
        self.last_error = Some(code);
        self.status = LoadStatus::Failed;
    }

    /// `Loading -> Idle` after a cancelled load
    pub(crate) fn cancel(&mut self) {
        if self.status == LoadStatus::Loading {
            self.status = LoadStatus::Idle;
        }
    }

    /// Any state to `Released`, dropping the pixel buffer
    pub(crate) fn release(&mut self) {
        self.pixels = None;
        self.status = LoadStatus::Released;
    }
}

impl fmt::Debug for ImageResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageResource")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("path", &self.path)
            .field("format", &self.format)
            .field("status", &self.status)
            .field("generation", &self.generation)
            .field("storage", &self.storage_name)
            .finish_non_exhaustive()
    }
}
