//! Local image loading pipeline.
//!
//! Loads BMP, JPEG and PNG images from filesystem-backed storage, decodes
//! them incrementally in bounded chunks, and writes the rows into a pixel
//! buffer and onto a canvas. A placeholder image can be shown while a load
//! is in progress, and listeners are notified when a load finishes or
//! fails.
//!
//! - [`storage`]: file providers and readers
//! - [`decoder`]: per-format incremental decoders
//! - [`transform`]: resize, pixel type and transparency per row
//! - [`canvas`]: where rows are drawn
//! - [`controller`]: in-flight load jobs
//! - [`resource`], [`events`], [`manager`]: resources, listeners and the
//!   actions on them
//! - [`config`], [`automation`], [`scheduler`]: JSON setup and the async
//!   driver

pub mod automation;
pub mod canvas;
pub mod config;
pub mod controller;
pub mod decoder;
pub mod events;
pub mod manager;
pub mod resource;
pub mod scheduler;
pub mod storage;
pub mod transform;

pub use canvas::{Canvas, FrameBuffer};
pub use config::{Config, ConfigError};
pub use controller::{ErrorCode, LoadError, LoaderSettings};
pub use decoder::ImageFormat;
pub use manager::{ImageAction, ImageManager};
pub use resource::{ImageOptions, LoadStatus, ResourceId};
pub use scheduler::Scheduler;
pub use transform::{ImageType, Transparency};
