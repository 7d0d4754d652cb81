//! Image manager.
//!
//! Single owner of every resource, the load controller, the listener
//! registry and the canvas. All actions on resources go through
//! `&mut ImageManager`, and [`ImageManager::step`] is the only place where
//! loads make progress and listeners run.
//!
//! Listeners cannot borrow the manager. Those that want to act on images
//! send an [`ImageAction`] through [`ImageManager::action_sender`]; queued
//! actions are applied at the end of each step, after dispatch.

use crate::canvas::{draw_image, Canvas};
use crate::controller::{
    ErrorCode, LoadController, LoadError, LoadOutcome, LoadProgress, LoaderSettings,
};
use crate::events::{ErrorListener, EventDispatcher, FinishedListener};
use crate::resource::{Generation, ImageOptions, ImageResource, LoadStatus, ResourceId};
use image::RgbaImage;
use std::collections::HashMap;
use tokio::sync::mpsc;

/// Placeholder chains deeper than this are not followed
const MAX_PLACEHOLDER_DEPTH: usize = 4;

/// Action on a resource, addressed by name
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageAction {
    Load { id: String },
    /// Restart the load, switching to `path` first when given
    Reload { id: String, path: Option<String> },
    Release { id: String },
    SetPath { id: String, path: String },
}

impl ImageAction {
    pub fn target(&self) -> &str {
        match self {
            ImageAction::Load { id }
            | ImageAction::Reload { id, .. }
            | ImageAction::Release { id }
            | ImageAction::SetPath { id, .. } => id,
        }
    }
}

/// Sending half of the manager's action queue
pub type ActionSender = mpsc::UnboundedSender<ImageAction>;

/// Owns and drives all image resources
pub struct ImageManager<C: Canvas> {
    resources: Vec<ImageResource>,
    names: HashMap<String, ResourceId>,
    controller: LoadController,
    dispatcher: EventDispatcher,
    canvas: C,
    action_tx: ActionSender,
    action_rx: mpsc::UnboundedReceiver<ImageAction>,
}

impl<C: Canvas> ImageManager<C> {
    pub fn new(canvas: C, settings: LoaderSettings) -> Self {
        let (action_tx, action_rx) = mpsc::unbounded_channel();
        Self {
            resources: Vec::new(),
            names: HashMap::new(),
            controller: LoadController::new(settings),
            dispatcher: EventDispatcher::new(),
            canvas,
            action_tx,
            action_rx,
        }
    }

    /// Register a new resource under `name`
    pub fn add_resource(&mut self, name: &str, options: ImageOptions) -> Result<ResourceId, LoadError> {
        if self.names.contains_key(name) {
            return Err(LoadError::DuplicateResource(name.to_string()));
        }

        let id = ResourceId(self.resources.len() as u32);
        tracing::debug!(
            "Registered image {} ({} on {}:{})",
            name,
            options.format,
            options.storage_name,
            options.path
        );
        self.resources.push(ImageResource::new(id, name, options));
        self.names.insert(name.to_string(), id);
        Ok(id)
    }

    /// Set or clear the image shown while `id` is not loaded
    pub fn set_placeholder(
        &mut self,
        id: ResourceId,
        placeholder: Option<ResourceId>,
    ) -> Result<(), LoadError> {
        if let Some(p) = placeholder {
            if p == id {
                return Err(LoadError::UnknownResource(format!(
                    "{} cannot be its own placeholder",
                    self.get(id)?.name()
                )));
            }
            self.get(p)?;
        }
        self.get_mut(id)?.set_placeholder(placeholder);
        Ok(())
    }

    /// Look up a resource by name
    pub fn resolve(&self, name: &str) -> Result<ResourceId, LoadError> {
        self.names
            .get(name)
            .copied()
            .ok_or_else(|| LoadError::UnknownResource(name.to_string()))
    }

    pub fn resource(&self, id: ResourceId) -> Option<&ImageResource> {
        self.resources.get(id.index())
    }

    pub fn resources(&self) -> impl Iterator<Item = &ImageResource> {
        self.resources.iter()
    }

    pub fn status(&self, id: ResourceId) -> Option<LoadStatus> {
        self.resource(id).map(ImageResource::status)
    }

    pub fn progress(&self, id: ResourceId) -> Option<LoadProgress> {
        self.controller.progress(id)
    }

    /// Whether any load is in flight
    pub fn is_busy(&self) -> bool {
        self.controller.active_jobs() > 0
    }

    pub fn canvas(&self) -> &C {
        &self.canvas
    }

    pub fn canvas_mut(&mut self) -> &mut C {
        &mut self.canvas
    }

    pub fn on_load_finished(&mut self, id: ResourceId, listener: FinishedListener) {
        self.dispatcher.on_load_finished(id, listener);
    }

    pub fn on_error(&mut self, id: ResourceId, listener: ErrorListener) {
        self.dispatcher.on_error(id, listener);
    }

    /// Handle for queueing actions from listeners or other tasks
    pub fn action_sender(&self) -> ActionSender {
        self.action_tx.clone()
    }

    /// Update the path used by the next load; never starts one
    pub fn set_path(&mut self, id: ResourceId, path: &str) -> Result<(), LoadError> {
        let resource = self.get_mut(id)?;
        tracing::debug!("{}: path set to {}", resource.name(), path);
        resource.set_path(path);
        Ok(())
    }

    /// Start a load unless one is already running. Returns the status after
    /// the call.
    pub fn load(&mut self, id: ResourceId) -> Result<LoadStatus, LoadError> {
        let status = self.get(id)?.status();
        if status == LoadStatus::Loading {
            return Ok(status);
        }
        self.start(id, None)?;
        Ok(LoadStatus::Loading)
    }

    /// Always start a new load generation, optionally from a new path
    pub fn reload(&mut self, id: ResourceId, path: Option<&str>) -> Result<Generation, LoadError> {
        self.start(id, path)
    }

    /// Stop any load, drop the pixels and mark the resource released
    pub fn release(&mut self, id: ResourceId) -> Result<(), LoadError> {
        self.get(id)?;
        self.controller.cancel(id);
        let resource = self.get_mut(id)?;
        if resource.status() != LoadStatus::Released {
            tracing::info!("Released {}", resource.name());
        }
        resource.release();
        Ok(())
    }

    /// Stop an in-flight load without notifying listeners; the resource
    /// goes back to `Idle`
    pub fn cancel(&mut self, id: ResourceId) -> Result<(), LoadError> {
        self.get(id)?;
        if self.controller.cancel(id) {
            self.get_mut(id)?.cancel();
        }
        Ok(())
    }

    /// Apply an action addressed by name
    pub fn apply(&mut self, action: ImageAction) -> Result<(), LoadError> {
        let id = self.resolve(action.target())?;
        match action {
            ImageAction::Load { .. } => self.load(id).map(|_| ()),
            ImageAction::Reload { path, .. } => self.reload(id, path.as_deref()).map(|_| ()),
            ImageAction::Release { .. } => self.release(id),
            ImageAction::SetPath { path, .. } => self.set_path(id, &path),
        }
    }

    fn start(&mut self, id: ResourceId, path: Option<&str>) -> Result<Generation, LoadError> {
        let resource = lookup(&self.resources, id)?;
        let path = path.map_or_else(|| resource.path().to_string(), str::to_string);

        let request = self.controller.start(resource, &path)?;

        let resource = self.get_mut(id)?;
        resource.set_path(&path);
        resource.begin_load(request.generation);

        self.show_placeholder(id);
        Ok(request.generation)
    }

    /// Draw the placeholder of `id` at its position, if it has one with
    /// pixels to show
    fn show_placeholder(&mut self, id: ResourceId) {
        let Ok(resource) = lookup(&self.resources, id) else {
            return;
        };
        let Some(shown) = resource
            .placeholder()
            .and_then(|p| visible(&self.resources, p, 0))
        else {
            return;
        };

        if let Some(pixels) = shown.pixels() {
            tracing::debug!("{}: showing placeholder {}", resource.name(), shown.name());
            let (x, y) = resource.position();
            draw_image(&mut self.canvas, x, y, pixels, shown.transparency());
        }
    }

    /// Pixels currently shown for `id`: its own, or its placeholder's while
    /// it is not loaded. `None` once an in-flight load has drawn rows.
    pub fn visible_pixels(&self, id: ResourceId) -> Option<&RgbaImage> {
        visible(&self.resources, id, 0).and_then(ImageResource::pixels)
    }

    /// Draw `id` (or its placeholder) onto the canvas at its position.
    /// Returns whether anything was drawn.
    pub fn draw(&mut self, id: ResourceId) -> Result<bool, LoadError> {
        let (x, y) = lookup(&self.resources, id)?.position();
        let Some(shown) = visible(&self.resources, id, 0) else {
            return Ok(false);
        };
        let Some(pixels) = shown.pixels() else {
            return Ok(false);
        };
        draw_image(&mut self.canvas, x, y, pixels, shown.transparency());
        Ok(true)
    }

    /// Draw every resource that has something to show, in registration order
    pub fn draw_all(&mut self) -> usize {
        let mut drawn = 0;
        for index in 0..self.resources.len() {
            if let Ok(true) = self.draw(ResourceId(index as u32)) {
                drawn += 1;
            }
        }
        drawn
    }

    /// Advance all loads by one bounded unit of work, commit terminal
    /// results, run listeners and apply queued actions. Returns the number
    /// of loads that ended.
    pub fn step(&mut self) -> usize {
        let outcomes = self.controller.step(&mut self.canvas);
        let count = outcomes.len();

        for resource in &mut self.resources {
            let drew = self
                .controller
                .progress(resource.id())
                .is_some_and(|p| p.rows_emitted > 0);
            if drew {
                resource.mark_rows_drawn();
            }
        }

        for outcome in outcomes {
            self.complete(outcome);
        }

        self.drain_actions();
        count
    }

    fn complete(&mut self, outcome: LoadOutcome) {
        let request = outcome.request().clone();
        let Some(resource) = self.resources.get_mut(request.resource.index()) else {
            return;
        };
        if resource.generation() != request.generation || resource.status() != LoadStatus::Loading {
            tracing::debug!(
                "{}: discarding stale result of {}",
                resource.name(),
                request.generation
            );
            return;
        }

        match outcome {
            LoadOutcome::Finished { pixels, .. } => {
                tracing::info!(
                    "Loaded {} ({}x{}) from {}",
                    resource.name(),
                    pixels.width(),
                    pixels.height(),
                    request.path
                );
                resource.commit(pixels);
                self.dispatcher.dispatch_finished(request.resource);
            }
            LoadOutcome::Failed { error, .. } => {
                // Jobs only end with load errors; anything else is a decode fault
                let code = error.code().unwrap_or(ErrorCode::DecodeError);
                tracing::warn!(
                    "Failed to load {} from {}: {} (code {})",
                    resource.name(),
                    request.path,
                    error,
                    code.as_u8()
                );
                resource.fail(code);
                self.dispatcher.dispatch_error(request.resource, code.as_u8());
            }
        }
    }

    fn drain_actions(&mut self) {
        while let Ok(action) = self.action_rx.try_recv() {
            tracing::debug!("Applying queued action {:?}", action);
            if let Err(e) = self.apply(action) {
                tracing::warn!("Queued action failed: {}", e);
            }
        }
    }

    fn get(&self, id: ResourceId) -> Result<&ImageResource, LoadError> {
        lookup(&self.resources, id)
    }

    fn get_mut(&mut self, id: ResourceId) -> Result<&mut ImageResource, LoadError> {
        self.resources
            .get_mut(id.index())
            .ok_or_else(|| LoadError::UnknownResource(id.to_string()))
    }
}

fn lookup(resources: &[ImageResource], id: ResourceId) -> Result<&ImageResource, LoadError> {
    resources
        .get(id.index())
        .ok_or_else(|| LoadError::UnknownResource(id.to_string()))
}

/// The resource whose pixels stand in for `id`: itself when loaded,
/// otherwise the first loaded one along its placeholder chain. A load that
/// has drawn rows is never covered by its placeholder again.
fn visible(resources: &[ImageResource], id: ResourceId, depth: usize) -> Option<&ImageResource> {
    if depth > MAX_PLACEHOLDER_DEPTH {
        return None;
    }
    let resource = resources.get(id.index())?;
    if resource.pixels().is_some() {
        return Some(resource);
    }
    if resource.rows_drawn() {
        return None;
    }
    visible(resources, resource.placeholder()?, depth + 1)
}
