//! Step scheduler for in-flight loads.
//!
//! Calls [`ImageManager::step`] on a fixed tick so every load advances by
//! one bounded chunk at a time, and triggers periodic reloads for images
//! that have an update interval.

use crate::canvas::Canvas;
use crate::manager::{ImageAction, ImageManager};
use crate::resource::LoadStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::time::{Instant, MissedTickBehavior};

/// Drives an [`ImageManager`] from an async task
pub struct Scheduler<C: Canvas> {
    manager: Arc<Mutex<ImageManager<C>>>,
    tick: Duration,
    periodic: Vec<(String, Duration)>,
}

impl<C: Canvas> Scheduler<C> {
    /// Create a new scheduler stepping every `tick`
    pub fn new(manager: Arc<Mutex<ImageManager<C>>>, tick: Duration) -> Self {
        Self {
            manager,
            tick,
            periodic: Vec::new(),
        }
    }

    /// Reload each named image every given interval
    pub fn with_periodic_reloads(mut self, reloads: Vec<(String, Duration)>) -> Self {
        self.periodic = reloads;
        self
    }

    fn ticker(&self) -> tokio::time::Interval {
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }

    /// Run the scheduler loop until shutdown
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!("Scheduler started (tick {:?})", self.tick);

        let mut ticker = self.ticker();
        let start = Instant::now();
        let mut next_reload: Vec<Instant> = self
            .periodic
            .iter()
            .map(|(_, every)| start + *every)
            .collect();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick_once(&mut next_reload).await;
                }
                _ = shutdown.recv() => {
                    tracing::info!("Scheduler shutting down");
                    break;
                }
            }
        }
    }

    /// Step until no load is in flight. Returns `false` if shutdown came
    /// first.
    pub async fn run_until_idle(&self, mut shutdown: broadcast::Receiver<()>) -> bool {
        let mut ticker = self.ticker();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let mut manager = self.manager.lock().await;
                    if !manager.is_busy() {
                        return true;
                    }
                    manager.step();
                }
                _ = shutdown.recv() => {
                    tracing::info!("Shutdown before loads settled");
                    return false;
                }
            }
        }
    }

    async fn tick_once(&self, next_reload: &mut [Instant]) {
        let now = Instant::now();
        let mut manager = self.manager.lock().await;

        for ((name, every), next) in self.periodic.iter().zip(next_reload.iter_mut()) {
            if now < *next {
                continue;
            }
            *next = now + *every;

            let loading = manager
                .resolve(name)
                .ok()
                .and_then(|id| manager.status(id))
                == Some(LoadStatus::Loading);
            if loading {
                tracing::debug!("{} still loading, skipping periodic reload", name);
                continue;
            }

            tracing::debug!("Periodic reload of {}", name);
            let action = ImageAction::Reload {
                id: name.clone(),
                path: None,
            };
            if let Err(e) = manager.apply(action) {
                tracing::warn!("Periodic reload of {} failed: {}", name, e);
            }
        }

        manager.step();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canvas::FrameBuffer;
    use crate::controller::LoaderSettings;
    use crate::decoder::bmp::fixtures::solid_bmp;
    use crate::decoder::ImageFormat;
    use crate::resource::{ImageOptions, ResourceId};
    use crate::storage::{FileProvider, MemoryProvider};
    use crate::transform::{ImageType, Transparency};
    use image::Rgba;

    fn shared_manager(storage: &Arc<MemoryProvider>) -> (Arc<Mutex<ImageManager<FrameBuffer>>>, ResourceId) {
        let mut manager = ImageManager::new(
            FrameBuffer::new(8, 8, Rgba([0, 0, 0, 255])),
            LoaderSettings {
                chunk_size: 16,
                ..Default::default()
            },
        );
        let id = manager
            .add_resource(
                "img",
                ImageOptions {
                    path: "/img.bmp".to_string(),
                    format: ImageFormat::Bmp,
                    resize: None,
                    image_type: ImageType::Rgb,
                    transparency: Transparency::Opaque,
                    position: (0, 0),
                    storage_name: "mem".to_string(),
                    storage: Arc::clone(storage) as Arc<dyn FileProvider>,
                },
            )
            .unwrap();
        (Arc::new(Mutex::new(manager)), id)
    }

    #[tokio::test]
    async fn test_run_until_idle_finishes_load() {
        let storage = Arc::new(MemoryProvider::new());
        storage.insert("/img.bmp", solid_bmp(4, 4, [0, 255, 0]));
        let (manager, id) = shared_manager(&storage);
        manager.lock().await.load(id).unwrap();

        let (_tx, rx) = broadcast::channel(1);
        let scheduler = Scheduler::new(Arc::clone(&manager), Duration::from_millis(1));
        let settled = tokio::time::timeout(Duration::from_secs(5), scheduler.run_until_idle(rx))
            .await
            .unwrap();

        assert!(settled);
        assert_eq!(manager.lock().await.status(id), Some(LoadStatus::Loaded));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let storage = Arc::new(MemoryProvider::new());
        storage.insert_stalled("/img.bmp");
        let (manager, id) = shared_manager(&storage);
        manager.lock().await.load(id).unwrap();

        let (tx, rx) = broadcast::channel(1);
        let scheduler = Scheduler::new(Arc::clone(&manager), Duration::from_millis(1));
        let handle = tokio::spawn(async move { scheduler.run(rx).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();

        let manager = manager.lock().await;
        assert_eq!(manager.status(id), Some(LoadStatus::Loading));
        assert!(manager.progress(id).unwrap().steps > 0);
    }

    #[tokio::test]
    async fn test_periodic_reload_starts_new_generations() {
        let storage = Arc::new(MemoryProvider::new());
        storage.insert("/img.bmp", solid_bmp(2, 2, [9, 9, 9]));
        let (manager, id) = shared_manager(&storage);

        let (tx, rx) = broadcast::channel(1);
        let scheduler = Scheduler::new(Arc::clone(&manager), Duration::from_millis(1))
            .with_periodic_reloads(vec![("img".to_string(), Duration::from_millis(10))]);
        let handle = tokio::spawn(async move { scheduler.run(rx).await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();

        let manager = manager.lock().await;
        let resource = manager.resource(id).unwrap();
        assert!(resource.generation() > crate::resource::Generation(1));
    }
}
