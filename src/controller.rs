//! Load controller.
//!
//! Owns the in-flight load jobs, at most one per resource. Each job holds
//! the open file, the format decoder, a progress cursor and the staging
//! buffer the transformed rows are written into. Jobs advance only through
//! [`LoadController::step`], which does one bounded unit of work per job:
//!
//! 1. Read up to `chunk_size` bytes (or continue draining the decoder when
//!    the previous step stopped at the row limit).
//! 2. Feed the decoder and drain its events until it wants more input, is
//!    done, fails, or `rows_per_step` rows were produced.
//! 3. Forward each row through the row transform into the staging buffer
//!    and onto the canvas.
//!
//! Finished and failed jobs are removed and reported as [`LoadOutcome`]s.
//! Dropping a job closes its file and frees its decoder.

use crate::canvas::Canvas;
use crate::decoder::{self, DecodeErrorKind, DecodeEvent, Decoder, ImageFormat, ImageInfo};
use crate::resource::{Generation, ImageResource, ResourceId};
use crate::storage::{FileReader, ReadResult, StorageError};
use crate::transform::{ImageType, RowTransform, Transparency};
use image::{Rgba, RgbaImage};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Stable numeric error codes passed to error listeners
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorCode {
    OutOfMemory = 1,
    NotFound = 2,
    TruncatedFile = 3,
    UnsupportedFormat = 4,
    MalformedHeader = 5,
    DecodeError = 6,
    IoError = 7,
    Timeout = 8,
}

impl ErrorCode {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(code: u8) -> Option<Self> {
        Some(match code {
            1 => ErrorCode::OutOfMemory,
            2 => ErrorCode::NotFound,
            3 => ErrorCode::TruncatedFile,
            4 => ErrorCode::UnsupportedFormat,
            5 => ErrorCode::MalformedHeader,
            6 => ErrorCode::DecodeError,
            7 => ErrorCode::IoError,
            8 => ErrorCode::Timeout,
            _ => return None,
        })
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({})", self, self.as_u8())
    }
}

impl From<ErrorCode> for u8 {
    fn from(code: ErrorCode) -> Self {
        code.as_u8()
    }
}

/// Load errors
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("Image path is empty")]
    InvalidPath,

    #[error("Unknown image resource: {0}")]
    UnknownResource(String),

    #[error("Image resource already exists: {0}")]
    DuplicateResource(String),

    #[error("No decoder available for format {0}")]
    UnsupportedFormat(ImageFormat),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Malformed image header")]
    MalformedHeader,

    #[error("File ended before the image was complete")]
    TruncatedFile,

    #[error("Image data could not be decoded")]
    Decode,

    #[error("Not enough memory for a {0}x{1} image")]
    OutOfMemory(u32, u32),

    #[error("Load did not finish within {0} steps")]
    Timeout(u32),
}

impl LoadError {
    /// Code reported to error listeners. `None` for errors that are only
    /// returned by the manager's API and never end a load.
    pub fn code(&self) -> Option<ErrorCode> {
        let code = match self {
            LoadError::OutOfMemory(..) => ErrorCode::OutOfMemory,
            LoadError::Storage(StorageError::NotFound(_)) => ErrorCode::NotFound,
            LoadError::Storage(StorageError::Io(_)) => ErrorCode::IoError,
            LoadError::TruncatedFile => ErrorCode::TruncatedFile,
            LoadError::UnsupportedFormat(_) => ErrorCode::UnsupportedFormat,
            LoadError::MalformedHeader => ErrorCode::MalformedHeader,
            LoadError::Decode => ErrorCode::DecodeError,
            LoadError::Timeout(_) => ErrorCode::Timeout,
            LoadError::InvalidPath
            | LoadError::UnknownResource(_)
            | LoadError::DuplicateResource(_) => return None,
        };
        Some(code)
    }
}

impl From<DecodeErrorKind> for LoadError {
    fn from(kind: DecodeErrorKind) -> Self {
        match kind {
            DecodeErrorKind::MalformedHeader => LoadError::MalformedHeader,
            DecodeErrorKind::Corrupt => LoadError::Decode,
        }
    }
}

/// Work limits applied to every job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoaderSettings {
    /// Bytes read from storage per step
    pub chunk_size: usize,
    /// Rows forwarded per step before the rest is deferred
    pub rows_per_step: usize,
    /// Fail with `Timeout` after this many steps
    pub max_steps: Option<u32>,
    /// Largest target image accepted, in pixels
    pub max_pixels: u64,
}

impl Default for LoaderSettings {
    fn default() -> Self {
        Self {
            chunk_size: 4096,
            rows_per_step: 64,
            max_steps: None,
            max_pixels: 4096 * 4096,
        }
    }
}

/// One load attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadRequest {
    pub resource: ResourceId,
    pub path: String,
    pub generation: Generation,
}

/// Progress of an in-flight load
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadProgress {
    pub bytes_read: u64,
    /// File size if the provider reported it
    pub total_bytes: Option<u64>,
    pub rows_emitted: u32,
    /// Source height once the header is known
    pub total_rows: Option<u32>,
    pub steps: u32,
}

/// Terminal result of a job
#[derive(Debug)]
pub enum LoadOutcome {
    Finished {
        request: LoadRequest,
        pixels: RgbaImage,
    },
    Failed {
        request: LoadRequest,
        error: LoadError,
    },
}

impl LoadOutcome {
    pub fn request(&self) -> &LoadRequest {
        match self {
            LoadOutcome::Finished { request, .. } | LoadOutcome::Failed { request, .. } => request,
        }
    }
}

/// Render options copied from the resource when the job starts
#[derive(Debug, Clone, Copy)]
struct RenderOptions {
    resize: Option<(u32, u32)>,
    image_type: ImageType,
    transparency: Transparency,
    position: (i32, i32),
}

struct Pipeline {
    reader: Box<dyn FileReader>,
    decoder: Box<dyn Decoder>,
    render: RenderOptions,
    transform: Option<RowTransform>,
    staging: Option<RgbaImage>,
    /// The previous step stopped at the row limit
    draining: bool,
    eof: bool,
}

enum JobState {
    Running(Box<Pipeline>),
    /// Failed while starting; reported on the next step
    Doomed(LoadError),
}

struct LoadJob {
    request: LoadRequest,
    progress: LoadProgress,
    state: JobState,
}

/// Drives in-flight loads
pub struct LoadController {
    settings: LoaderSettings,
    jobs: BTreeMap<ResourceId, LoadJob>,
    next_generation: u64,
}

impl LoadController {
    pub fn new(settings: LoaderSettings) -> Self {
        Self {
            settings,
            jobs: BTreeMap::new(),
            next_generation: 0,
        }
    }

    pub fn settings(&self) -> &LoaderSettings {
        &self.settings
    }

    /// Start loading `path` into `resource`, superseding any job it already
    /// has. Only an empty path is rejected here; open and format failures
    /// surface as a failed outcome of the returned request on the next step.
    pub fn start(&mut self, resource: &ImageResource, path: &str) -> Result<LoadRequest, LoadError> {
        if path.trim().is_empty() {
            return Err(LoadError::InvalidPath);
        }

        self.next_generation += 1;
        let request = LoadRequest {
            resource: resource.id(),
            path: path.to_string(),
            generation: Generation(self.next_generation),
        };

        if let Some(old) = self.jobs.remove(&resource.id()) {
            tracing::debug!(
                "Superseding {} of {} ({})",
                old.request.generation,
                resource.name(),
                old.request.path
            );
        }

        let mut progress = LoadProgress::default();
        let state = match Self::open(resource, path) {
            Ok((reader, decoder)) => {
                progress.total_bytes = reader.size_hint();
                JobState::Running(Box::new(Pipeline {
                    reader,
                    decoder,
                    render: RenderOptions {
                        resize: resource.resize(),
                        image_type: resource.image_type(),
                        transparency: resource.transparency(),
                        position: resource.position(),
                    },
                    transform: None,
                    staging: None,
                    draining: false,
                    eof: false,
                }))
            }
            Err(e) => JobState::Doomed(e),
        };

        tracing::info!(
            "Loading {} from {}:{} ({})",
            resource.name(),
            resource.storage_name(),
            path,
            request.generation
        );

        self.jobs.insert(
            resource.id(),
            LoadJob {
                request: request.clone(),
                progress,
                state,
            },
        );
        Ok(request)
    }

    fn open(
        resource: &ImageResource,
        path: &str,
    ) -> Result<(Box<dyn FileReader>, Box<dyn Decoder>), LoadError> {
        let format = resource.format();
        let decoder = decoder::create_decoder(format).ok_or(LoadError::UnsupportedFormat(format))?;
        let reader = resource.storage().open(path)?;
        Ok((reader, decoder))
    }

    /// Drop the job of `id` without reporting anything. Returns whether a
    /// job was running.
    pub fn cancel(&mut self, id: ResourceId) -> bool {
        match self.jobs.remove(&id) {
            Some(job) => {
                tracing::debug!("Cancelled {} ({})", job.request.path, job.request.generation);
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self, id: ResourceId) -> bool {
        self.jobs.contains_key(&id)
    }

    /// Number of jobs in flight
    pub fn active_jobs(&self) -> usize {
        self.jobs.len()
    }

    pub fn progress(&self, id: ResourceId) -> Option<LoadProgress> {
        self.jobs.get(&id).map(|job| job.progress)
    }

    /// Advance every job by one bounded unit of work
    pub fn step(&mut self, canvas: &mut dyn Canvas) -> Vec<LoadOutcome> {
        let settings = self.settings;
        let mut done = Vec::new();

        for (id, job) in self.jobs.iter_mut() {
            if let Some(result) = job.advance(&settings, canvas) {
                done.push((*id, result));
            }
        }

        done.into_iter()
            .filter_map(|(id, result)| {
                let job = self.jobs.remove(&id)?;
                Some(match result {
                    Ok(pixels) => LoadOutcome::Finished {
                        request: job.request,
                        pixels,
                    },
                    Err(error) => LoadOutcome::Failed {
                        request: job.request,
                        error,
                    },
                })
            })
            .collect()
    }
}

impl LoadJob {
    /// One step; `Some` once the job has finished or failed
    fn advance(
        &mut self,
        settings: &LoaderSettings,
        canvas: &mut dyn Canvas,
    ) -> Option<Result<RgbaImage, LoadError>> {
        self.progress.steps += 1;

        if matches!(self.state, JobState::Doomed(_)) {
            let state = std::mem::replace(&mut self.state, JobState::Doomed(LoadError::Decode));
            if let JobState::Doomed(e) = state {
                return Some(Err(e));
            }
        }
        let JobState::Running(pipeline) = &mut self.state else {
            return None;
        };

        if let Some(max) = settings.max_steps {
            if self.progress.steps > max {
                return Some(Err(LoadError::Timeout(max)));
            }
        }

        let mut event = if pipeline.draining {
            pipeline.draining = false;
            pipeline.decoder.feed(&[])
        } else {
            match pipeline.reader.read(settings.chunk_size) {
                Ok(ReadResult::Data(bytes)) => {
                    self.progress.bytes_read += bytes.len() as u64;
                    tracing::debug!(
                        "{}: read {} bytes ({} total)",
                        self.request.path,
                        bytes.len(),
                        self.progress.bytes_read
                    );
                    pipeline.decoder.feed(&bytes)
                }
                Ok(ReadResult::Pending) => return None,
                Ok(ReadResult::Eof) => {
                    pipeline.eof = true;
                    pipeline.decoder.feed(&[])
                }
                Err(e) => return Some(Err(e.into())),
            }
        };

        let mut rows = 0;
        loop {
            match event {
                DecodeEvent::NeedMoreInput => {
                    if pipeline.eof {
                        return Some(Err(LoadError::TruncatedFile));
                    }
                    return None;
                }
                DecodeEvent::Header(info) => {
                    if let Err(e) = pipeline.on_header(info, settings) {
                        return Some(Err(e));
                    }
                    self.progress.total_rows = Some(info.height);
                }
                DecodeEvent::Row(y, row) => {
                    if let Err(e) = pipeline.on_row(y, &row, canvas) {
                        return Some(Err(e));
                    }
                    self.progress.rows_emitted += 1;
                    rows += 1;
                    if rows >= settings.rows_per_step {
                        pipeline.draining = true;
                        return None;
                    }
                }
                DecodeEvent::Done => {
                    return Some(pipeline.staging.take().ok_or(LoadError::Decode));
                }
                DecodeEvent::Error(kind) => return Some(Err(kind.into())),
            }
            event = pipeline.decoder.feed(&[]);
        }
    }
}

impl Pipeline {
    fn on_header(&mut self, info: ImageInfo, settings: &LoaderSettings) -> Result<(), LoadError> {
        if self.transform.is_some() {
            return Err(LoadError::Decode);
        }

        let transform = RowTransform::new(
            info,
            self.render.resize,
            self.render.image_type,
            self.render.transparency,
        );
        let (width, height) = transform.output_size();
        if width as u64 * height as u64 > settings.max_pixels {
            return Err(LoadError::OutOfMemory(width, height));
        }

        let len = width as usize * height as usize * 4;
        let mut buf: Vec<u8> = Vec::new();
        buf.try_reserve_exact(len)
            .map_err(|_| LoadError::OutOfMemory(width, height))?;
        buf.resize(len, 0);
        let staging =
            RgbaImage::from_raw(width, height, buf).ok_or(LoadError::OutOfMemory(width, height))?;

        tracing::debug!(
            "Source {}x{}, target {}x{}",
            info.width,
            info.height,
            width,
            height
        );
        self.staging = Some(staging);
        self.transform = Some(transform);
        Ok(())
    }

    fn on_row(&mut self, y: u32, row: &[Rgba<u8>], canvas: &mut dyn Canvas) -> Result<(), LoadError> {
        let (Some(transform), Some(staging)) = (&self.transform, &mut self.staging) else {
            return Err(LoadError::Decode);
        };

        let targets = transform.target_rows(y);
        if targets.is_empty() {
            return Ok(());
        }

        let out = transform.apply(row);
        let (x0, y0) = self.render.position;
        for ty in targets {
            for (x, px) in out.iter().enumerate() {
                staging.put_pixel(x as u32, ty, *px);
            }
            canvas.blit(x0, y0 + ty as i32, &out, self.render.transparency);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canvas::FrameBuffer;
    use crate::decoder::bmp::fixtures::solid_bmp;
    use crate::resource::ImageOptions;
    use crate::storage::{FileProvider, MemoryProvider};
    use std::sync::Arc;

    const RED: [u8; 3] = [255, 0, 0];

    fn resource(storage: Arc<MemoryProvider>, resize: Option<(u32, u32)>) -> ImageResource {
        ImageResource::new(
            ResourceId(0),
            "test",
            ImageOptions {
                path: "/img.bmp".to_string(),
                format: ImageFormat::Bmp,
                resize,
                image_type: ImageType::Rgb,
                transparency: Transparency::Opaque,
                position: (0, 0),
                storage_name: "mem".to_string(),
                storage: storage as Arc<dyn FileProvider>,
            },
        )
    }

    fn run(controller: &mut LoadController, canvas: &mut FrameBuffer, limit: usize) -> Vec<LoadOutcome> {
        for _ in 0..limit {
            let outcomes = controller.step(canvas);
            if !outcomes.is_empty() {
                return outcomes;
            }
        }
        Vec::new()
    }

    #[test]
    fn test_loads_solid_bmp_in_chunks() {
        let storage = Arc::new(MemoryProvider::new());
        storage.insert("/img.bmp", solid_bmp(5, 4, RED));
        let res = resource(Arc::clone(&storage), None);

        let mut controller = LoadController::new(LoaderSettings {
            chunk_size: 16,
            rows_per_step: 1,
            ..Default::default()
        });
        let mut canvas = FrameBuffer::new(8, 8, Rgba([0, 0, 0, 255]));
        let request = controller.start(&res, "/img.bmp").unwrap();

        let outcomes = run(&mut controller, &mut canvas, 100);
        assert_eq!(outcomes.len(), 1);
        match &outcomes[0] {
            LoadOutcome::Finished { request: r, pixels } => {
                assert_eq!(r, &request);
                assert_eq!(pixels.dimensions(), (5, 4));
                assert!(pixels.pixels().all(|p| *p == Rgba([255, 0, 0, 255])));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(canvas.pixel(4, 3), Some(Rgba([255, 0, 0, 255])));
        assert_eq!(canvas.pixel(5, 3), Some(Rgba([0, 0, 0, 255])));
        assert!(!controller.is_active(res.id()));
    }

    #[test]
    fn test_empty_path_is_rejected() {
        let res = resource(Arc::new(MemoryProvider::new()), None);
        let mut controller = LoadController::new(LoaderSettings::default());
        assert!(matches!(controller.start(&res, "  "), Err(LoadError::InvalidPath)));
        assert_eq!(controller.active_jobs(), 0);
    }

    #[test]
    fn test_missing_file_fails_on_next_step() {
        let res = resource(Arc::new(MemoryProvider::new()), None);
        let mut controller = LoadController::new(LoaderSettings::default());
        let mut canvas = FrameBuffer::new(1, 1, Rgba([0, 0, 0, 255]));
        controller.start(&res, "/missing.bmp").unwrap();

        let outcomes = controller.step(&mut canvas);
        match &outcomes[..] {
            [LoadOutcome::Failed { error, .. }] => assert_eq!(error.code(), Some(ErrorCode::NotFound)),
            other => panic!("unexpected outcomes {:?}", other),
        }
    }

    #[test]
    fn test_truncated_file() {
        let storage = Arc::new(MemoryProvider::new());
        let data = solid_bmp(4, 4, RED);
        // header (54) + two full rows (12 each) + half a row
        storage.insert("/img.bmp", data[..54 + 12 * 2 + 6].to_vec());
        let res = resource(Arc::clone(&storage), None);

        let mut controller = LoadController::new(LoaderSettings::default());
        let mut canvas = FrameBuffer::new(4, 4, Rgba([0, 0, 0, 255]));
        controller.start(&res, "/img.bmp").unwrap();

        let outcomes = run(&mut controller, &mut canvas, 10);
        match &outcomes[..] {
            [LoadOutcome::Failed { error, .. }] => {
                assert_eq!(error.code(), Some(ErrorCode::TruncatedFile))
            }
            other => panic!("unexpected outcomes {:?}", other),
        }
    }

    #[test]
    fn test_stalled_reader_times_out() {
        let storage = Arc::new(MemoryProvider::new());
        storage.insert_stalled("/img.bmp");
        let res = resource(Arc::clone(&storage), None);

        let mut controller = LoadController::new(LoaderSettings {
            max_steps: Some(3),
            ..Default::default()
        });
        let mut canvas = FrameBuffer::new(1, 1, Rgba([0, 0, 0, 255]));
        controller.start(&res, "/img.bmp").unwrap();

        for _ in 0..3 {
            assert!(controller.step(&mut canvas).is_empty());
        }
        let outcomes = controller.step(&mut canvas);
        assert!(matches!(
            &outcomes[..],
            [LoadOutcome::Failed { error: LoadError::Timeout(3), .. }]
        ));
    }

    #[test]
    fn test_oversized_target_is_out_of_memory() {
        let storage = Arc::new(MemoryProvider::new());
        storage.insert("/img.bmp", solid_bmp(2, 2, RED));
        let res = resource(Arc::clone(&storage), Some((1000, 1000)));

        let mut controller = LoadController::new(LoaderSettings {
            max_pixels: 10_000,
            ..Default::default()
        });
        let mut canvas = FrameBuffer::new(1, 1, Rgba([0, 0, 0, 255]));
        controller.start(&res, "/img.bmp").unwrap();

        let outcomes = run(&mut controller, &mut canvas, 5);
        match &outcomes[..] {
            [LoadOutcome::Failed { error, .. }] => assert_eq!(error.code(), Some(ErrorCode::OutOfMemory)),
            other => panic!("unexpected outcomes {:?}", other),
        }
    }

    #[test]
    fn test_restart_supersedes_previous_job() {
        let storage = Arc::new(MemoryProvider::new());
        storage.insert("/img.bmp", solid_bmp(2, 2, RED));
        let res = resource(Arc::clone(&storage), None);

        let mut controller = LoadController::new(LoaderSettings::default());
        let mut canvas = FrameBuffer::new(2, 2, Rgba([0, 0, 0, 255]));
        let first = controller.start(&res, "/img.bmp").unwrap();
        let second = controller.start(&res, "/img.bmp").unwrap();
        assert!(second.generation > first.generation);
        assert_eq!(controller.active_jobs(), 1);

        let outcomes = run(&mut controller, &mut canvas, 10);
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].request().generation, second.generation);
    }

    #[test]
    fn test_cancel_drops_job_silently() {
        let storage = Arc::new(MemoryProvider::new());
        storage.insert("/img.bmp", solid_bmp(2, 2, RED));
        let res = resource(Arc::clone(&storage), None);

        let mut controller = LoadController::new(LoaderSettings::default());
        let mut canvas = FrameBuffer::new(2, 2, Rgba([0, 0, 0, 255]));
        controller.start(&res, "/img.bmp").unwrap();
        assert!(controller.cancel(res.id()));
        assert!(!controller.cancel(res.id()));
        assert!(controller.step(&mut canvas).is_empty());
    }

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(LoadError::OutOfMemory(1, 1).code().map(ErrorCode::as_u8), Some(1));
        assert_eq!(LoadError::Storage(StorageError::NotFound("x".into())).code().map(ErrorCode::as_u8), Some(2));
        assert_eq!(LoadError::TruncatedFile.code().map(ErrorCode::as_u8), Some(3));
        assert_eq!(LoadError::UnsupportedFormat(ImageFormat::Png).code().map(ErrorCode::as_u8), Some(4));
        assert_eq!(LoadError::MalformedHeader.code().map(ErrorCode::as_u8), Some(5));
        assert_eq!(LoadError::Decode.code().map(ErrorCode::as_u8), Some(6));
        assert_eq!(LoadError::Timeout(1).code().map(ErrorCode::as_u8), Some(8));
        assert_eq!(ErrorCode::from_u8(7), Some(ErrorCode::IoError));
        assert_eq!(ErrorCode::from_u8(0), None);
    }

    #[test]
    fn test_api_errors_have_no_listener_code() {
        assert_eq!(LoadError::InvalidPath.code(), None);
        assert_eq!(LoadError::UnknownResource("x".into()).code(), None);
        assert_eq!(LoadError::DuplicateResource("x".into()).code(), None);
        let io = StorageError::Io(std::io::Error::other("read failed"));
        assert_eq!(LoadError::Storage(io).code(), Some(ErrorCode::IoError));
    }
}
