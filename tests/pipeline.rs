//! End-to-end loads from a directory through the public API.

use image::{Rgba, RgbaImage};
use local_image::config::Config;
use local_image::{ErrorCode, FrameBuffer, ImageManager, LoadStatus};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// 24-bit bottom-up BMP from a pixel function over top-to-bottom rows
fn write_bmp(path: &Path, width: u32, height: u32, pixel: impl Fn(u32, u32) -> [u8; 3]) {
    let row_size = ((24 * width as usize + 31) / 32) * 4;
    let data_offset = 54usize;
    let file_size = data_offset + row_size * height as usize;

    let mut out = Vec::with_capacity(file_size);
    out.extend_from_slice(b"BM");
    out.extend_from_slice(&(file_size as u32).to_le_bytes());
    out.extend_from_slice(&[0; 4]);
    out.extend_from_slice(&(data_offset as u32).to_le_bytes());
    out.extend_from_slice(&40u32.to_le_bytes());
    out.extend_from_slice(&(width as i32).to_le_bytes());
    out.extend_from_slice(&(height as i32).to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&24u16.to_le_bytes());
    out.extend_from_slice(&[0; 24]);

    for y in (0..height).rev() {
        let start = out.len();
        for x in 0..width {
            let [r, g, b] = pixel(x, y);
            out.extend_from_slice(&[b, g, r]);
        }
        out.resize(start + row_size, 0);
    }
    std::fs::write(path, out).unwrap();
}

fn settle(manager: &mut ImageManager<FrameBuffer>) {
    for _ in 0..10_000 {
        if !manager.is_busy() {
            return;
        }
        manager.step();
    }
    panic!("loads did not settle");
}

fn config(root: &Path, images: &str) -> Config {
    let json = format!(
        r#"{{
            "storage": [{{"id": "sd", "root": {root}}}],
            "images": [{images}],
            "loader": {{"chunk_size": 100, "rows_per_step": 7}},
            "canvas": {{"width": 64, "height": 64, "background": [255, 255, 255]}}
        }}"#,
        root = serde_json::to_string(root).unwrap(),
        images = images
    );
    Config::from_json(&json).unwrap()
}

#[test]
fn test_resize_100_to_50_matches_reference() {
    let dir = tempfile::tempdir().unwrap();
    let source = |x: u32, y: u32| [x as u8, y as u8, ((x + y) % 256) as u8];
    write_bmp(&dir.path().join("big.bmp"), 100, 100, source);

    let config = config(
        dir.path(),
        r#"{"id": "big", "storage_id": "sd", "path": "/big.bmp", "format": "BMP",
            "resize": {"width": 50, "height": 50}}"#,
    );
    let mut manager = config.build_manager().unwrap();
    let id = manager.resolve("big").unwrap();
    manager.load(id).unwrap();
    settle(&mut manager);

    let pixels = manager.resource(id).unwrap().pixels().unwrap();
    assert_eq!(pixels.dimensions(), (50, 50));
    assert_eq!(pixels.pixels().count(), 2500);

    // Nearest neighbour: destination (x, y) samples source (2x, 2y)
    let reference = RgbaImage::from_fn(50, 50, |x, y| {
        let [r, g, b] = source(2 * x, 2 * y);
        Rgba([r, g, b, 255])
    });
    assert_eq!(pixels, &reference);

    // Rows went to the canvas too
    assert_eq!(manager.canvas().pixel(49, 49), Some(Rgba([98, 98, 196, 255])));
    assert_eq!(manager.canvas().pixel(50, 50), Some(Rgba([255, 255, 255, 255])));
}

#[test]
fn test_solid_fill_and_repeat_load() {
    let dir = tempfile::tempdir().unwrap();
    write_bmp(&dir.path().join("solid.bmp"), 13, 9, |_, _| [12, 34, 56]);

    let config = config(
        dir.path(),
        r#"{"id": "solid", "storage_id": "sd", "path": "solid.bmp", "format": "bmp", "x": 3, "y": 4}"#,
    );
    let mut manager = config.build_manager().unwrap();
    let id = manager.resolve("solid").unwrap();

    manager.load(id).unwrap();
    settle(&mut manager);
    let first = manager.resource(id).unwrap().pixels().cloned().unwrap();
    assert!(first.pixels().all(|p| *p == Rgba([12, 34, 56, 255])));

    manager.reload(id, None).unwrap();
    settle(&mut manager);
    let second = manager.resource(id).unwrap().pixels().cloned().unwrap();
    assert_eq!(first, second);

    assert_eq!(manager.canvas().pixel(3, 4), Some(Rgba([12, 34, 56, 255])));
    assert_eq!(manager.canvas().pixel(2, 4), Some(Rgba([255, 255, 255, 255])));
}

#[test]
fn test_missing_and_escaping_paths_fail_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("card");
    std::fs::create_dir(&root).unwrap();
    write_bmp(&dir.path().join("outside.bmp"), 2, 2, |_, _| [0, 0, 0]);

    let config = config(
        &root,
        r#"{"id": "img", "storage_id": "sd", "path": "/nothing.bmp", "format": "BMP"}"#,
    );
    let mut manager = config.build_manager().unwrap();
    let id = manager.resolve("img").unwrap();

    let codes = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&codes);
    manager.on_error(id, Box::new(move |code| sink.lock().unwrap().push(code)));

    manager.load(id).unwrap();
    settle(&mut manager);
    manager.reload(id, Some("../outside.bmp")).unwrap();
    settle(&mut manager);

    assert_eq!(manager.status(id), Some(LoadStatus::Failed));
    let not_found = ErrorCode::NotFound.as_u8();
    assert_eq!(*codes.lock().unwrap(), vec![not_found, not_found]);
}

#[test]
fn test_truncated_bmp_fails() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cut.bmp");
    write_bmp(&path, 20, 20, |_, _| [1, 2, 3]);
    let data = std::fs::read(&path).unwrap();
    std::fs::write(&path, &data[..54 + 60 * 10 + 30]).unwrap();

    let config = config(
        dir.path(),
        r#"{"id": "cut", "storage_id": "sd", "path": "/cut.bmp", "format": "BMP"}"#,
    );
    let mut manager = config.build_manager().unwrap();
    let id = manager.resolve("cut").unwrap();
    manager.load(id).unwrap();
    settle(&mut manager);

    let resource = manager.resource(id).unwrap();
    assert_eq!(resource.status(), LoadStatus::Failed);
    assert_eq!(resource.last_error(), Some(ErrorCode::TruncatedFile));
    assert!(resource.pixels().is_none());
}

#[test]
fn test_png_with_placeholder_and_error_automation() {
    let dir = tempfile::tempdir().unwrap();
    write_bmp(&dir.path().join("wait.bmp"), 4, 4, |_, _| [0, 0, 200]);
    let photo = RgbaImage::from_fn(4, 4, |x, _| Rgba([200, x as u8 * 50, 0, 255]));
    photo.save(dir.path().join("fallback.png")).unwrap();
    std::fs::write(dir.path().join("broken.png"), b"\x89PNG\r\n\x1a\nnot really").unwrap();

    let config = config(
        dir.path(),
        r#"{"id": "wait", "storage_id": "sd", "path": "/wait.bmp", "format": "BMP"},
           {"id": "photo", "storage_id": "sd", "path": "/broken.png", "format": "PNG",
            "placeholder": "wait",
            "on_error": [
                {"action": "logger.log", "message": "{id} failed with {code}"},
                {"action": "local_image.reload", "id": "photo", "path": "/fallback.png"}
            ]}"#,
    );
    let mut manager = config.build_manager().unwrap();
    let wait = manager.resolve("wait").unwrap();
    let photo_id = manager.resolve("photo").unwrap();

    manager.load(wait).unwrap();
    settle(&mut manager);

    manager.load(photo_id).unwrap();
    assert_eq!(
        manager.visible_pixels(photo_id).map(|p| *p.get_pixel(0, 0)),
        Some(Rgba([0, 0, 200, 255]))
    );

    settle(&mut manager);
    let resource = manager.resource(photo_id).unwrap();
    assert_eq!(resource.status(), LoadStatus::Loaded);
    assert_eq!(resource.path(), "/fallback.png");
    assert_eq!(resource.pixels().unwrap(), &photo);
}
