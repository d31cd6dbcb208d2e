//! End-to-end edit → fan-out → render flow over filesystem storage.

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use canvas::{Canvas, FsImageStorage, ImageStorage, OutboxReceiver, outbox};
use image::{ImageFormat, Rgba, RgbaImage};
use tesserae_config::{RenderConfig, SchedulerConfig, Settings};
use tesserae_ipc::{ChunkCoord, ServerMessage, TileCoord, decode_png_data_url};

fn solid_png(size: u32, rgba: [u8; 4]) -> Vec<u8> {
    let mut buffer = Cursor::new(Vec::new());
    RgbaImage::from_pixel(size, size, Rgba(rgba))
        .write_to(&mut buffer, ImageFormat::Png)
        .unwrap();
    buffer.into_inner()
}

/// Reference grid with small composites so renders stay quick
fn settings() -> Settings {
    Settings {
        render: RenderConfig {
            chunk_preview_size: 200,
            overview_size: 100,
        },
        scheduler: SchedulerConfig {
            chunk_debounce_ms: 10,
            overview_debounce_ms: 20,
            ..SchedulerConfig::immediate()
        },
        ..Settings::default()
    }
}

fn open(dir: &tempfile::TempDir) -> Canvas {
    let storage = FsImageStorage::open(dir.path(), settings().grid.chunk_tile_span).unwrap();
    Canvas::open(&settings(), Arc::new(storage)).unwrap()
}

async fn next_message(rx: &mut OutboxReceiver) -> ServerMessage {
    let frame = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("outbox closed");
    serde_json::from_str(&frame).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_red_tile_reaches_subscriber_then_chunk_ready() {
    let dir = tempfile::tempdir().unwrap();
    let canvas = open(&dir);

    let (tx, mut rx) = outbox(32);
    let id = canvas.connect(tx);
    canvas.subscribe(id, &["5:3"]);

    let red = solid_png(32, [255, 0, 0, 255]);
    let write = canvas.write_tile(512, 384, &red).unwrap();
    assert_eq!(write.version, 1);
    assert_eq!(write.chunk.to_string(), "5:3");

    match next_message(&mut rx).await {
        ServerMessage::TileUpdate {
            x,
            y,
            chunk_id,
            version,
            image,
        } => {
            assert_eq!((x, y, version), (512, 384, 1));
            assert_eq!(chunk_id, ChunkCoord::new(5, 3));
            assert_eq!(decode_png_data_url(&image).unwrap(), red);
        }
        other => panic!("expected tileUpdate, got {other:?}"),
    }

    let mut chunk_ready = None;
    while chunk_ready.is_none() {
        match next_message(&mut rx).await {
            ServerMessage::ChunkReady { chunk_id, version } => chunk_ready = Some((chunk_id, version)),
            ServerMessage::OverviewReady { .. } => {}
            other => panic!("unexpected message {other:?}"),
        }
    }
    assert_eq!(chunk_ready, Some((ChunkCoord::new(5, 3), 1)));

    let view = canvas.chunk_composite(ChunkCoord::new(5, 3)).unwrap();
    assert_eq!(view.version, 1);
    let raster = image::load_from_memory(&view.bytes).unwrap().to_rgba8();
    // 2px per tile: tile (12, 84) of the chunk sits at (24, 168)
    assert_eq!(raster.get_pixel(24, 168).0, [255, 0, 0, 255]);
    assert_eq!(raster.get_pixel(0, 0).0, [255, 255, 255, 255]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_edits_converge_to_last_write() {
    let dir = tempfile::tempdir().unwrap();
    let canvas = Arc::new(open(&dir));
    let palette: [[u8; 4]; 4] = [
        [255, 0, 0, 255],
        [0, 255, 0, 255],
        [0, 0, 255, 255],
        [0, 0, 0, 255],
    ];

    let writers: Vec<_> = (0..4u32)
        .map(|w| {
            let canvas = canvas.clone();
            std::thread::spawn(move || {
                for round in 0..4usize {
                    for i in 0..5u32 {
                        let png = solid_png(32, palette[(round + w as usize) % 4]);
                        canvas.write_tile(100 + w * 10 + i, 100, &png).unwrap();
                    }
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }

    // Round 3 is the last write of every tile
    assert!(canvas.scheduler().wait_until_clean(Duration::from_secs(10)).await);

    let view = canvas.chunk_composite(ChunkCoord::new(1, 1)).unwrap();
    assert!(!view.stale);
    let raster = image::load_from_memory(&view.bytes).unwrap().to_rgba8();
    for w in 0..4u32 {
        for i in 0..5u32 {
            let local_x = w * 10 + i;
            let expected = palette[(3 + w as usize) % 4];
            assert_eq!(raster.get_pixel(local_x * 2, 0).0, expected, "tile {}:100", 100 + local_x);
            assert_eq!(canvas.tile_metadata(100 + local_x, 100).unwrap().unwrap().version, 4);
        }
    }
    assert!(canvas.overview_version().version >= 1);
    assert!(!canvas.overview_version().stale);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_restart_keeps_state_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    {
        let canvas = open(&dir);
        canvas.write_tile(0, 0, &solid_png(32, [0, 0, 0, 255])).unwrap();
        canvas.write_tile(0, 0, &solid_png(32, [9, 9, 9, 255])).unwrap();
        assert!(canvas.scheduler().wait_until_clean(Duration::from_secs(5)).await);
    }

    let canvas = open(&dir);
    let tile = canvas.tile(0, 0).unwrap().unwrap();
    assert_eq!(tile.record.version, 2);
    assert_eq!(tile.bytes, solid_png(32, [9, 9, 9, 255]));
    assert_eq!(canvas.reconcile(), 0);

    let view = canvas.chunk_composite(ChunkCoord::new(0, 0)).unwrap();
    assert!(view.version >= 1);
    let raster = image::load_from_memory(&view.bytes).unwrap().to_rgba8();
    assert_eq!(raster.get_pixel(0, 0).0, [9, 9, 9, 255]);

    assert_eq!(canvas.write_tile(0, 0, &solid_png(32, [1, 1, 1, 255])).unwrap().version, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reset_survives_restart_with_leftover_versions() {
    let dir = tempfile::tempdir().unwrap();
    {
        let canvas = open(&dir);
        canvas.write_tile(7, 7, &solid_png(32, [0, 0, 0, 255])).unwrap();
        canvas.write_tile(7, 7, &solid_png(32, [5, 5, 5, 255])).unwrap();
        assert!(canvas.scheduler().wait_until_clean(Duration::from_secs(5)).await);

        // Left behind by a rewrite interrupted before the old file was removed
        let storage = FsImageStorage::open(dir.path(), settings().grid.chunk_tile_span).unwrap();
        storage
            .write_tile(TileCoord::new(7, 7), 1, &solid_png(32, [0, 0, 0, 255]), None)
            .unwrap();

        assert!(canvas.reset_tile(7, 7).unwrap().deleted());
        assert!(canvas.scheduler().wait_until_clean(Duration::from_secs(5)).await);
    }

    let canvas = open(&dir);
    assert!(canvas.tile(7, 7).unwrap().is_none());
    assert_eq!(canvas.store().tile_count(), 0);
}
