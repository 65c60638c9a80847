#![allow(dead_code)]

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::Router;
use image::{ImageFormat, Rgb, RgbImage};
use serde_json::Value;

use flux_plugin_daemon::desktop::Wallpaper;
use flux_plugin_daemon::error::Result;
use flux_plugin_daemon::plugin::Plugin;
use flux_plugin_daemon::transport::Command;

/// Serve `app` on an ephemeral local port and return its base URL.
pub async fn spawn_stub(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

/// A small solid-color PNG.
pub fn png_bytes(width: u32, height: u32, color: [u8; 3]) -> Vec<u8> {
    let image = RgbImage::from_pixel(width, height, Rgb(color));
    let mut out = Cursor::new(Vec::new());
    image.write_to(&mut out, ImageFormat::Png).unwrap();
    out.into_inner()
}

/// Write a screenshot into `gallery` and return its path.
pub fn screenshot(gallery: &Path, name: &str) -> PathBuf {
    let path = gallery.join(name);
    std::fs::write(&path, png_bytes(320, 200, [30, 120, 200])).unwrap();
    path
}

/// Records every background assignment.
#[derive(Default)]
pub struct RecordingWallpaper {
    pub calls: Mutex<Vec<PathBuf>>,
}

#[async_trait]
impl Wallpaper for RecordingWallpaper {
    async fn set_background(&self, image: &Path) -> Result<()> {
        self.calls.lock().unwrap().push(image.to_path_buf());
        Ok(())
    }
}

/// Temporary config, output and gallery directories for one test.
pub struct Workspace {
    pub root: tempfile::TempDir,
    pub output: PathBuf,
    pub gallery: PathBuf,
    pub config_path: PathBuf,
}

impl Workspace {
    pub fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        let output = root.path().join("out");
        let gallery = root.path().join("gallery");
        std::fs::create_dir_all(&gallery).unwrap();
        let config_path = root.path().join("config.json");
        Self {
            root,
            output,
            gallery,
            config_path,
        }
    }

    /// Write `config.json` with the workspace directories merged into `extra`.
    pub fn write_config(&self, extra: Value) {
        let mut config = serde_json::json!({
            "OUTPUT_DIRECTORY": self.output,
            "GALLERY_DIRECTORY": self.gallery,
        });
        if let (Some(base), Value::Object(extra)) = (config.as_object_mut(), extra) {
            base.extend(extra);
        }
        std::fs::write(&self.config_path, serde_json::to_vec_pretty(&config).unwrap()).unwrap();
    }

    pub fn plugin(&self, wallpaper: Arc<RecordingWallpaper>) -> Plugin {
        Plugin::new(self.config_path.clone())
            .unwrap()
            .with_wallpaper(wallpaper)
    }

    /// Files written to the output directory, sorted by name.
    pub fn outputs(&self) -> Vec<PathBuf> {
        let Ok(entries) = std::fs::read_dir(&self.output) else {
            return Vec::new();
        };
        let mut files: Vec<PathBuf> = entries.map(|e| e.unwrap().path()).collect();
        files.sort();
        files
    }
}

pub fn command(name: &str, params: Value) -> Command {
    let parameters = match params {
        Value::Object(map) => map,
        _ => serde_json::Map::new(),
    };
    Command {
        name: name.to_string(),
        parameters,
        context: None,
        system_info: None,
    }
}
