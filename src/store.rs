//! Sequentially numbered persistence of raw buffers and decoded stills.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use image::ImageFormat;
use tracing::info;

use crate::decode::ColorImage;
use crate::error::Result;

/// Default file name prefix.
pub const DEFAULT_PREFIX: &str = "captures";

/// Writes `<prefix>_<n>.raw` and `<prefix>_<n>.bmp` into one directory.
///
/// Raw and still saves share the counter. It advances on every attempt,
/// so a failed save never reuses its number.
#[derive(Debug)]
pub struct CaptureStore {
    dir: PathBuf,
    prefix: String,
    next_index: u64,
}

impl CaptureStore {
    /// Store files in `dir`, which is created on the first save if missing.
    pub fn new<P: Into<PathBuf>, S: Into<String>>(dir: P, prefix: S) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
            next_index: 0,
        }
    }

    /// Output directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Number the next save will use.
    pub const fn next_index(&self) -> u64 {
        self.next_index
    }

    /// Write the exact bytes to a new `.raw` file, flushed to disk.
    pub fn save_raw(&mut self, bytes: &[u8]) -> Result<PathBuf> {
        let path = self.next_path("raw")?;
        let mut file = File::create(&path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        info!("saved {} raw bytes to {}", bytes.len(), path.display());
        Ok(path)
    }

    /// Write the image to a new `.bmp` file.
    pub fn save_still(&mut self, image: &ColorImage) -> Result<PathBuf> {
        let path = self.next_path("bmp")?;
        image.save_with_format(&path, ImageFormat::Bmp)?;
        info!(
            "saved {}x{} still to {}",
            image.width(),
            image.height(),
            path.display()
        );
        Ok(path)
    }

    fn next_path(&mut self, extension: &str) -> Result<PathBuf> {
        let index = self.next_index;
        self.next_index += 1;
        fs::create_dir_all(&self.dir)?;
        Ok(self
            .dir
            .join(format!("{}_{index}.{extension}", self.prefix)))
    }
}
