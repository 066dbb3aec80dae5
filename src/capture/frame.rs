//! Camera frames and frame sources

use base64::Engine;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat};
use std::fmt;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Frame width sent to the backend
pub const FRAME_WIDTH: u32 = 640;

/// Frame height sent to the backend
pub const FRAME_HEIGHT: u32 = 480;

/// A JPEG frame, pre-encoded as the data URL the backend expects
#[derive(Clone, PartialEq, Eq)]
pub(crate) struct Frame {
    data_url: Arc<str>,
    jpeg_len: usize,
}

impl Frame {
    /// Wrap already-encoded JPEG bytes
    pub fn from_jpeg(jpeg: &[u8]) -> Self {
        let encoded = base64::engine::general_purpose::STANDARD.encode(jpeg);
        Self {
            data_url: Arc::from(format!("data:image/jpeg;base64,{}", encoded)),
            jpeg_len: jpeg.len(),
        }
    }

    /// Scale and crop to the capture size, then encode as JPEG
    pub fn encode(image: &DynamicImage) -> Result<Self, CaptureError> {
        let scaled = image.resize_to_fill(FRAME_WIDTH, FRAME_HEIGHT, FilterType::Triangle);
        // JPEG has no alpha channel
        let rgb = DynamicImage::ImageRgb8(scaled.to_rgb8());
        let mut jpeg = Vec::new();
        rgb.write_to(&mut Cursor::new(&mut jpeg), ImageFormat::Jpeg)
            .map_err(CaptureError::Encode)?;
        Ok(Self::from_jpeg(&jpeg))
    }

    pub fn data_url(&self) -> &str {
        &self.data_url
    }

    pub fn jpeg_len(&self) -> usize {
        self.jpeg_len
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("jpeg_len", &self.jpeg_len)
            .finish()
    }
}

/// Something that can be sampled for the current camera image.
///
/// `grab` is called from the capture step and must not block.
pub(crate) trait FrameSource: Send {
    fn grab(&mut self) -> Option<Frame>;
}

/// Replays the images in a directory, looping forever.
///
/// Images are decoded and re-encoded once when the source is opened, so
/// grabbing a frame is just a clone.
pub(crate) struct DirectoryFrameSource {
    frames: Vec<Frame>,
    next: usize,
}

impl DirectoryFrameSource {
    pub fn open(dir: &Path) -> Result<Self, CaptureError> {
        let entries = std::fs::read_dir(dir).map_err(|e| CaptureError::Io {
            path: dir.to_path_buf(),
            source: e,
        })?;

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| is_supported_image(path))
            .collect();
        paths.sort();

        let mut frames = Vec::with_capacity(paths.len());
        for path in paths {
            match image::open(&path) {
                Ok(img) => frames.push(Frame::encode(&img)?),
                Err(e) => warn!("Skipping unreadable frame {:?}: {}", path, e),
            }
        }

        if frames.is_empty() {
            return Err(CaptureError::NoFrames(dir.to_path_buf()));
        }
        info!("Loaded {} frames from {:?}", frames.len(), dir);
        Ok(Self::from_frames(frames))
    }

    pub fn from_frames(frames: Vec<Frame>) -> Self {
        Self { frames, next: 0 }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }
}

impl FrameSource for DirectoryFrameSource {
    fn grab(&mut self) -> Option<Frame> {
        if self.frames.is_empty() {
            return None;
        }
        let frame = self.frames[self.next % self.frames.len()].clone();
        self.next = (self.next + 1) % self.frames.len();
        Some(frame)
    }
}

fn is_supported_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| matches!(ext.to_ascii_lowercase().as_str(), "jpg" | "jpeg" | "png"))
        .unwrap_or(false)
}

/// Frame loading errors
#[derive(Debug, thiserror::Error)]
pub(crate) enum CaptureError {
    #[error("Failed to read frames directory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("No usable images in {0}")]
    NoFrames(PathBuf),

    #[error("Failed to encode frame: {0}")]
    Encode(#[source] image::ImageError),
}
