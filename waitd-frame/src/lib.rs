// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
#![deny(
  clippy::all,
  clippy::default_trait_access,
  clippy::expl_impl_clone_on_copy,
  clippy::if_not_else,
  clippy::needless_continue,
  clippy::unseparated_literal_suffix,
  clippy::used_underscore_binding
)]
#![allow(clippy::match_ref_pats)]
#![allow(
  clippy::len_without_is_empty,
  clippy::redundant_field_names,
  clippy::too_many_arguments
)]
#![allow(clippy::new_without_default, clippy::new_ret_no_self)]
#![allow(clippy::mutex_atomic)]

//! Captures pixel buffers ("frames") from a virtual X11 display or a pty
//! session. A frame is deliberately a raw RGB8 buffer, not a file: encoding
//! (JPEG, thumbnail) happens downstream in the job context.

use std::sync::Arc;

use async_trait::async_trait;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageFormat};

pub mod pty;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
  #[error("failed to launch capture tool for display {display}: {detail}")]
  Spawn { display: String, detail: String },
  #[error("capture tool for display {display} exited with status {status}: {stderr}")]
  ToolFailed { display: String, status: String, stderr: String },
  #[error("failed to decode captured image: {0}")]
  Decode(#[from] image::ImageError),
  #[error("window {0} could not be resolved on this display")]
  WindowNotFound(String),
}

pub type Result<T> = std::result::Result<T, FrameError>;

/// A captured frame: an RGB8 pixel buffer plus its dimensions.
#[derive(Debug, Clone)]
pub struct Frame {
  pub width: u32,
  pub height: u32,
  /// Row-major RGB8 pixels, `width * height * 3` bytes.
  pub rgb: Arc<[u8]>,
}

impl Frame {
  pub fn from_dynamic_image(image: DynamicImage) -> Frame {
    let rgb_image = image.to_rgb8();
    let (width, height) = (rgb_image.width(), rgb_image.height());
    Frame { width, height, rgb: Arc::from(rgb_image.into_raw()) }
  }

  pub fn to_dynamic_image(&self) -> DynamicImage {
    let buffer = image::RgbImage::from_raw(self.width, self.height, self.rgb.to_vec())
      .expect("frame buffer length always matches width * height * 3");
    DynamicImage::ImageRgb8(buffer)
  }

  /// Encodes as JPEG at the given quality (0-100), resizing so neither
  /// dimension exceeds `max_dim` (aspect ratio preserved).
  pub fn encode_jpeg(&self, max_dim: u32, quality: u8) -> Result<Vec<u8>> {
    let resized = self.resized(max_dim);
    let rgb = resized.to_rgb8();
    let mut out = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut out, quality);
    encoder
      .encode(rgb.as_raw(), rgb.width(), rgb.height(), image::ExtendedColorType::Rgb8)
      .map_err(FrameError::Decode)?;
    Ok(out)
  }

  fn resized(&self, max_dim: u32) -> DynamicImage {
    let image = self.to_dynamic_image();
    if self.width <= max_dim && self.height <= max_dim {
      return image;
    }
    image.resize(max_dim, max_dim, image::imageops::FilterType::Triangle)
  }
}

/// What a wait job is watching: a whole virtual display, a specific window
/// on that display, or a pty session's rendered screen buffer.
#[derive(Debug, Clone)]
pub enum TargetKind {
  Screen,
  Window(WindowRef),
  Pty(String),
}

#[derive(Debug, Clone)]
pub enum WindowRef {
  Id(u64),
  Name(String),
}

/// Captures frames for a wait job's target. Implementations are free to
/// shell out to external tools (as the X11 implementation does) or render
/// in-process (as the pty implementation does).
#[async_trait]
pub trait FrameSource: Send + Sync {
  async fn capture(&self, display: &str, target: &TargetKind) -> Result<Option<Frame>>;

  /// Resolves a window name substring to a numeric window id, so callers
  /// that want to cache the id (rather than re-resolving by name on every
  /// capture) can do so. Returns `Ok(None)` when no matching window exists
  /// yet. The default implementation never resolves, matching sources (like
  /// the pty one) that have no concept of named windows.
  async fn resolve_window(&self, _display: &str, _name: &str) -> Result<Option<u64>> {
    Ok(None)
  }
}

/// Captures frames from a real (virtual) X11 display using the `import`
/// tool from ImageMagick, which is present on the display manager's
/// allocated displays alongside Xvfb and the window manager.
pub struct X11FrameSource;

impl X11FrameSource {
  pub fn new() -> Self {
    X11FrameSource
  }

  async fn run_import(&self, display: &str, window_arg: Option<&str>) -> Result<Vec<u8>> {
    let mut command = tokio::process::Command::new("import");
    command.arg("-display").arg(display).arg("-silent");
    match window_arg {
      Some(id) => {
        command.arg("-window").arg(id);
      }
      None => {
        command.arg("-window").arg("root");
      }
    }
    command.arg("png:-");
    let output = command
      .output()
      .await
      .map_err(|e| FrameError::Spawn { display: display.to_owned(), detail: e.to_string() })?;
    if !output.status.success() {
      return Err(FrameError::ToolFailed {
        display: display.to_owned(),
        status: output.status.to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
      });
    }
    Ok(output.stdout)
  }

  async fn resolve_window_id(&self, display: &str, name: &str) -> Result<String> {
    let output = tokio::process::Command::new("xdotool")
      .env("DISPLAY", display)
      .arg("search")
      .arg("--name")
      .arg(name)
      .output()
      .await
      .map_err(|e| FrameError::Spawn { display: display.to_owned(), detail: e.to_string() })?;
    let id = String::from_utf8_lossy(&output.stdout)
      .lines()
      .next()
      .map(str::to_owned)
      .ok_or_else(|| FrameError::WindowNotFound(name.to_owned()))?;
    Ok(id)
  }
}

#[async_trait]
impl FrameSource for X11FrameSource {
  async fn capture(&self, display: &str, target: &TargetKind) -> Result<Option<Frame>> {
    let png_bytes = match target {
      TargetKind::Screen => self.run_import(display, None).await?,
      TargetKind::Window(WindowRef::Id(id)) => self.run_import(display, Some(&id.to_string())).await?,
      TargetKind::Window(WindowRef::Name(name)) => {
        let id = self.resolve_window_id(display, name).await?;
        self.run_import(display, Some(&id)).await?
      }
      TargetKind::Pty(_) => return Ok(None),
    };
    let image = image::load_from_memory_with_format(&png_bytes, ImageFormat::Png)?;
    Ok(Some(Frame::from_dynamic_image(image)))
  }

  async fn resolve_window(&self, display: &str, name: &str) -> Result<Option<u64>> {
    match self.resolve_window_id(display, name).await {
      Ok(id) => Ok(id.parse().ok()),
      Err(FrameError::WindowNotFound(_)) => Ok(None),
      Err(e) => Err(e),
    }
  }
}

/// Dispatches to the X11 source for `screen`/`window` targets and the pty
/// source for `pty` targets, so the scheduler can hold a single
/// `Arc<dyn FrameSource>` regardless of what a job is watching.
pub struct CompositeFrameSource {
  x11: X11FrameSource,
  pty: pty::PtyFrameSource,
}

impl CompositeFrameSource {
  pub fn new(pty_registry: Arc<pty::PtyRegistry>) -> Self {
    CompositeFrameSource { x11: X11FrameSource::new(), pty: pty::PtyFrameSource::new(pty_registry) }
  }
}

#[async_trait]
impl FrameSource for CompositeFrameSource {
  async fn capture(&self, display: &str, target: &TargetKind) -> Result<Option<Frame>> {
    match target {
      TargetKind::Pty(_) => self.pty.capture(display, target).await,
      _ => self.x11.capture(display, target).await,
    }
  }

  async fn resolve_window(&self, display: &str, name: &str) -> Result<Option<u64>> {
    self.x11.resolve_window(display, name).await
  }
}
