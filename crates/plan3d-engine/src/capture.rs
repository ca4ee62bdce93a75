use std::io::Cursor;
use std::path::{Path, PathBuf};

use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, RgbaImage};
use plan3d_contracts::assets::AssetRef;

pub const MAX_CAPTURE_EDGE: u32 = 2048;

/// Something that can draw the current 3D scene once and hand back its pixels.
pub trait SceneRenderer: Send {
    fn render_frame(&mut self) -> Option<RgbaImage>;
}

/// A captured view, PNG-encoded as an inline data URL.
#[derive(Debug, Clone, PartialEq)]
pub struct StillImage {
    pub width: u32,
    pub height: u32,
    pub asset: AssetRef,
}

/// `None` when nothing is mounted, the renderer produced no frame, or encoding failed.
pub fn capture_current_view(renderer: Option<&mut dyn SceneRenderer>) -> Option<StillImage> {
    let frame = renderer?.render_frame()?;
    if frame.width() == 0 || frame.height() == 0 {
        return None;
    }
    let mut image = DynamicImage::ImageRgba8(frame);
    if image.width().max(image.height()) > MAX_CAPTURE_EDGE {
        image = image.resize(MAX_CAPTURE_EDGE, MAX_CAPTURE_EDGE, FilterType::Triangle);
    }
    let mut bytes = Cursor::new(Vec::new());
    image.write_to(&mut bytes, ImageFormat::Png).ok()?;
    Some(StillImage {
        width: image.width(),
        height: image.height(),
        asset: AssetRef::inline_png(bytes.get_ref()),
    })
}

/// Reads the latest frame an external viewer exported to `path`.
#[derive(Debug, Clone)]
pub struct FrameFileRenderer {
    path: PathBuf,
}

impl FrameFileRenderer {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SceneRenderer for FrameFileRenderer {
    fn render_frame(&mut self) -> Option<RgbaImage> {
        image::open(&self.path).ok().map(|image| image.to_rgba8())
    }
}
