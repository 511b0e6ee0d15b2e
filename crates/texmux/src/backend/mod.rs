//! Graphics backend abstraction.
//!
//! A render thread drives a backend through an explicit acquisition sequence
//! and releases in reverse:
//!
//! ```text
//!   open_display ─▶ create_context ─▶ create_surface ─▶ make_current
//!        ▲                                                   │
//!        │                 frame loop: swap_buffers ◀────────┘
//!        │
//!   terminate_display ◀─ destroy_context ◀─ destroy_surface
//! ```
//!
//! Texture work is issued through [`GpuContext`], which is only reachable from
//! the thread that owns the context.

use std::fmt;
use std::sync::Arc;

use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

use crate::frame::{Frame, Transform};

pub mod headless;
#[cfg(feature = "wgpu")]
pub mod wgpu;

/// Opaque texture handle. [`TextureId::INVALID`] marks an absent handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureId(pub u64);

impl TextureId {
    pub const INVALID: Self = Self(0);

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

impl fmt::Display for TextureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tex#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphicsError {
    #[error("display unavailable: {0}")]
    DisplayUnavailable(String),
    #[error("context creation failed: {0}")]
    ContextCreation(String),
    #[error("surface creation failed: {0}")]
    SurfaceCreation(String),
    #[error("failed to make context current: {0}")]
    MakeCurrent(String),
    #[error("failed to present frame: {0}")]
    Present(String),
    #[error("texture operation failed: {0}")]
    Texture(String),
    #[error("unknown texture {0}")]
    UnknownTexture(TextureId),
    #[error("teardown step failed: {0}")]
    Teardown(String),
    #[error("attribute {name} = {value} outside {min}..={max}")]
    InvalidAttribute {
        name: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },
}

/// Native drawable handed over by the window system.
///
/// The core never creates or owns the window; it only binds a context to it.
pub trait WindowTarget: HasWindowHandle + HasDisplayHandle + Send + Sync {
    /// Current drawable size in physical pixels.
    fn size(&self) -> (u32, u32);
}

/// Where a render thread presents its frames.
#[derive(Clone)]
pub enum SurfaceTarget {
    /// Off-screen buffer of the given size.
    Offscreen { width: u32, height: u32 },
    Window(Arc<dyn WindowTarget>),
}

impl SurfaceTarget {
    pub fn offscreen(width: u32, height: u32) -> Self {
        Self::Offscreen { width, height }
    }

    pub fn size(&self) -> (u32, u32) {
        match self {
            Self::Offscreen { width, height } => (*width, *height),
            Self::Window(window) => window.size(),
        }
    }
}

impl fmt::Debug for SurfaceTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Offscreen { width, height } => f
                .debug_struct("Offscreen")
                .field("width", width)
                .field("height", height)
                .finish(),
            Self::Window(window) => f.debug_tuple("Window").field(&window.size()).finish(),
        }
    }
}

/// Requested framebuffer attributes for a context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextConfig {
    pub red_bits: u32,
    pub green_bits: u32,
    pub blue_bits: u32,
    pub alpha_bits: u32,
    pub depth_bits: u32,
    pub stencil_bits: u32,
    pub samples: u32,
    pub swap_interval: u32,
}

const MAX_CHANNEL_BITS: u32 = 32;
const MAX_SAMPLES: u32 = 16;
const MAX_SWAP_INTERVAL: u32 = 4;

impl ContextConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_color_bits(mut self, red: u32, green: u32, blue: u32) -> Self {
        self.red_bits = red;
        self.green_bits = green;
        self.blue_bits = blue;
        self
    }

    pub fn with_alpha_bits(mut self, bits: u32) -> Self {
        self.alpha_bits = bits;
        self
    }

    pub fn with_depth_bits(mut self, bits: u32) -> Self {
        self.depth_bits = bits;
        self
    }

    pub fn with_stencil_bits(mut self, bits: u32) -> Self {
        self.stencil_bits = bits;
        self
    }

    pub fn with_samples(mut self, samples: u32) -> Self {
        self.samples = samples;
        self
    }

    pub fn with_swap_interval(mut self, interval: u32) -> Self {
        self.swap_interval = interval;
        self
    }

    /// Checks every attribute against the range a context can honour.
    pub fn validate(&self) -> Result<(), GraphicsError> {
        let ranges = [
            ("red_bits", self.red_bits, 0, MAX_CHANNEL_BITS),
            ("green_bits", self.green_bits, 0, MAX_CHANNEL_BITS),
            ("blue_bits", self.blue_bits, 0, MAX_CHANNEL_BITS),
            ("alpha_bits", self.alpha_bits, 0, MAX_CHANNEL_BITS),
            ("depth_bits", self.depth_bits, 0, MAX_CHANNEL_BITS),
            ("stencil_bits", self.stencil_bits, 0, MAX_CHANNEL_BITS),
            ("samples", self.samples, 1, MAX_SAMPLES),
            ("swap_interval", self.swap_interval, 0, MAX_SWAP_INTERVAL),
        ];
        for (name, value, min, max) in ranges {
            if value < min || value > max {
                return Err(GraphicsError::InvalidAttribute {
                    name,
                    value,
                    min,
                    max,
                });
            }
        }
        Ok(())
    }
}

impl Default for ContextConfig {
    /// RGB888, no depth or stencil, single-sampled, vsync on.
    fn default() -> Self {
        Self {
            red_bits: 8,
            green_bits: 8,
            blue_bits: 8,
            alpha_bits: 0,
            depth_bits: 0,
            stencil_bits: 0,
            samples: 1,
            swap_interval: 1,
        }
    }
}

/// Texture operations against the context current on the calling thread.
pub trait GpuContext {
    /// Human-readable owner label used in diagnostics.
    fn label(&self) -> &str;

    /// Allocates a texture suitable for receiving producer frames.
    fn create_external_texture(
        &mut self,
        size: Option<(u32, u32)>,
    ) -> Result<TextureId, GraphicsError>;

    fn delete_texture(&mut self, texture: TextureId) -> Result<(), GraphicsError>;

    /// Latches `frame` into `texture`.
    fn upload_frame(&mut self, texture: TextureId, frame: &Frame) -> Result<(), GraphicsError>;

    fn bind_texture(&mut self, unit: u32, texture: TextureId) -> Result<(), GraphicsError>;

    fn set_transform(&mut self, binding: u32, transform: &Transform) -> Result<(), GraphicsError>;
}

/// Platform graphics API driven by a render thread.
///
/// The backend value is moved onto the render thread; the display, context
/// and surface it hands out never leave that thread.
pub trait GraphicsBackend: Send + 'static {
    type Display;
    type Context: GpuContext;
    type Surface;

    fn name(&self) -> &str;

    fn open_display(&mut self) -> Result<Self::Display, GraphicsError>;

    fn create_context(
        &mut self,
        display: &Self::Display,
        config: &ContextConfig,
    ) -> Result<Self::Context, GraphicsError>;

    fn create_surface(
        &mut self,
        display: &Self::Display,
        context: &Self::Context,
        target: &SurfaceTarget,
    ) -> Result<Self::Surface, GraphicsError>;

    fn make_current(
        &mut self,
        display: &Self::Display,
        context: &mut Self::Context,
        surface: &Self::Surface,
    ) -> Result<(), GraphicsError>;

    fn swap_buffers(
        &mut self,
        display: &Self::Display,
        context: &mut Self::Context,
        surface: &mut Self::Surface,
    ) -> Result<(), GraphicsError>;

    fn destroy_surface(
        &mut self,
        display: &Self::Display,
        surface: Self::Surface,
    ) -> Result<(), GraphicsError>;

    fn destroy_context(
        &mut self,
        display: &Self::Display,
        context: Self::Context,
    ) -> Result<(), GraphicsError>;

    /// Releases the current binding and terminates the display connection.
    fn terminate_display(&mut self, display: Self::Display) -> Result<(), GraphicsError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(ContextConfig::default().validate().is_ok());
    }

    #[test]
    fn out_of_range_attributes_are_named() {
        let err = ContextConfig::new()
            .with_color_bits(8, 40, 8)
            .validate()
            .unwrap_err();
        assert_eq!(
            err,
            GraphicsError::InvalidAttribute {
                name: "green_bits",
                value: 40,
                min: 0,
                max: 32,
            }
        );
        assert!(ContextConfig::new().with_samples(0).validate().is_err());
    }

    #[test]
    fn invalid_texture_sentinel() {
        assert!(!TextureId::INVALID.is_valid());
        assert!(TextureId(4).is_valid());
        assert_eq!(TextureId(4).to_string(), "tex#4");
    }
}
