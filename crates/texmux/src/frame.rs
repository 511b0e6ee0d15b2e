use std::fmt;
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};

/// Column-major 4x4 texture-coordinate transform supplied with every frame.
///
/// Producers use it to express cropping and sensor orientation; consumers
/// upload it next to the sampler so the shader can map quad coordinates into
/// the valid region of the frame.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Transform {
    pub cols: [[f32; 4]; 4],
}

impl Transform {
    pub const IDENTITY: Self = Self {
        cols: [
            [1.0, 0.0, 0.0, 0.0],
            [0.0, 1.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
            [0.0, 0.0, 0.0, 1.0],
        ],
    };

    /// Maps the unit square onto the sub-rectangle `(x, y, width, height)`,
    /// all in normalised texture coordinates.
    pub fn crop(x: f32, y: f32, width: f32, height: f32) -> Self {
        let mut transform = Self::IDENTITY;
        transform.cols[0][0] = width;
        transform.cols[1][1] = height;
        transform.cols[3][0] = x;
        transform.cols[3][1] = y;
        transform
    }

    /// Flips the v axis, the usual fix-up for bottom-up sensor buffers.
    pub fn flip_vertical() -> Self {
        let mut transform = Self::IDENTITY;
        transform.cols[1][1] = -1.0;
        transform.cols[3][1] = 1.0;
        transform
    }

    /// Returns `self * rhs`.
    pub fn then(&self, rhs: &Self) -> Self {
        let mut out = [[0.0f32; 4]; 4];
        for (col, out_col) in out.iter_mut().enumerate() {
            for (row, value) in out_col.iter_mut().enumerate() {
                *value = (0..4)
                    .map(|k| self.cols[k][row] * rhs.cols[col][k])
                    .sum();
            }
        }
        Self { cols: out }
    }

    /// Applies the transform to a texture coordinate.
    pub fn apply(&self, u: f32, v: f32) -> (f32, f32) {
        let x = self.cols[0][0] * u + self.cols[1][0] * v + self.cols[3][0];
        let y = self.cols[0][1] * u + self.cols[1][1] * v + self.cols[3][1];
        (x, y)
    }
}

impl Default for Transform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl fmt::Debug for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.cols.iter()).finish()
    }
}

/// One image produced by the external frame source.
#[derive(Clone, Debug)]
pub struct Frame {
    /// Monotonic producer-side counter.
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub transform: Transform,
    /// Tightly packed RGBA8 rows. `None` for producers that only signal
    /// availability, leaving the texture contents to the platform.
    pub pixels: Option<Arc<[u8]>>,
}

impl Frame {
    pub fn new(sequence: u64, width: u32, height: u32) -> Self {
        Self {
            sequence,
            width,
            height,
            transform: Transform::IDENTITY,
            pixels: None,
        }
    }

    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.transform = transform;
        self
    }

    pub fn with_pixels(mut self, pixels: impl Into<Arc<[u8]>>) -> Self {
        self.pixels = Some(pixels.into());
        self
    }

    pub fn validate(&self) -> Result<(), FrameError> {
        if self.width == 0 || self.height == 0 {
            return Err(FrameError::Invalid(format!(
                "frame {} has empty extent {}x{}",
                self.sequence, self.width, self.height
            )));
        }
        if let Some(pixels) = &self.pixels {
            let expected = self.width as usize * self.height as usize * 4;
            if pixels.len() != expected {
                return Err(FrameError::Invalid(format!(
                    "frame {} carries {} bytes, expected {expected} for {}x{} RGBA",
                    self.sequence,
                    pixels.len(),
                    self.width,
                    self.height
                )));
            }
        }
        Ok(())
    }
}

/// Errors on the producer side of a resource.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// The resource was destroyed; notifications are no longer delivered.
    #[error("frame sink closed")]
    Closed,
    #[error("invalid frame: {0}")]
    Invalid(String),
    /// Failure reported by the producer itself, e.g. a lost camera session.
    #[error("producer error: {0}")]
    Producer(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crop_maps_unit_square_into_region() {
        let crop = Transform::crop(0.25, 0.5, 0.5, 0.25);
        assert_eq!(crop.apply(0.0, 0.0), (0.25, 0.5));
        assert_eq!(crop.apply(1.0, 1.0), (0.75, 0.75));
    }

    #[test]
    fn flip_then_crop_composes() {
        let combined = Transform::crop(0.0, 0.0, 0.5, 0.5).then(&Transform::flip_vertical());
        assert_eq!(combined.apply(0.0, 0.0), (0.0, 0.5));
        assert_eq!(combined.apply(1.0, 1.0), (0.5, 0.0));
        assert_eq!(Transform::IDENTITY.then(&combined), combined);
    }

    #[test]
    fn validate_rejects_short_pixel_buffers() {
        let frame = Frame::new(3, 2, 2).with_pixels(vec![0u8; 15]);
        assert!(matches!(frame.validate(), Err(FrameError::Invalid(_))));
        let frame = Frame::new(3, 2, 2).with_pixels(vec![0u8; 16]);
        assert!(frame.validate().is_ok());
        assert!(Frame::new(0, 0, 4).validate().is_err());
    }
}
