// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use serde::{Deserialize, Serialize};

use crate::core::{PipelineError, Result};

/// Size of the per-buffer metadata plane appended when a pool asks for one.
pub const META_PLANE_SIZE: usize = 32 * 1024;

/// Plane geometry shared by every buffer of one pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaneLayout {
    /// Bytes per plane.
    pub sizes: Vec<usize>,
    /// Row stride per plane, in bytes.
    pub strides: Vec<usize>,
}

impl PlaneLayout {
    pub fn new(sizes: Vec<usize>, strides: Vec<usize>) -> Self {
        Self { sizes, strides }
    }

    /// Single-plane layout (packed bayer, JPEG output, ...).
    pub fn single(size: usize, stride: usize) -> Self {
        Self::new(vec![size], vec![stride])
    }

    pub fn plane_count(&self) -> usize {
        self.sizes.len()
    }

    pub fn total_size(&self) -> usize {
        self.sizes.iter().sum()
    }

    pub fn validate(&self) -> Result<()> {
        if self.sizes.is_empty() {
            return Err(PipelineError::Configuration(
                "plane layout must have at least one plane".into(),
            ));
        }
        if self.sizes.len() != self.strides.len() {
            return Err(PipelineError::Configuration(format!(
                "plane layout has {} sizes but {} strides",
                self.sizes.len(),
                self.strides.len()
            )));
        }
        for (plane, (&size, &stride)) in self.sizes.iter().zip(&self.strides).enumerate() {
            if size == 0 {
                return Err(PipelineError::Configuration(format!(
                    "plane {} has zero size",
                    plane
                )));
            }
            if stride == 0 || stride > size {
                return Err(PipelineError::Configuration(format!(
                    "plane {} stride {} is outside 1..={}",
                    plane, stride, size
                )));
            }
        }
        Ok(())
    }

    /// Layout with the metadata plane appended.
    pub fn with_metadata_plane(&self) -> Self {
        let mut layout = self.clone();
        layout.sizes.push(META_PLANE_SIZE);
        layout.strides.push(META_PLANE_SIZE);
        layout
    }
}

/// Descriptor of one plane of a pooled buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BufferPlane {
    pub size: usize,
    pub stride: usize,
    /// File descriptor when the allocator exports one (ion/dma-buf style).
    pub fd: Option<i32>,
    /// CPU address, present only for mapped pools.
    pub addr: Option<usize>,
}

/// Descriptor of a pooled buffer. Never owns the memory it points at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Buffer {
    pub index: usize,
    pub planes: Vec<BufferPlane>,
}

impl Buffer {
    pub fn plane_count(&self) -> usize {
        self.planes.len()
    }
}

/// Backing memory for one plane, as handed out by a [`BufferAllocator`].
///
/// [`BufferAllocator`]: super::BufferAllocator
#[derive(Debug)]
pub struct PlaneMemory {
    pub bytes: Box<[u8]>,
    pub fd: Option<i32>,
}

impl PlaneMemory {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// All planes of one buffer.
pub type PlaneSet = Vec<PlaneMemory>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_layout() {
        let layout = PlaneLayout::new(vec![4096, 2048], vec![64, 64]);
        assert!(layout.validate().is_ok());
        assert_eq!(layout.plane_count(), 2);
        assert_eq!(layout.total_size(), 6144);
    }

    #[test]
    fn test_mismatched_strides_rejected() {
        let layout = PlaneLayout::new(vec![4096, 2048], vec![64]);
        assert!(matches!(
            layout.validate(),
            Err(PipelineError::Configuration(_))
        ));
    }

    #[test]
    fn test_zero_size_and_stride_rejected() {
        assert!(PlaneLayout::single(0, 1).validate().is_err());
        assert!(PlaneLayout::single(128, 0).validate().is_err());
        assert!(PlaneLayout::single(128, 256).validate().is_err());
        assert!(PlaneLayout::new(vec![], vec![]).validate().is_err());
    }

    #[test]
    fn test_metadata_plane_appended() {
        let layout = PlaneLayout::single(1024, 32).with_metadata_plane();
        assert_eq!(layout.plane_count(), 2);
        assert_eq!(layout.sizes[1], META_PLANE_SIZE);
    }
}
