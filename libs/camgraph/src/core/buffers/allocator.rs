// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Platform allocator seam.
//!
//! The core only needs "allocate N buffers of these plane sizes" and "free
//! them again". Real platforms back this with ion/dma-buf heaps; the
//! [`HeapAllocator`] here backs it with ordinary heap memory so pools can be
//! exercised in tests and in the simulator.

use std::sync::atomic::{AtomicUsize, Ordering};

use super::{Buffer, PlaneMemory, PlaneSet};
use crate::core::{PipelineError, Result};

pub trait BufferAllocator: Send + Sync {
    /// Allocate `count` buffers, each with one plane per entry of `plane_sizes`.
    fn allocate(&self, plane_sizes: &[usize], count: usize) -> Result<Vec<PlaneSet>>;

    /// Return buffers previously produced by [`allocate`](Self::allocate).
    fn free(&self, buffers: Vec<PlaneSet>);

    /// Register a freshly allocated buffer with the hardware (IOMMU mapping,
    /// driver-side buffer tables). Pools using the silent policy skip this.
    fn register(&self, _buffer: &Buffer) -> Result<()> {
        Ok(())
    }
}

/// Heap-backed allocator with an optional byte budget.
#[derive(Debug, Default)]
pub struct HeapAllocator {
    limit_bytes: Option<usize>,
    in_use: AtomicUsize,
    registrations: AtomicUsize,
}

impl HeapAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocator that fails once more than `limit_bytes` would be outstanding.
    pub fn with_limit(limit_bytes: usize) -> Self {
        Self {
            limit_bytes: Some(limit_bytes),
            ..Self::default()
        }
    }

    pub fn bytes_in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    pub fn registration_count(&self) -> usize {
        self.registrations.load(Ordering::Acquire)
    }
}

impl BufferAllocator for HeapAllocator {
    fn allocate(&self, plane_sizes: &[usize], count: usize) -> Result<Vec<PlaneSet>> {
        let per_buffer: usize = plane_sizes.iter().sum();
        let requested = per_buffer.saturating_mul(count);

        if let Some(limit) = self.limit_bytes {
            let in_use = self.in_use.load(Ordering::Acquire);
            if in_use.saturating_add(requested) > limit {
                return Err(PipelineError::AllocFailure {
                    pool: String::new(),
                    reason: format!(
                        "requested {} bytes with {} of {} in use",
                        requested, in_use, limit
                    ),
                });
            }
        }

        let buffers = (0..count)
            .map(|_| {
                plane_sizes
                    .iter()
                    .map(|&size| PlaneMemory {
                        bytes: vec![0u8; size].into_boxed_slice(),
                        fd: None,
                    })
                    .collect::<PlaneSet>()
            })
            .collect();

        self.in_use.fetch_add(requested, Ordering::AcqRel);
        tracing::trace!("HeapAllocator: allocated {} x {} bytes", count, per_buffer);
        Ok(buffers)
    }

    fn free(&self, buffers: Vec<PlaneSet>) {
        let freed: usize = buffers
            .iter()
            .flat_map(|planes| planes.iter())
            .map(PlaneMemory::len)
            .sum();
        self.in_use.fetch_sub(freed, Ordering::AcqRel);
        tracing::trace!("HeapAllocator: freed {} bytes", freed);
    }

    fn register(&self, _buffer: &Buffer) -> Result<()> {
        self.registrations.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}
