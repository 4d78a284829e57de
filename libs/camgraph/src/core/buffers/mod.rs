// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

mod allocator;
mod handle;
mod manager;
mod plane;
mod pools;

pub use allocator::{BufferAllocator, HeapAllocator};
pub use handle::{BufferHandle, BufferRef};
pub use manager::{
    AcquireHint, AllocationPolicy, BufferManager, BufferPoolStats, BufferPosition, PoolGeometry,
};
pub use plane::{Buffer, BufferPlane, META_PLANE_SIZE, PlaneLayout, PlaneMemory, PlaneSet};
pub use pools::{BufferPoolConfig, BufferPools};
