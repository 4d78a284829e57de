// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use std::fmt;
use std::sync::Arc;

use super::manager::ReturnKind;
use super::{Buffer, BufferManager, BufferPosition};
use crate::core::Result;

/// Owning token for one acquired pool index.
///
/// Exactly one handle exists per acquired index, so a buffer can only be
/// returned once through it. `release` / `cancel` consume the handle; a handle
/// dropped without either is cancelled and logged. Each handle carries the
/// generation it was acquired under, so one that outlived a pool reset is
/// refused instead of freeing whoever holds the index now.
pub struct BufferHandle {
    pool: Arc<BufferManager>,
    buffer: Buffer,
    generation: u64,
    settled: bool,
}

impl BufferHandle {
    pub(super) fn new(pool: Arc<BufferManager>, buffer: Buffer, generation: u64) -> Self {
        Self {
            pool,
            buffer,
            generation,
            settled: false,
        }
    }

    pub fn index(&self) -> usize {
        self.buffer.index
    }

    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    pub fn pool(&self) -> &Arc<BufferManager> {
        &self.pool
    }

    /// Where this handle's buffer is. `None` if the pool was reset under it.
    pub fn position(&self) -> Option<BufferPosition> {
        self.pool.leased_position(self.buffer.index, self.generation)
    }

    pub fn pool_name(&self) -> &str {
        self.pool.name()
    }

    /// Non-owning view for downstream consumers.
    pub fn view(&self) -> BufferRef {
        BufferRef {
            pool: Arc::from(self.pool.name()),
            index: self.buffer.index,
        }
    }

    pub fn mark_in_hardware(&self) -> Result<()> {
        self.pool.move_leased(
            self.buffer.index,
            self.generation,
            BufferPosition::InHal,
            BufferPosition::InHardware,
        )
    }

    pub fn mark_returned(&self) -> Result<()> {
        self.pool.move_leased(
            self.buffer.index,
            self.generation,
            BufferPosition::InHardware,
            BufferPosition::InHal,
        )
    }

    pub fn release(mut self) -> Result<()> {
        self.settled = true;
        self.pool
            .settle(self.buffer.index, self.generation, ReturnKind::Release)
    }

    pub fn cancel(mut self) -> Result<()> {
        self.settled = true;
        self.pool
            .settle(self.buffer.index, self.generation, ReturnKind::Cancel)
    }
}

impl Drop for BufferHandle {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        tracing::warn!(
            "[{}] buffer {} dropped without release, cancelling",
            self.pool.name(),
            self.buffer.index
        );
        if let Err(e) = self
            .pool
            .settle(self.buffer.index, self.generation, ReturnKind::Cancel)
        {
            tracing::warn!("[{}] cancel on drop failed: {}", self.pool.name(), e);
        }
    }
}

impl fmt::Debug for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferHandle")
            .field("pool", &self.pool.name())
            .field("index", &self.buffer.index)
            .field("generation", &self.generation)
            .finish()
    }
}

/// Cloneable, non-owning reference to a pooled buffer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BufferRef {
    pub pool: Arc<str>,
    pub index: usize,
}

impl fmt::Display for BufferRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.pool, self.index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::buffers::{AcquireHint, HeapAllocator, PlaneLayout, PoolGeometry};

    fn pool() -> Arc<BufferManager> {
        let pool = BufferManager::new("handles", Arc::new(HeapAllocator::new()));
        pool.configure(PoolGeometry::new(PlaneLayout::single(64, 8), 2, 2))
            .unwrap();
        pool.allocate().unwrap();
        pool
    }

    #[test]
    fn test_drop_without_release_cancels() {
        let pool = pool();
        {
            let _handle = pool.acquire(AcquireHint::Next).unwrap();
            assert_eq!(pool.available_count(), 1);
        }
        assert_eq!(pool.available_count(), 2);
        assert_eq!(pool.stats().cancelled, 1);
    }

    #[test]
    fn test_view_names_pool_and_index() {
        let pool = pool();
        let handle = pool.acquire(AcquireHint::Prefer(1)).unwrap();
        let view = handle.view();
        assert_eq!(&*view.pool, "handles");
        assert_eq!(view.index, 1);
        assert_eq!(view.to_string(), "handles[1]");
        handle.release().unwrap();
        assert_eq!(pool.position(1), Some(BufferPosition::Free));
    }

    #[test]
    fn test_position_follows_generation() {
        let pool = pool();
        let handle = pool.acquire(AcquireHint::Next).unwrap();
        assert_eq!(handle.position(), Some(BufferPosition::InHal));
        handle.mark_in_hardware().unwrap();
        assert_eq!(handle.position(), Some(BufferPosition::InHardware));

        pool.reset();
        assert_eq!(handle.position(), None);
        assert!(handle.cancel().is_err());
        assert_eq!(pool.available_count(), 2);
    }
}
