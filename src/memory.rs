// MIT License - Copyright (c) 2021 TJForc
// Cached device memory blocks

use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;

/// An immutable view of every cached block at one point in time.
#[derive(Debug, Clone, Default)]
pub struct MemorySnapshot {
    blocks: HashMap<u16, Arc<[u8]>>,
    refreshed_at: Option<Instant>,
}

impl MemorySnapshot {
    pub fn block(&self, block: u16) -> Option<&[u8]> {
        self.blocks.get(&block).map(|b| &b[..])
    }

    /// Bytes `range` of `block`, or `None` if the block is missing or too short.
    pub fn read_bytes(&self, block: u16, range: Range<usize>) -> Option<&[u8]> {
        self.block(block).and_then(|b| b.get(range))
    }

    /// Bit `bit` counted from the LSB of byte 0.
    pub fn read_bit(&self, block: u16, bit: usize) -> Option<bool> {
        let byte = *self.block(block)?.get(bit / 8)?;
        Some(byte & (1 << (bit % 8)) != 0)
    }

    /// Join ranges from two blocks into one contiguous span.
    pub fn read_span(&self, first: (u16, Range<usize>), second: (u16, Range<usize>)) -> Option<Vec<u8>> {
        let mut span = self.read_bytes(first.0, first.1)?.to_vec();
        span.extend_from_slice(self.read_bytes(second.0, second.1)?);
        Some(span)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// When the most recent block was stored.
    pub fn refreshed_at(&self) -> Option<Instant> {
        self.refreshed_at
    }
}

/// Cache of a device's addressable memory, keyed by block number.
///
/// Writers publish a new snapshot with every update, so a reader holding a
/// snapshot never observes a half-written block.
#[derive(Debug, Default)]
pub struct MemoryMap {
    current: ArcSwap<MemorySnapshot>,
}

impl MemoryMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// The current snapshot. Reads against it are mutually consistent.
    pub fn snapshot(&self) -> Arc<MemorySnapshot> {
        self.current.load_full()
    }

    /// Replace one block atomically.
    pub fn replace_block(&self, block: u16, data: impl Into<Arc<[u8]>>) {
        self.replace_blocks([(block, data.into())]);
    }

    /// Replace several blocks in a single swap.
    pub fn replace_blocks(&self, blocks: impl IntoIterator<Item = (u16, Arc<[u8]>)>) {
        let updates: Vec<(u16, Arc<[u8]>)> = blocks.into_iter().collect();
        if updates.is_empty() {
            return;
        }
        let now = Instant::now();
        self.current.rcu(|current| {
            let mut next = MemorySnapshot::clone(current);
            for (block, data) in &updates {
                next.blocks.insert(*block, data.clone());
            }
            next.refreshed_at = Some(now);
            next
        });
    }

    pub fn block(&self, block: u16) -> Option<Arc<[u8]>> {
        self.current.load().blocks.get(&block).cloned()
    }

    pub fn read_bytes(&self, block: u16, range: Range<usize>) -> Option<Vec<u8>> {
        self.current.load().read_bytes(block, range).map(<[u8]>::to_vec)
    }

    pub fn read_bit(&self, block: u16, bit: usize) -> Option<bool> {
        self.current.load().read_bit(block, bit)
    }

    pub fn len(&self) -> usize {
        self.current.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.current.load().is_empty()
    }

    /// Forget every block (used when the session goes offline).
    pub fn clear(&self) {
        self.current.store(Arc::new(MemorySnapshot::default()));
    }
}
