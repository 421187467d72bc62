//! The last few blocks of the canonical chain, used to detect reorgs.
use std::collections::VecDeque;

use alloy_primitives::B256;
use error_stack::{Result, ResultExt};

use crate::provider::models::LightBlock;

#[derive(Debug)]
pub struct ChainError;

/// A window of canonical blocks, oldest first.
///
/// Every block's parent hash is the hash of the block before it, and the
/// window never holds more than `depth` blocks.
#[derive(Debug, Clone)]
pub struct ReorgWindow {
    blocks: VecDeque<LightBlock>,
    depth: usize,
}

impl ReorgWindow {
    pub fn new(root: LightBlock, depth: usize) -> Self {
        let mut blocks = VecDeque::with_capacity(depth);
        blocks.push_back(root);
        Self {
            blocks,
            depth: depth.max(1),
        }
    }

    pub fn tip(&self) -> &LightBlock {
        // The window is never empty.
        &self.blocks[self.blocks.len() - 1]
    }

    pub fn oldest(&self) -> &LightBlock {
        &self.blocks[0]
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn contains(&self, hash: &B256) -> bool {
        self.get(hash).is_some()
    }

    pub fn get(&self, hash: &B256) -> Option<&LightBlock> {
        self.blocks.iter().rev().find(|block| block.hash == *hash)
    }

    pub fn get_by_number(&self, number: u64) -> Option<&LightBlock> {
        let offset = number.checked_sub(self.oldest().number)?;
        self.blocks.get(offset as usize)
    }

    pub fn blocks(&self) -> impl Iterator<Item = &LightBlock> {
        self.blocks.iter()
    }

    pub fn can_grow(&self, block: &LightBlock) -> bool {
        let tip = self.tip();
        block.parent_hash == tip.hash && block.number == tip.number + 1
    }

    /// Append a block on top of the tip, dropping the oldest blocks past `depth`.
    pub fn grow(&mut self, block: LightBlock) -> Result<(), ChainError> {
        if !self.can_grow(&block) {
            return Err(ChainError)
                .attach_printable("block does not extend the chain tip")
                .attach_printable_lazy(|| format!("tip: {}", self.tip()))
                .attach_printable_lazy(|| format!("block: {block}"));
        }

        self.blocks.push_back(block);
        while self.blocks.len() > self.depth {
            self.blocks.pop_front();
        }

        Ok(())
    }

    /// Remove all blocks after `hash`, returning them oldest first.
    pub fn shrink_to(&mut self, hash: &B256) -> Result<Vec<LightBlock>, ChainError> {
        let position = self
            .blocks
            .iter()
            .position(|block| block.hash == *hash)
            .ok_or(ChainError)
            .attach_printable("block not found in the chain")
            .attach_printable_lazy(|| format!("hash: {hash:#x}"))?;

        Ok(self.blocks.split_off(position + 1).into())
    }
}

impl error_stack::Context for ChainError {}

impl std::fmt::Display for ChainError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "chain error")
    }
}
