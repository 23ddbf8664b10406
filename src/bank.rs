//! Per-slave register storage.
//!
//! Each slave owns two independent address spaces. A space is a set of
//! non-overlapping blocks; every access has to fall entirely inside one block.

use crate::error::{EctoError, Result};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegisterSpace {
    /// Read/write, function codes 0x03 and 0x10.
    Holding,
    /// Read-only for masters, function code 0x04.
    Input,
}

impl fmt::Display for RegisterSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisterSpace::Holding => write!(f, "holding"),
            RegisterSpace::Input => write!(f, "input"),
        }
    }
}

#[derive(Debug, Default, Clone)]
struct Space {
    // keyed by block start address
    blocks: BTreeMap<u16, Vec<u16>>,
}

impl Space {
    fn overlaps(&self, start: u32, end: u32) -> bool {
        self.blocks.iter().any(|(&block_start, values)| {
            let block_start = u32::from(block_start);
            let block_end = block_start + values.len() as u32;
            start < block_end && block_start < end
        })
    }

    /// Locate the block containing `[start, start + count)` and the offset into it.
    fn locate(&self, start: u16, count: u16) -> Option<(u16, usize)> {
        let (&block_start, values) = self.blocks.range(..=start).next_back()?;
        let offset = usize::from(start - block_start);
        if count == 0 || offset + usize::from(count) > values.len() {
            return None;
        }
        Some((block_start, offset))
    }
}

#[derive(Debug, Default, Clone)]
pub struct RegisterBank {
    holding: Space,
    input: Space,
    revision: u64,
}

impl RegisterBank {
    pub fn new() -> Self {
        Self::default()
    }

    fn space(&self, space: RegisterSpace) -> &Space {
        match space {
            RegisterSpace::Holding => &self.holding,
            RegisterSpace::Input => &self.input,
        }
    }

    fn space_mut(&mut self, space: RegisterSpace) -> &mut Space {
        match space {
            RegisterSpace::Holding => &mut self.holding,
            RegisterSpace::Input => &mut self.input,
        }
    }

    /// Declare a zero-initialised block of `length` registers at `start`.
    pub fn add_block(&mut self, space: RegisterSpace, start: u16, length: u16) -> Result<()> {
        let end = u32::from(start) + u32::from(length);
        if length == 0 || end > 0x1_0000 {
            return Err(EctoError::InvalidBlock { start, length });
        }
        let target = self.space_mut(space);
        if target.overlaps(u32::from(start), end) {
            return Err(EctoError::Overlap {
                space,
                start,
                length,
            });
        }
        target.blocks.insert(start, vec![0; usize::from(length)]);
        tracing::trace!(%space, start, length, "Added register block");
        Ok(())
    }

    pub fn read(&self, space: RegisterSpace, start: u16, count: u16) -> Result<Vec<u16>> {
        let target = self.space(space);
        let (block_start, offset) = target.locate(start, count).ok_or(EctoError::IllegalAddress {
            space,
            start,
            count,
        })?;
        let values = &target.blocks[&block_start];
        Ok(values[offset..offset + usize::from(count)].to_vec())
    }

    /// Master-facing write. Input registers are read-only on the bus.
    pub fn write(&mut self, space: RegisterSpace, start: u16, values: &[u16]) -> Result<()> {
        if space == RegisterSpace::Input {
            return Err(EctoError::IllegalFunction(0x10));
        }
        self.set_values(space, start, values)
    }

    /// Owner-side write, allowed in both spaces. This is how devices publish
    /// their state into input registers.
    pub fn set_values(&mut self, space: RegisterSpace, start: u16, values: &[u16]) -> Result<()> {
        let count = u16::try_from(values.len()).map_err(|_| EctoError::IllegalDataValue)?;
        let target = self.space_mut(space);
        let (block_start, offset) = target.locate(start, count).ok_or(EctoError::IllegalAddress {
            space,
            start,
            count,
        })?;
        if let Some(block) = target.blocks.get_mut(&block_start) {
            block[offset..offset + values.len()].copy_from_slice(values);
        }
        self.revision += 1;
        Ok(())
    }

    /// Number of successful mutations since the bank was created.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Declared blocks of a space as `(start, length)` pairs, in address order.
    pub fn blocks(&self, space: RegisterSpace) -> Vec<(u16, u16)> {
        self.space(space)
            .blocks
            .iter()
            .map(|(&start, values)| (start, values.len() as u16))
            .collect()
    }
}
