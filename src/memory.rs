use thiserror::Error;

use crate::{Address, Byte, Word};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MemoryError {
    #[error("address 0x{address:08x} (+{len}) is outside of physical memory")]
    OutOfBounds { address: Address, len: usize },
    #[error("unsupported access width of {0} bytes")]
    BadWidth(usize),
}

pub type Result<T> = std::result::Result<T, MemoryError>;

pub struct Memory {
    data: Vec<Byte>,
}

impl Memory {
    pub const SIZE: usize = 16 * 1024 * 1024;

    pub fn new() -> Self {
        Self {
            data: vec![0; Self::SIZE],
        }
    }

    fn range(address: Address, len: usize) -> Result<std::ops::Range<usize>> {
        if !matches!(len, 1 | 2 | 4) {
            return Err(MemoryError::BadWidth(len));
        }
        let start = address as usize;
        match start.checked_add(len) {
            Some(end) if end <= Self::SIZE => Ok(start..end),
            _ => Err(MemoryError::OutOfBounds { address, len }),
        }
    }

    /// Little-endian read of `len` bytes (1, 2 or 4), zero-extended.
    pub fn read(&self, address: Address, len: usize) -> Result<Word> {
        let range = Self::range(address, len)?;
        Ok(self.data[range]
            .iter()
            .rev()
            .fold(0, |word, &byte| (word << 8) | byte as Word))
    }

    pub fn read_byte(&self, address: Address) -> Result<Byte> {
        self.read(address, 1).map(|word| word as Byte)
    }

    pub fn write(&mut self, address: Address, len: usize, mut data: Word) -> Result<()> {
        let range = Self::range(address, len)?;
        for byte in &mut self.data[range] {
            *byte = data as Byte;
            data >>= 8;
        }
        Ok(())
    }

    pub fn load(&mut self, address: Address, bytes: &[Byte]) -> Result<()> {
        let start = address as usize;
        let end = start
            .checked_add(bytes.len())
            .filter(|&end| end <= Self::SIZE)
            .ok_or(MemoryError::OutOfBounds {
                address,
                len: bytes.len(),
            })?;
        self.data[start..end].copy_from_slice(bytes);
        Ok(())
    }
}

impl<Index> std::ops::Index<Index> for Memory
where
    Index: std::slice::SliceIndex<[Byte]>,
{
    type Output = Index::Output;

    fn index(&self, index: Index) -> &Self::Output {
        &self.data[index]
    }
}
