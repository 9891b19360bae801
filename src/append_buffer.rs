//! Append-only block storage
//!
//! Elements are stored in fixed-capacity blocks. Appending never moves an
//! element that was already stored: when the tail block is full a new block
//! is started instead of growing and copying.

/// Default number of elements per block
pub const DEFAULT_BLOCK_SIZE: usize = 32 * 1024;

/// Smallest accepted block size; requests below this are raised to it
pub const MIN_BLOCK_SIZE: usize = 1024;

/// Growable sequence of elements backed by a list of fixed-size blocks.
///
/// The buffer is movable but not clonable. Moving the contents out with
/// [`AppendOnlyBuffer::take`] leaves an empty buffer behind with the same
/// block size.
#[derive(Debug)]
pub struct AppendOnlyBuffer<T> {
    block_size: usize,
    len: usize,
    blocks: Vec<Vec<T>>,
}

impl<T> AppendOnlyBuffer<T> {
    /// Create a buffer with [`DEFAULT_BLOCK_SIZE`] elements per block
    pub fn new() -> Self {
        Self::with_block_size(DEFAULT_BLOCK_SIZE)
    }

    /// Create a buffer; `block_size` is clamped to at least [`MIN_BLOCK_SIZE`]
    pub fn with_block_size(block_size: usize) -> Self {
        let block_size = block_size.max(MIN_BLOCK_SIZE);
        Self {
            block_size,
            len: 0,
            blocks: vec![Vec::with_capacity(block_size)],
        }
    }

    /// Drop every element and shrink back to a single empty block
    pub fn clear(&mut self) {
        self.blocks.truncate(1);
        match self.blocks.first_mut() {
            Some(first) => first.clear(),
            None => self.blocks.push(Vec::with_capacity(self.block_size)),
        }
        self.len = 0;
    }

    /// Append an element, starting a new block when the tail block is full
    pub fn append(&mut self, value: T) {
        let needs_block = self
            .blocks
            .last()
            .map_or(true, |block| block.len() >= self.block_size);
        if needs_block {
            self.blocks.push(Vec::with_capacity(self.block_size));
        }
        if let Some(tail) = self.blocks.last_mut() {
            tail.push(value);
            self.len += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// The most recently appended element, if any
    pub fn last(&self) -> Option<&T> {
        self.blocks.last().and_then(|block| block.last())
    }

    /// Mutable access to the most recently appended element, if any
    pub fn last_mut(&mut self) -> Option<&mut T> {
        self.blocks.last_mut().and_then(|block| block.last_mut())
    }

    /// Iterate over the stored blocks in append order
    pub fn blocks(&self) -> impl Iterator<Item = &[T]> {
        self.blocks.iter().map(Vec::as_slice)
    }

    /// Iterate over the stored elements in append order
    pub fn iter(&self) -> std::iter::Flatten<std::slice::Iter<'_, Vec<T>>> {
        self.blocks.iter().flatten()
    }

    /// Move the contents out, leaving an empty buffer with the same block size
    pub fn take(&mut self) -> Self {
        let block_size = self.block_size;
        std::mem::replace(self, Self::with_block_size(block_size))
    }
}

impl<T> Default for AppendOnlyBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> IntoIterator for AppendOnlyBuffer<T> {
    type Item = T;
    type IntoIter = std::iter::Flatten<std::vec::IntoIter<Vec<T>>>;

    fn into_iter(self) -> Self::IntoIter {
        self.blocks.into_iter().flatten()
    }
}

impl<'a, T> IntoIterator for &'a AppendOnlyBuffer<T> {
    type Item = &'a T;
    type IntoIter = std::iter::Flatten<std::slice::Iter<'a, Vec<T>>>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
