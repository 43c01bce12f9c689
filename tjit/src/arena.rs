//! A typed, chunked, arena.
//!
//! All of the IR for the trace currently being recorded lives in [Arena]s. Elements are
//! addressed by a dedicated index type, never by reference, so nothing can dangle across a
//! [Arena::reset]. Resetting keeps the first chunk's allocation so that recording the next trace
//! normally needs no fresh memory at all.

use crate::compile::CompilationError;
use std::{
    marker::PhantomData,
    mem,
    ops::{Index, IndexMut},
};

/// The number of bytes we aim for each chunk to occupy.
const CHUNK_BYTES: usize = 4096;

pub(crate) struct Arena<I, T> {
    chunks: Vec<Vec<T>>,
    /// How many elements fit in each chunk?
    chunk_len: usize,
    len: usize,
    phantom: PhantomData<I>,
}

impl<I, T> Arena<I, T>
where
    I: Copy + TryFrom<usize, Error = CompilationError>,
    usize: From<I>,
{
    pub(crate) fn new() -> Self {
        let chunk_len = (CHUNK_BYTES / mem::size_of::<T>().max(1)).max(1);
        Self {
            chunks: vec![Vec::with_capacity(chunk_len)],
            chunk_len,
            len: 0,
            phantom: PhantomData,
        }
    }

    /// Push `x`, returning its index, or an error if the index type can not represent it.
    pub(crate) fn push(&mut self, x: T) -> Result<I, CompilationError> {
        let idx = I::try_from(self.len)?;
        if self.chunks.last().map(|c| c.len()) == Some(self.chunk_len) {
            self.chunks.push(Vec::with_capacity(self.chunk_len));
        }
        // There is always at least one chunk.
        let last = self.chunks.len() - 1;
        self.chunks[last].push(x);
        self.len += 1;
        Ok(idx)
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Drop every element. The first chunk's capacity is kept; every other chunk is freed.
    pub(crate) fn reset(&mut self) {
        self.chunks.truncate(1);
        self.chunks[0].clear();
        self.len = 0;
    }

    /// How many chunks are currently allocated?
    #[cfg(test)]
    pub(crate) fn num_chunks(&self) -> usize {
        self.chunks.len()
    }

    /// Iterate over all indices in push order.
    pub(crate) fn indices(&self) -> impl DoubleEndedIterator<Item = I> {
        // Every index below `len` was successfully converted by `push`.
        (0..self.len).map(|x| I::try_from(x).unwrap())
    }
}

impl<I, T> Index<I> for Arena<I, T>
where
    usize: From<I>,
{
    type Output = T;

    fn index(&self, idx: I) -> &Self::Output {
        let i = usize::from(idx);
        &self.chunks[i / self.chunk_len][i % self.chunk_len]
    }
}

impl<I, T> IndexMut<I> for Arena<I, T>
where
    usize: From<I>,
{
    fn index_mut(&mut self, idx: I) -> &mut Self::Output {
        let i = usize::from(idx);
        &mut self.chunks[i / self.chunk_len][i % self.chunk_len]
    }
}
