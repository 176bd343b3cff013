//! Per-category lazy decoding state.

use crate::error::{OpenEphysError, Result};

/// Decoding state of one cached category.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum CacheState<T> {
    #[default]
    Uncomputed,
    Computed(T),
}

/// A value decoded on first access and kept afterwards.
///
/// Counts decoder invocations so callers can check that a category was
/// decoded at most once.
#[derive(Debug, Clone, PartialEq)]
pub struct Cached<T> {
    state: CacheState<T>,
    decodes: usize,
}

impl<T> Default for Cached<T> {
    fn default() -> Self {
        Self {
            state: CacheState::Uncomputed,
            decodes: 0,
        }
    }
}

impl<T> Cached<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_computed(&self) -> bool {
        matches!(self.state, CacheState::Computed(_))
    }

    /// Times the decoder has been invoked
    pub fn decode_count(&self) -> usize {
        self.decodes
    }

    pub fn get(&self) -> Option<&T> {
        match &self.state {
            CacheState::Computed(value) => Some(value),
            CacheState::Uncomputed => None,
        }
    }

    pub fn get_mut(&mut self) -> Option<&mut T> {
        match &mut self.state {
            CacheState::Computed(value) => Some(value),
            CacheState::Uncomputed => None,
        }
    }

    /// Returns the cached value, running `decode` first if needed.
    ///
    /// A failed decode leaves the state `Uncomputed`.
    pub fn get_or_try_init<F>(&mut self, decode: F) -> Result<&mut T>
    where
        F: FnOnce() -> Result<T>,
    {
        if !self.is_computed() {
            self.decodes += 1;
            self.state = CacheState::Computed(decode()?);
        }
        self.get_mut()
            .ok_or_else(|| OpenEphysError::format("cache entry missing after decode"))
    }
}
