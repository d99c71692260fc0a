//! Per-batch ownership of tracked transfers.
//!
//! Every transfer admitted during a cycle lives in one [`BatchArena`] slot
//! until the completion drain takes it out. The slot index doubles as the
//! token handed to libcurl, so a finished-transfer notification maps straight
//! back to its owner. The arena is cleared in one step at the end of the
//! cycle, and only once no slot is occupied.

use crate::error::EngineError;

/// Slab of in-flight values addressed by token.
#[derive(Debug)]
pub struct BatchArena<T> {
    slots: Vec<Option<T>>,
    live: usize,
}

impl<T> Default for BatchArena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> BatchArena<T> {
    /// Create an empty arena.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            live: 0,
        }
    }

    /// Create an arena sized for one batch.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            live: 0,
        }
    }

    /// Token the next [`insert`](Self::insert) will return.
    #[must_use]
    pub fn next_token(&self) -> usize {
        self.slots.len()
    }

    /// Store `value` and return its token.
    ///
    /// Tokens are never reused within one batch.
    pub fn insert(&mut self, value: T) -> usize {
        let token = self.slots.len();
        self.slots.push(Some(value));
        self.live += 1;
        token
    }

    /// Borrow a live value.
    #[must_use]
    pub fn get(&self, token: usize) -> Option<&T> {
        self.slots.get(token).and_then(Option::as_ref)
    }

    /// Mutably borrow a live value.
    pub fn get_mut(&mut self, token: usize) -> Option<&mut T> {
        self.slots.get_mut(token).and_then(Option::as_mut)
    }

    /// Remove and return a live value.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::UnknownTransfer`] if the slot is empty or was
    /// never handed out.
    pub fn take(&mut self, token: usize) -> Result<T, EngineError> {
        let value = self
            .slots
            .get_mut(token)
            .and_then(Option::take)
            .ok_or(EngineError::UnknownTransfer(token))?;
        self.live -= 1;
        Ok(value)
    }

    /// Remove every live value, leaving the slots in place.
    pub fn drain(&mut self) -> Vec<T> {
        self.live = 0;
        self.slots.iter_mut().filter_map(Option::take).collect()
    }

    /// Number of values not yet taken.
    #[must_use]
    pub const fn live(&self) -> usize {
        self.live
    }

    /// Whether no value is live.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Release the batch in one step, keeping the allocation for the next one.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::ArenaInUse`] while any value is still live;
    /// the arena is left untouched in that case.
    pub fn reset(&mut self) -> Result<(), EngineError> {
        if self.live > 0 {
            return Err(EngineError::ArenaInUse(self.live));
        }
        self.slots.clear();
        Ok(())
    }
}
