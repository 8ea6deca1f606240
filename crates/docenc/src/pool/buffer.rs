//! [`PooledBuffer`]: move-only handle to a rented, growable byte region.

use std::{
    io,
    ops::{Deref, DerefMut},
};

use tracing::trace;

use super::BufferPool;

/// Whether a buffer may hold plaintext or key-derived bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sensitivity {
    /// Cleared on release. The default for every rent.
    Sensitive,
    /// Never holds secrets (e.g. base64 of ciphertext); skipped by the clearing pass.
    NonSensitive,
}

/// A byte buffer rented from a [`BufferPool`].
///
/// The logical length (`len`) is tracked separately from the physical
/// capacity. The buffer also remembers the highest offset ever written so the
/// release pass clears everything that might have held data, even after
/// `clear()` or `consume_front()`.
///
/// Dropping the buffer releases it. [`PooledBuffer::release`] does the same
/// explicitly; either way the storage goes back exactly once.
pub struct PooledBuffer {
    storage: Vec<u8>,
    len: usize,
    high_water: usize,
    sensitivity: Sensitivity,
    pool: Option<BufferPool>,
}

impl PooledBuffer {
    pub(super) fn from_parts(storage: Vec<u8>, sensitivity: Sensitivity, pool: BufferPool) -> Self {
        Self {
            storage,
            len: 0,
            high_water: 0,
            sensitivity,
            pool: Some(pool),
        }
    }

    /// Physical capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Logical length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn sensitivity(&self) -> Sensitivity {
        self.sensitivity
    }

    /// The unused tail of the buffer, for writing in place before [`PooledBuffer::advance`].
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.storage[self.len..]
    }

    /// Mark `n` more bytes of the spare region as used.
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds the spare capacity.
    pub fn advance(&mut self, n: usize) {
        assert!(n <= self.storage.len() - self.len, "advance past capacity");
        self.len += n;
        self.high_water = self.high_water.max(self.len);
    }

    /// Shorten the logical length. No effect if `len` is not smaller.
    pub fn truncate(&mut self, len: usize) {
        self.len = self.len.min(len);
    }

    /// Reset the logical length to zero. Storage is cleared on release, not here.
    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Drop the first `n` used bytes, shifting the rest to the front.
    pub fn consume_front(&mut self, n: usize) {
        let n = n.min(self.len);
        if n == 0 {
            return;
        }
        self.storage.copy_within(n..self.len, 0);
        self.len -= n;
    }

    /// Ensure `additional` more bytes fit without another grow.
    pub fn reserve(&mut self, additional: usize) {
        let needed = self.len.saturating_add(additional);
        if needed > self.capacity() {
            self.grow(needed);
        }
    }

    /// Grow to at least `min_capacity`, doubling at minimum.
    ///
    /// Rents a larger region, copies the live bytes forward and releases the
    /// old region through the normal clearing path.
    pub fn grow(&mut self, min_capacity: usize) {
        if min_capacity <= self.capacity() {
            return;
        }
        let Some(pool) = self.pool.clone() else {
            return;
        };
        let target = min_capacity.max(self.capacity().saturating_mul(2));
        let mut next = pool.rent_with(target, self.sensitivity);
        next.storage[..self.len].copy_from_slice(&self.storage[..self.len]);
        next.len = self.len;
        next.high_water = self.len;
        trace!(from = self.capacity(), to = next.capacity(), "pooled buffer grown");
        std::mem::swap(self, &mut next);
        // `next` now owns the old region and releases it on drop.
    }

    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.reserve(bytes.len());
        let start = self.len;
        self.storage[start..start + bytes.len()].copy_from_slice(bytes);
        self.advance(bytes.len());
    }

    pub fn push(&mut self, byte: u8) {
        self.extend_from_slice(&[byte]);
    }

    /// Release the buffer back to its pool.
    pub fn release(mut self) {
        self.return_to_pool();
    }

    /// Idempotent: the second and later calls do nothing.
    fn return_to_pool(&mut self) {
        if let Some(pool) = self.pool.take() {
            let storage = std::mem::take(&mut self.storage);
            pool.give_back(storage, self.high_water, self.sensitivity);
            self.len = 0;
            self.high_water = 0;
        }
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        self.return_to_pool();
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.storage[..self.len]
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.storage[..self.len]
    }
}

impl io::Write for PooledBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Contents may be plaintext.
        f.debug_struct("PooledBuffer")
            .field("len", &self.len)
            .field("capacity", &self.capacity())
            .field("sensitivity", &self.sensitivity)
            .finish()
    }
}
