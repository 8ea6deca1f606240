//! Shared pool of reusable byte buffers.
//!
//! Buffers are grouped into power-of-two size classes and kept in a small
//! number of independently locked stripes, so concurrent rent/release from many
//! threads rarely contends on the same lock. A thread always returns buffers to
//! its home stripe and rents from it first, falling back to `try_lock` on the
//! other stripes before allocating.
//!
//! # Security invariants
//!
//! - Every [`Sensitivity::Sensitive`] buffer has its used region plus
//!   [`SAFETY_MARGIN`] bytes overwritten with zeros before the storage is reused.
//! - Release happens in exactly one place: [`PooledBuffer`]'s drop path. Callers
//!   cannot forget it, and early returns, `?` and dropped futures all release.

pub mod buffer;

pub use buffer::{PooledBuffer, Sensitivity};

use std::{
    cell::Cell,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, OnceLock,
    },
};

use parking_lot::Mutex;
use zeroize::Zeroize;

/// Smallest size class (16 bytes).
const MIN_CLASS_SHIFT: u32 = 4;

/// Largest pooled size class (16 MiB). Bigger buffers are allocated and freed directly.
const MAX_CLASS_SHIFT: u32 = 24;

const CLASS_COUNT: usize = (MAX_CLASS_SHIFT - MIN_CLASS_SHIFT + 1) as usize;

/// Free buffers kept per size class per stripe.
const MAX_RETAINED_PER_CLASS: usize = 8;

/// Extra bytes past the high-water mark cleared on release.
pub const SAFETY_MARGIN: usize = 64;

static NEXT_STRIPE_HINT: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static STRIPE_HINT: Cell<Option<usize>> = const { Cell::new(None) };
}

fn stripe_hint() -> usize {
    STRIPE_HINT.with(|hint| match hint.get() {
        Some(h) => h,
        None => {
            let h = NEXT_STRIPE_HINT.fetch_add(1, Ordering::Relaxed);
            hint.set(Some(h));
            h
        }
    })
}

/// Size class index for a requested capacity, or `None` if it is too large to pool.
fn class_of(min_capacity: usize) -> Option<usize> {
    let size = min_capacity.max(1 << MIN_CLASS_SHIFT).checked_next_power_of_two()?;
    let shift = size.trailing_zeros();
    (shift <= MAX_CLASS_SHIFT).then(|| (shift - MIN_CLASS_SHIFT) as usize)
}

fn class_size(class: usize) -> usize {
    1 << (class as u32 + MIN_CLASS_SHIFT)
}

struct Stripe {
    classes: Mutex<Vec<Vec<Vec<u8>>>>,
}

impl Stripe {
    fn new() -> Self {
        Self {
            classes: Mutex::new((0..CLASS_COUNT).map(|_| Vec::new()).collect()),
        }
    }
}

struct PoolInner {
    stripes: Box<[Stripe]>,
    outstanding: AtomicUsize,
}

/// Thread-safe, cheaply cloneable handle to a buffer pool.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("stripes", &self.inner.stripes.len())
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

impl BufferPool {
    /// Create a pool with `stripes` independently locked partitions (at least one).
    pub fn new(stripes: usize) -> Self {
        let stripes = (0..stripes.max(1)).map(|_| Stripe::new()).collect();
        Self {
            inner: Arc::new(PoolInner {
                stripes,
                outstanding: AtomicUsize::new(0),
            }),
        }
    }

    /// The process-wide pool, striped by available parallelism.
    pub fn shared() -> BufferPool {
        static SHARED: OnceLock<BufferPool> = OnceLock::new();
        SHARED
            .get_or_init(|| {
                let n = std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(4);
                BufferPool::new(n)
            })
            .clone()
    }

    /// Rent a buffer that may hold plaintext or key-derived bytes.
    ///
    /// The returned buffer is empty with a capacity of at least `min_capacity`.
    pub fn rent(&self, min_capacity: usize) -> PooledBuffer {
        self.rent_with(min_capacity, Sensitivity::Sensitive)
    }

    /// Rent a buffer that will never hold sensitive bytes; it is not cleared on release.
    pub fn rent_non_sensitive(&self, min_capacity: usize) -> PooledBuffer {
        self.rent_with(min_capacity, Sensitivity::NonSensitive)
    }

    fn rent_with(&self, min_capacity: usize, sensitivity: Sensitivity) -> PooledBuffer {
        let storage = match class_of(min_capacity) {
            Some(class) => self
                .take_free(class)
                .unwrap_or_else(|| vec![0u8; class_size(class)]),
            None => vec![0u8; min_capacity],
        };
        self.inner.outstanding.fetch_add(1, Ordering::AcqRel);
        PooledBuffer::from_parts(storage, sensitivity, self.clone())
    }

    /// Release a buffer back to the pool. Equivalent to dropping it.
    pub fn release(&self, buffer: PooledBuffer) {
        buffer.release();
    }

    /// Number of buffers rented and not yet released.
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::Acquire)
    }

    fn home_stripe(&self) -> usize {
        stripe_hint() % self.inner.stripes.len()
    }

    fn take_free(&self, class: usize) -> Option<Vec<u8>> {
        let stripes = &self.inner.stripes;
        let home = self.home_stripe();
        if let Some(buf) = stripes[home].classes.lock()[class].pop() {
            return Some(buf);
        }
        for offset in 1..stripes.len() {
            let stripe = &stripes[(home + offset) % stripes.len()];
            if let Some(mut classes) = stripe.classes.try_lock() {
                if let Some(buf) = classes[class].pop() {
                    return Some(buf);
                }
            }
        }
        None
    }

    /// Single release path: clear, account, and return storage.
    pub(crate) fn give_back(&self, mut storage: Vec<u8>, high_water: usize, sensitivity: Sensitivity) {
        if sensitivity == Sensitivity::Sensitive {
            let end = high_water.saturating_add(SAFETY_MARGIN).min(storage.len());
            storage[..end].zeroize();
        }
        self.inner.outstanding.fetch_sub(1, Ordering::AcqRel);

        let len = storage.len();
        if !len.is_power_of_two() {
            return;
        }
        if let Some(class) = class_of(len) {
            if class_size(class) != len {
                return;
            }
            let mut classes = self.inner.stripes[self.home_stripe()].classes.lock();
            if classes[class].len() < MAX_RETAINED_PER_CLASS {
                classes[class].push(storage);
            }
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        BufferPool::shared()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_rounding() {
        assert_eq!(class_of(0), Some(0));
        assert_eq!(class_size(class_of(1).unwrap()), 16);
        assert_eq!(class_size(class_of(17).unwrap()), 32);
        assert_eq!(class_size(class_of(4096).unwrap()), 4096);
        assert_eq!(class_of((1 << MAX_CLASS_SHIFT) + 1), None);
    }

    #[test]
    fn rent_meets_minimum_capacity() {
        let pool = BufferPool::new(1);
        let buf = pool.rent(100);
        assert!(buf.capacity() >= 100);
        assert!(buf.is_empty());
        assert_eq!(pool.outstanding(), 1);
        drop(buf);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn oversized_buffers_are_not_pooled() {
        let pool = BufferPool::new(1);
        let big = pool.rent((1 << MAX_CLASS_SHIFT) + 10);
        assert_eq!(big.capacity(), (1 << MAX_CLASS_SHIFT) + 10);
        big.release();
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn concurrent_rent_release_balances() {
        let pool = BufferPool::new(4);
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    for i in 0..500 {
                        let mut buf = pool.rent(32 + (i % 200));
                        buf.extend_from_slice(format!("thread-{t}-iter-{i}").as_bytes());
                        assert!(buf.starts_with(b"thread-"));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(pool.outstanding(), 0);
    }
}
