//! Scratch arenas for per-head temporaries.
//!
//! A `Scratch` is a growable `f32` bump arena: each call to `carve` hands
//! out several disjoint, zero-filled segments at once and invalidates the
//! previous ones (enforced by the borrow checker). A `ScratchPool` lends
//! arenas to concurrent head computations, one arena per borrower.

use std::ops::{Deref, DerefMut};

use parking_lot::Mutex;

/// Segment starts are rounded to this many elements from the start of the
/// arena. The arena itself only has `f32` alignment.
const SCRATCH_ALIGN: usize = 16;

/// Reusable bump arena over `f32`.
#[derive(Debug, Default)]
pub struct Scratch {
    buf: Vec<f32>,
    high_water: usize,
}

impl Scratch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-size the arena for `elems` elements.
    pub fn with_capacity(elems: usize) -> Self {
        Self { buf: vec![0.0; elems], high_water: 0 }
    }

    /// Split the arena into `N` zeroed segments of the requested lengths,
    /// growing it if needed.
    pub fn carve<const N: usize>(&mut self, lens: [usize; N]) -> [&mut [f32]; N] {
        let total: usize = lens.iter().map(|&n| align_up(n, SCRATCH_ALIGN)).sum();
        if self.buf.len() < total {
            self.buf.resize(total, 0.0);
        }
        self.high_water = self.high_water.max(total);

        let mut rest: &mut [f32] = &mut self.buf[..total];
        std::array::from_fn(|i| {
            let (seg, tail) =
                std::mem::take(&mut rest).split_at_mut(align_up(lens[i], SCRATCH_ALIGN));
            rest = tail;
            let (seg, _) = seg.split_at_mut(lens[i]);
            seg.fill(0.0);
            seg
        })
    }

    /// Elements currently backing the arena.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Largest single `carve` seen so far.
    pub fn high_water(&self) -> usize {
        self.high_water
    }
}

fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

/// Free list of arenas shared by the workers of one orchestrator.
#[derive(Debug, Default)]
pub struct ScratchPool {
    free: Mutex<Vec<Scratch>>,
}

impl ScratchPool {
    /// Pool pre-filled with `slots` empty arenas; more are created on demand.
    pub fn new(slots: usize) -> Self {
        Self {
            free: Mutex::new((0..slots).map(|_| Scratch::new()).collect()),
        }
    }

    /// Borrow an arena exclusively until the guard drops.
    pub fn checkout(&self) -> ScratchGuard<'_> {
        let scratch = self.free.lock().pop().unwrap_or_default();
        ScratchGuard { pool: self, scratch: Some(scratch) }
    }

    /// Arenas currently sitting in the pool.
    pub fn available(&self) -> usize {
        self.free.lock().len()
    }

    /// Total elements held by idle arenas.
    pub fn retained_elems(&self) -> usize {
        self.free.lock().iter().map(Scratch::capacity).sum()
    }
}

/// An arena on loan from a [`ScratchPool`]; returned on drop.
#[derive(Debug)]
pub struct ScratchGuard<'a> {
    pool: &'a ScratchPool,
    scratch: Option<Scratch>,
}

impl Deref for ScratchGuard<'_> {
    type Target = Scratch;

    fn deref(&self) -> &Scratch {
        self.scratch.as_ref().expect("scratch present until drop")
    }
}

impl DerefMut for ScratchGuard<'_> {
    fn deref_mut(&mut self) -> &mut Scratch {
        self.scratch.as_mut().expect("scratch present until drop")
    }
}

impl Drop for ScratchGuard<'_> {
    fn drop(&mut self) {
        if let Some(scratch) = self.scratch.take() {
            self.pool.free.lock().push(scratch);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_carve_lengths() {
        let mut s = Scratch::new();
        let [a, b, c] = s.carve([3, 17, 0]);
        assert_eq!((a.len(), b.len(), c.len()), (3, 17, 0));
        assert!(s.capacity() >= 3 + 17);
    }

    #[test]
    fn test_carve_zeroes_reused_memory() {
        let mut s = Scratch::with_capacity(64);
        {
            let [a, b] = s.carve([10, 10]);
            a.fill(7.0);
            b.fill(9.0);
        }
        let [a, b] = s.carve([10, 10]);
        assert!(a.iter().chain(b.iter()).all(|&v| v == 0.0));
    }

    #[test]
    fn test_segments_aligned_and_disjoint() {
        let mut s = Scratch::new();
        let [a, b] = s.carve([5, 5]);
        a.fill(1.0);
        b.fill(2.0);
        let a_start = a.as_ptr() as usize;
        let b_start = b.as_ptr() as usize;
        assert_eq!((b_start - a_start) % (SCRATCH_ALIGN * 4), 0);
        assert!(a.iter().all(|&v| v == 1.0));
    }

    #[test]
    fn test_high_water() {
        let mut s = Scratch::new();
        s.carve([100]);
        s.carve([10]);
        assert_eq!(s.high_water(), 112);
    }

    #[test]
    fn test_pool_lends_and_returns() {
        let pool = ScratchPool::new(2);
        assert_eq!(pool.available(), 2);
        {
            let mut g1 = pool.checkout();
            let _g2 = pool.checkout();
            let _g3 = pool.checkout(); // created on demand
            assert_eq!(pool.available(), 0);
            g1.carve([32]);
        }
        assert_eq!(pool.available(), 3);
        assert!(pool.retained_elems() >= 32);
    }
}
