//! Local accounting of free and taken addresses.
//!
//! The space tracks two sorted, disjoint sets of ranges: the ranges the ring
//! currently assigns to this peer, and the subset of their addresses that is
//! still free. Everything here is pure bookkeeping; the ring decides what we
//! own, the space decides which exact address a container gets.

use std::fmt;

use tracing::debug;

use cadastre_core::{Addr, Count, Range};

/// Smallest chunk worth donating: the first and last addresses of a subnet
/// are excluded from allocation, so anything under four is useless to the
/// receiver.
pub const MIN_SUBNET_SIZE: Count = 4;

/// Why a claim failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceError {
    /// The address is not inside any range we own.
    NotOurs,
    /// The address is ours but already handed out.
    AlreadyTaken,
}

impl fmt::Display for SpaceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpaceError::NotOurs => write!(f, "address is not in any owned range"),
            SpaceError::AlreadyTaken => write!(f, "address is already taken"),
        }
    }
}

impl std::error::Error for SpaceError {}

/// Free/taken accounting over the ranges we own.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Space {
    /// Ranges the ring says are ours. Sorted, disjoint, non-adjacent.
    ours: Vec<Range>,
    /// Free addresses, always a subset of `ours`. Sorted, disjoint.
    free: Vec<Range>,
}

impl Space {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Ranges we own, for the ring/space agreement check.
    #[must_use]
    pub fn owned_ranges(&self) -> Vec<Range> {
        self.ours.clone()
    }

    /// Add freshly acquired ranges; every address in them starts out free.
    pub fn add_ranges(&mut self, ranges: &[Range]) {
        self.ours.extend_from_slice(ranges);
        self.free.extend_from_slice(ranges);
        normalize(&mut self.ours);
        normalize(&mut self.free);
    }

    /// Reconcile with the ring's current view of our ownership: newly
    /// acquired ranges arrive all-free, ranges no longer ours disappear
    /// together with their free records, and what we keep preserves its
    /// taken addresses.
    pub fn update_ranges(&mut self, new_ranges: &[Range]) {
        let mut new_ours = new_ranges.to_vec();
        normalize(&mut new_ours);

        let taken = subtract(&self.ours, &self.free);
        let still_taken = intersect(&taken, &new_ours);
        self.free = subtract(&new_ours, &still_taken);
        self.ours = new_ours;
    }

    /// Drop everything, after the ring handed our territory to an heir.
    pub fn clear(&mut self) {
        self.ours.clear();
        self.free.clear();
    }

    /// Mark one address as taken.
    ///
    /// # Errors
    /// [`SpaceError::NotOurs`] outside our ranges, otherwise
    /// [`SpaceError::AlreadyTaken`] if it is not free.
    pub fn claim(&mut self, addr: Addr) -> Result<(), SpaceError> {
        if !self.ours.iter().any(|r| r.contains(addr)) {
            return Err(SpaceError::NotOurs);
        }
        let one = Range::with_size(addr, 1);
        let before = self.num_free_total();
        self.free = subtract(&self.free, &[one]);
        if self.num_free_total() == before {
            return Err(SpaceError::AlreadyTaken);
        }
        Ok(())
    }

    /// Hand out the best free address within `within`, if any.
    ///
    /// Among our ranges that can serve the request, the one with the most
    /// free addresses overall is picked, to spread load away from nearly
    /// full ranges; inside it the lowest usable address wins.
    pub fn allocate_in(&mut self, within: Range) -> Option<Addr> {
        let candidate = self
            .ours
            .iter()
            .filter(|owned| owned.overlaps(&within))
            .map(|owned| (self.num_free(*owned), *owned))
            .filter(|(free, owned)| {
                *free > 0 && !intersect(&self.free, &[owned.intersection(&within).unwrap()]).is_empty()
            })
            .max_by(|a, b| a.0.cmp(&b.0).then(b.1.start.cmp(&a.1.start)))
            .map(|(_, owned)| owned)?;

        let slot = candidate.intersection(&within).unwrap();
        let addr = intersect(&self.free, &[slot]).first()?.start;
        self.claim(addr).ok()?;
        Some(addr)
    }

    /// Return a taken address to the free set. No-op (false) for addresses
    /// we do not hold, e.g. in a range donated away since.
    pub fn free(&mut self, addr: Addr) -> bool {
        if !self.ours.iter().any(|r| r.contains(addr)) {
            return false;
        }
        let one = Range::with_size(addr, 1);
        if !intersect(&self.free, &[one]).is_empty() {
            return false;
        }
        self.free.push(one);
        normalize(&mut self.free);
        true
    }

    /// Give away our largest fully-free chunk that overlaps `wanted`,
    /// removing it from both the free set and our ownership. Chunks under
    /// [`MIN_SUBNET_SIZE`] are kept: they are useless to the receiver.
    pub fn donate(&mut self, wanted: Range) -> Option<Range> {
        let chunk = intersect(&self.free, &[wanted])
            .into_iter()
            .filter(|c| c.len() >= MIN_SUBNET_SIZE)
            .max_by(|a, b| a.len().cmp(&b.len()).then(b.start.cmp(&a.start)))?;

        self.free = subtract(&self.free, &[chunk]);
        self.ours = subtract(&self.ours, &[chunk]);
        debug!(%chunk, "donated chunk");
        Some(chunk)
    }

    /// Free addresses within `r`.
    #[must_use]
    pub fn num_free(&self, r: Range) -> Count {
        intersect(&self.free, &[r]).iter().map(Range::len).sum()
    }

    /// Free addresses across everything we own.
    #[must_use]
    pub fn num_free_total(&self) -> Count {
        self.free.iter().map(Range::len).sum()
    }
}

/// Sort and fold overlapping or adjacent ranges, dropping empty ones.
fn normalize(ranges: &mut Vec<Range>) {
    ranges.retain(|r| !r.is_empty());
    ranges.sort_unstable_by_key(|r| r.start);
    let mut folded: Vec<Range> = Vec::with_capacity(ranges.len());
    for r in ranges.drain(..) {
        match folded.last_mut() {
            Some(last) if r.start <= last.end => last.end = last.end.max(r.end),
            _ => folded.push(r),
        }
    }
    *ranges = folded;
}

/// Set difference `a - b` over normalized range lists.
fn subtract(a: &[Range], b: &[Range]) -> Vec<Range> {
    let mut out = Vec::with_capacity(a.len());
    for r in a {
        let mut cursor = r.start;
        for cut in b {
            if cut.end <= cursor || cut.start >= r.end {
                continue;
            }
            if cut.start > cursor {
                out.push(Range::new(cursor, cut.start));
            }
            cursor = cursor.max(cut.end);
        }
        if cursor < r.end {
            out.push(Range::new(cursor, r.end));
        }
    }
    out
}

/// Set intersection over normalized range lists.
fn intersect(a: &[Range], b: &[Range]) -> Vec<Range> {
    let mut out = Vec::new();
    for r in a {
        for s in b {
            if let Some(common) = r.intersection(s) {
                out.push(common);
            }
        }
    }
    out.sort_unstable_by_key(|r| r.start);
    out
}
