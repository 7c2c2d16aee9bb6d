use bitflags::bitflags;

bitflags! {
    /// Type bits for an [`Extent`]. Absence of both bits means
    /// "allocated data".
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ExtentType: u32 {
        /// Range is not backed by storage.
        const HOLE = 0b01;
        /// Range reads as zero.
        const ZERO = 0b10;
    }
}

/// Bits outside [`ExtentType::all`] are reserved and rejected by
/// [`ExtentSet::add`].
const RESERVED_MASK: u32 = !ExtentType::all().bits();

/// A contiguous byte range annotated with allocation/zero status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub offset: u64,
    pub length: u64,
    pub ty: ExtentType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Ok,
    /// The set is now full; the add was truncated (or, if the frontier
    /// was already at `end`, entirely dropped) and further adds are
    /// no-ops.
    Full,
}

#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum ExtentError {
    #[error("invalid range: end must be greater than start")]
    InvalidRange,
    #[error("out-of-order offset")]
    OutOfOrder,
    #[error("zero-length extent")]
    ZeroLength,
    #[error("reserved type bits set")]
    ReservedBits,
    #[error("offset beyond the set's window end")]
    Invalid,
}

/// An ordered, coalescing sequence of extent records describing
/// allocation/hole/zero status of byte ranges within `[start, end)`.
#[derive(Debug, Clone)]
pub struct ExtentSet {
    start: u64,
    end: u64,
    frontier: u64,
    full: bool,
    records: Vec<Extent>,
}

impl ExtentSet {
    pub fn new(start: u64, end: u64) -> Result<Self, ExtentError> {
        if end <= start {
            return Err(ExtentError::InvalidRange);
        }
        Ok(Self { start, end, frontier: start, full: false, records: Vec::new() })
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn is_full(&self) -> bool {
        self.full
    }

    pub fn count(&self) -> usize {
        self.records.len()
    }

    pub fn get(&self, i: usize) -> Option<&Extent> {
        self.records.get(i)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Extent> {
        self.records.iter()
    }

    fn push_or_merge(&mut self, offset: u64, length: u64, ty: ExtentType) {
        if let Some(last) = self.records.last_mut() {
            if last.ty == ty && last.offset + last.length == offset {
                last.length += length;
                return;
            }
        }
        self.records.push(Extent { offset, length, ty });
    }

    /// Adds a record. See the type-level doc for the coalescing and
    /// truncation rules.
    pub fn add(&mut self, offset: u64, length: u64, ty: ExtentType) -> Result<AddOutcome, ExtentError> {
        if self.full {
            return Ok(AddOutcome::Full);
        }
        if offset < self.frontier {
            return Err(ExtentError::OutOfOrder);
        }
        if length == 0 {
            return Err(ExtentError::ZeroLength);
        }
        if ty.bits() & RESERVED_MASK != 0 {
            return Err(ExtentError::ReservedBits);
        }
        if offset > self.end {
            return Err(ExtentError::Invalid);
        }

        if offset > self.frontier {
            let gap = offset - self.frontier;
            self.push_or_merge(self.frontier, gap, ExtentType::empty());
            self.frontier = offset;
        }

        let remaining = self.end - self.frontier;
        let (clamped_len, becomes_full) = if length >= remaining {
            (remaining, true)
        } else {
            (length, false)
        };

        if clamped_len > 0 {
            self.push_or_merge(self.frontier, clamped_len, ty);
            self.frontier += clamped_len;
        }

        if becomes_full {
            self.full = true;
            Ok(AddOutcome::Full)
        } else {
            Ok(AddOutcome::Ok)
        }
    }

    /// Drops ranges outside `[start, end)`, clamping any record that
    /// straddles the new boundary. Used by filters that translate
    /// offsets (e.g. `offset`) to re-window a successor's extents.
    pub fn trim_to(&mut self, start: u64, end: u64) {
        self.records.retain_mut(|rec| {
            let rec_end = rec.offset + rec.length;
            if rec_end <= start || rec.offset >= end {
                return false;
            }
            let new_start = rec.offset.max(start);
            let new_end = rec_end.min(end);
            rec.offset = new_start;
            rec.length = new_end - new_start;
            true
        });
        self.start = start;
        self.end = end;
        self.frontier = self.frontier.clamp(start, end);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_rejects_empty_range() {
        assert_eq!(ExtentSet::new(10, 10).unwrap_err(), ExtentError::InvalidRange);
        assert_eq!(ExtentSet::new(10, 5).unwrap_err(), ExtentError::InvalidRange);
    }

    #[test]
    fn coalesces_adjacent_same_type() {
        let mut set = ExtentSet::new(0, 64 * 1024).unwrap();
        set.add(0, 16 * 1024, ExtentType::HOLE | ExtentType::ZERO).unwrap();
        set.add(16 * 1024, 16 * 1024, ExtentType::HOLE | ExtentType::ZERO).unwrap();
        set.add(32 * 1024, 32 * 1024, ExtentType::empty()).unwrap();

        assert_eq!(set.count(), 2);
        assert_eq!(set.get(0), Some(&Extent { offset: 0, length: 32 * 1024, ty: ExtentType::HOLE | ExtentType::ZERO }));
        assert_eq!(set.get(1), Some(&Extent { offset: 32 * 1024, length: 32 * 1024, ty: ExtentType::empty() }));
    }

    #[test]
    fn gap_is_filled_with_allocated_data() {
        let mut set = ExtentSet::new(0, 100).unwrap();
        set.add(50, 10, ExtentType::ZERO).unwrap();
        assert_eq!(set.count(), 2);
        assert_eq!(set.get(0), Some(&Extent { offset: 0, length: 50, ty: ExtentType::empty() }));
        assert_eq!(set.get(1), Some(&Extent { offset: 50, length: 10, ty: ExtentType::ZERO }));
    }

    #[test]
    fn out_of_order_is_rejected() {
        let mut set = ExtentSet::new(0, 100).unwrap();
        set.add(50, 10, ExtentType::empty()).unwrap();
        assert_eq!(set.add(40, 5, ExtentType::empty()).unwrap_err(), ExtentError::OutOfOrder);
    }

    #[test]
    fn zero_length_is_rejected() {
        let mut set = ExtentSet::new(0, 100).unwrap();
        assert_eq!(set.add(0, 0, ExtentType::empty()).unwrap_err(), ExtentError::ZeroLength);
    }

    #[test]
    fn reserved_bits_are_rejected() {
        let mut set = ExtentSet::new(0, 100).unwrap();
        let bogus = ExtentType::from_bits_retain(0b100);
        assert_eq!(set.add(0, 10, bogus).unwrap_err(), ExtentError::ReservedBits);
    }

    #[test]
    fn overflow_truncates_and_marks_full() {
        let mut set = ExtentSet::new(0, 100).unwrap();
        let outcome = set.add(90, 50, ExtentType::empty()).unwrap();
        assert_eq!(outcome, AddOutcome::Full);
        assert!(set.is_full());
        assert_eq!(set.get(0), Some(&Extent { offset: 90, length: 10, ty: ExtentType::empty() }));

        let outcome2 = set.add(100, 1, ExtentType::empty()).unwrap();
        assert_eq!(outcome2, AddOutcome::Full);
        assert_eq!(set.count(), 1);
    }

    #[test]
    fn invariant_adjacent_records_differ_in_type_and_are_contiguous() {
        let mut set = ExtentSet::new(0, 48 * 1024).unwrap();
        set.add(0, 16 * 1024, ExtentType::ZERO).unwrap();
        set.add(16 * 1024, 16 * 1024, ExtentType::empty()).unwrap();
        set.add(32 * 1024, 16 * 1024, ExtentType::ZERO).unwrap();

        for w in (0..set.count()).collect::<Vec<_>>().windows(2) {
            let a = set.get(w[0]).unwrap();
            let b = set.get(w[1]).unwrap();
            assert_eq!(a.offset + a.length, b.offset);
            assert_ne!(a.ty, b.ty);
        }
    }

    #[test]
    fn offset_beyond_end_is_rejected_without_underflow() {
        let mut set = ExtentSet::new(0, 100).unwrap();
        assert_eq!(set.add(150, 10, ExtentType::empty()).unwrap_err(), ExtentError::Invalid);
    }

    #[test]
    fn trim_to_clamps_straddling_records() {
        let mut set = ExtentSet::new(0, 100).unwrap();
        set.add(0, 100, ExtentType::ZERO).unwrap();
        set.trim_to(10, 50);
        assert_eq!(set.count(), 1);
        assert_eq!(set.get(0), Some(&Extent { offset: 10, length: 40, ty: ExtentType::ZERO }));
    }
}
