//! Per-hart consumable counts: the instruction count, branch history
//! bits, and taken/not-taken run lengths a message leaves behind for
//! the instruction walk to spend.

use crate::Error;

/// Which consumable is current. At most one of the branch-outcome
/// consumables (history, taken, not-taken) may be live at a time;
/// `i_cnt` coexists with any of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountKind {
    None,
    ICnt,
    History,
    Taken,
    NotTaken,
}

/// The consumable record of one hart.
#[derive(Debug, Clone, Default)]
pub struct Count {
    i_cnt: u32,
    history: u64,
    /// Index of the next history bit to yield; -1 when exhausted. The
    /// most-significant set bit of `history` is a stop sentinel and is
    /// never yielded.
    hist_bit: i32,
    taken: u32,
    not_taken: u32,
}

impl Count {
    pub fn new() -> Count {
        Count {
            i_cnt: 0,
            history: 0,
            hist_bit: -1,
            taken: 0,
            not_taken: 0,
        }
    }

    pub fn clear(&mut self) {
        *self = Count::new();
    }

    /// The highest-priority non-empty consumable.
    pub fn current_kind(&self) -> CountKind {
        if self.hist_bit >= 0 {
            CountKind::History
        } else if self.taken > 0 {
            CountKind::Taken
        } else if self.not_taken > 0 {
            CountKind::NotTaken
        } else if self.i_cnt > 0 {
            CountKind::ICnt
        } else {
            CountKind::None
        }
    }

    pub fn exhausted(&self) -> bool {
        self.current_kind() == CountKind::None
    }

    pub fn i_cnt(&self) -> u32 {
        self.i_cnt
    }

    /// Accumulates an instruction count. Messages may stack counts
    /// when a RESOURCEFULL overflow preceded the event message.
    pub fn add_i_cnt(&mut self, n: u32) {
        self.i_cnt += n;
    }

    fn branch_counts_empty(&self) -> bool {
        self.hist_bit < 0 && self.taken == 0 && self.not_taken == 0
    }

    /// Installs a history bitstring. `bits` must contain the stop
    /// sentinel; a bare `1` carries zero outcomes and is ignored.
    pub fn set_history(&mut self, bits: u64) -> Result<(), Error> {
        if !self.branch_counts_empty() {
            return Err(Error::Internal("history set while branch counts pending"));
        }
        if bits == 0 {
            return Err(Error::Internal("history value without a stop bit"));
        }
        self.history = bits;
        self.hist_bit = 63 - bits.leading_zeros() as i32 - 1;
        Ok(())
    }

    pub fn set_taken(&mut self, n: u32) -> Result<(), Error> {
        if !self.branch_counts_empty() {
            return Err(Error::Internal(
                "taken count set while branch counts pending",
            ));
        }
        self.taken = n;
        Ok(())
    }

    pub fn set_not_taken(&mut self, n: u32) -> Result<(), Error> {
        if !self.branch_counts_empty() {
            return Err(Error::Internal(
                "not-taken count set while branch counts pending",
            ));
        }
        self.not_taken = n;
        Ok(())
    }

    pub fn consume_i_cnt(&mut self, n: u32) -> Result<(), Error> {
        if self.i_cnt < n {
            return Err(Error::Internal("i-cnt consumed past zero"));
        }
        self.i_cnt -= n;
        Ok(())
    }

    /// Yields the next branch outcome bit (true = taken) and whether
    /// the history is now exhausted. The stop sentinel itself is never
    /// yielded.
    pub fn consume_history(&mut self) -> Result<(bool, bool), Error> {
        if self.hist_bit < 0 {
            return Err(Error::Internal("history consumed past its stop bit"));
        }
        let taken = self.history & (1 << self.hist_bit) != 0;
        self.hist_bit -= 1;
        Ok((taken, self.hist_bit < 0))
    }

    pub fn consume_taken(&mut self) -> Result<(), Error> {
        if self.taken == 0 {
            return Err(Error::Internal("taken count consumed past zero"));
        }
        self.taken -= 1;
        Ok(())
    }

    pub fn consume_not_taken(&mut self) -> Result<(), Error> {
        if self.not_taken == 0 {
            return Err(Error::Internal("not-taken count consumed past zero"));
        }
        self.not_taken -= 1;
        Ok(())
    }
}

#[cfg(test)]
mod counts {
    use super::*;

    #[test]
    fn priority_order() {
        let mut c = Count::new();
        assert_eq!(c.current_kind(), CountKind::None);
        c.add_i_cnt(3);
        assert_eq!(c.current_kind(), CountKind::ICnt);
        c.set_not_taken(1).unwrap();
        assert_eq!(c.current_kind(), CountKind::NotTaken);
        c.consume_not_taken().unwrap();
        c.set_taken(1).unwrap();
        assert_eq!(c.current_kind(), CountKind::Taken);
        c.consume_taken().unwrap();
        c.set_history(0b101).unwrap();
        assert_eq!(c.current_kind(), CountKind::History);
    }

    #[test]
    fn only_one_branch_consumable() {
        let mut c = Count::new();
        c.set_history(0b10).unwrap();
        assert!(c.set_taken(4).is_err());
        assert!(c.set_not_taken(4).is_err());
        assert!(c.set_history(0b11).is_err());
    }

    // For any history h >= 1, exactly floor(log2(h)) outcome bits are
    // yielded; the sentinel stays put.
    #[test]
    fn history_stop_bit() {
        for h in [0b1u64, 0b10, 0b1011, 0x8000_0000_0000_0001] {
            let expect = 63 - h.leading_zeros();
            let mut c = Count::new();
            if h == 1 {
                // A bare stop bit has no outcomes to install.
                assert!(c.set_history(h).is_err() || c.current_kind() == CountKind::None);
                continue;
            }
            c.set_history(h).unwrap();
            let mut yielded = 0;
            while c.current_kind() == CountKind::History {
                c.consume_history().unwrap();
                yielded += 1;
            }
            assert_eq!(yielded, expect);
            assert!(c.consume_history().is_err());
        }
    }

    #[test]
    fn history_yields_msb_first() {
        let mut c = Count::new();
        // Outcomes below the stop bit at position 3: 0b011, consumed
        // from bit 2 down.
        c.set_history(0b1011).unwrap();
        assert_eq!(c.consume_history().unwrap(), (false, false));
        assert_eq!(c.consume_history().unwrap(), (true, false));
        assert_eq!(c.consume_history().unwrap(), (true, true));
    }
}
