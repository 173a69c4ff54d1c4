//! Size-Class Policy - Length to Tentative to Committed Class
//!
//! Every rounded request length below [`MAX_CLASS_LEN`] is assigned a
//! *tentative* class the first time it is seen. A tentative class is
//! observed with a 7-bit saturating counter; once the counter crosses
//! [`CLASS_THRESHOLD`] the class is *promoted* to a committed class,
//! which is the only kind backed by slab regions. Everything that is
//! unknown, still counting, or saturated out of table space falls back
//! to the buddy engine — saturation is a policy outcome, not an error.
//!
//! Rounding follows weak alignment: a 4-byte block is aligned 4; above
//! 16 bytes lengths round to 16-byte multiples. The rounded length maps
//! to a dense table key (`alen` itself for tiny sizes, `alen / 16 + 16`
//! above), so the whole policy is a few array lookups.

use crate::config::{CLASS_THRESHOLD, MAX_CLASS, MAX_CLASS_LEN, MAX_TCLASS, NO_CLASS, NO_TCLASS};
use crate::util::align::align_up;

/// Rounded cell lengths for requests of up to 8 bytes (weak alignment).
const MINI_CLASS: [u16; 9] = [0, 2, 2, 4, 4, 8, 8, 8, 8];

/// Upper bound of [`class_key`] plus one; sizes every class-key table.
pub const MAX_CLASS_KEY: usize = MAX_CLASS_LEN / 16 + 17;

/// Gross cell length serving a request of `len` bytes.
///
/// `len` must be in `1..MAX_CLASS_LEN`.
#[inline]
pub fn rounded_len(len: usize) -> usize {
    if len <= 8 {
        MINI_CLASS[len] as usize
    } else if len <= 16 {
        16
    } else {
        align_up(len, 16)
    }
}

/// Natural alignment of the cell serving a request of `len` bytes.
#[inline]
pub fn natural_align(len: usize) -> usize {
    if len <= 8 {
        MINI_CLASS[len] as usize
    } else {
        16
    }
}

/// Dense table key of a rounded length.
#[inline]
pub fn class_key(alen: usize) -> usize {
    if alen <= 16 {
        alen
    } else {
        (alen >> 4) + 16
    }
}

/// Outcome of running the policy for one request.
pub enum ClassDecision {
    /// The key has a committed class; serve from its bin or slab ring.
    Committed(u16),
    /// The key was promoted just now. The caller creates the first slab
    /// region for the new class; the triggering request itself is still
    /// served by the buddy path, the slab serves from the next one.
    Promote(u16),
    /// Unknown, still counting, or tables saturated: buddy path.
    Fallback,
}

/// Per-heap class tables.
pub struct ClassTable {
    len2tclas: [u16; MAX_CLASS_KEY],
    tclas2len: [u16; MAX_TCLASS],
    tclas2clas: [u16; MAX_TCLASS],
    size_count: [u8; MAX_TCLASS],
    clas2len: [u16; MAX_CLASS],
    tclas_cnt: u16,
    clas_cnt: u16,
}

impl ClassTable {
    pub fn new() -> Self {
        Self {
            len2tclas: [NO_TCLASS; MAX_CLASS_KEY],
            tclas2len: [0; MAX_TCLASS],
            tclas2clas: [NO_CLASS; MAX_TCLASS],
            size_count: [0; MAX_TCLASS],
            clas2len: [0; MAX_CLASS],
            tclas_cnt: 0,
            clas_cnt: 0,
        }
    }

    /// Run the policy for one rounded length.
    pub fn classify(&mut self, alen: usize) -> ClassDecision {
        let key = class_key(alen);
        let mut tclas = self.len2tclas[key];
        if tclas == NO_TCLASS {
            if (self.tclas_cnt as usize) >= MAX_TCLASS {
                return ClassDecision::Fallback;
            }
            tclas = self.tclas_cnt;
            self.len2tclas[key] = tclas;
            self.tclas2len[tclas as usize] = key as u16;
            self.tclas_cnt += 1;
            log::debug!("new tentative class {} for len {}", tclas, alen);
        }

        let clas = self.tclas2clas[tclas as usize];
        if clas != NO_CLASS {
            return ClassDecision::Committed(clas);
        }
        if (self.clas_cnt as usize) >= MAX_CLASS {
            return ClassDecision::Fallback;
        }

        let cnt = self.size_count[tclas as usize].min(0x7e) + 1;
        self.size_count[tclas as usize] = cnt;
        if cnt > CLASS_THRESHOLD {
            let clas = self.clas_cnt;
            self.tclas2clas[tclas as usize] = clas;
            self.clas2len[clas as usize] = alen as u16;
            self.clas_cnt += 1;
            log::debug!("promote class {} for len {}", clas, alen);
            return ClassDecision::Promote(clas);
        }
        ClassDecision::Fallback
    }

    /// Cell length of a committed class.
    #[inline]
    pub fn class_len(&self, clas: u16) -> usize {
        self.clas2len[clas as usize] as usize
    }

    pub fn class_count(&self) -> u16 {
        self.clas_cnt
    }

    pub fn tclass_count(&self) -> u16 {
        self.tclas_cnt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rounding_weak_alignment() {
        assert_eq!(rounded_len(1), 2);
        assert_eq!(rounded_len(3), 4);
        assert_eq!(rounded_len(8), 8);
        assert_eq!(rounded_len(9), 16);
        assert_eq!(rounded_len(17), 32);
        assert_eq!(rounded_len(48), 48);
        assert_eq!(rounded_len(4095), 4096);
    }

    #[test]
    fn test_class_key_dense() {
        assert_eq!(class_key(8), 8);
        assert_eq!(class_key(16), 16);
        assert_eq!(class_key(32), 18);
        assert_eq!(class_key(4096), 272);
        assert!(class_key(rounded_len(MAX_CLASS_LEN - 1)) < MAX_CLASS_KEY);
    }

    #[test]
    fn test_promotion_on_threshold() {
        let mut t = ClassTable::new();
        // With CLASS_THRESHOLD = 0 the first sighting promotes.
        match t.classify(48) {
            ClassDecision::Promote(c) => {
                assert_eq!(t.class_len(c), 48);
            }
            _ => panic!("first sighting should promote"),
        }
        // The second sighting is served committed.
        match t.classify(48) {
            ClassDecision::Committed(_) => {}
            _ => panic!("second sighting should be committed"),
        }
        assert_eq!(t.class_count(), 1);
        assert_eq!(t.tclass_count(), 1);
    }

    #[test]
    fn test_same_key_shares_class() {
        let mut t = ClassTable::new();
        t.classify(48);
        let c1 = match t.classify(48) {
            ClassDecision::Committed(c) => c,
            _ => panic!(),
        };
        // 33..=48 all round to 48 and share the key.
        let c2 = match t.classify(rounded_len(33)) {
            ClassDecision::Committed(c) => c,
            _ => panic!(),
        };
        assert_eq!(c1, c2);
    }

    #[test]
    fn test_distinct_keys_distinct_classes() {
        let mut t = ClassTable::new();
        t.classify(16);
        t.classify(32);
        assert_eq!(t.tclass_count(), 2);
        assert_eq!(t.class_count(), 2);
    }
}
