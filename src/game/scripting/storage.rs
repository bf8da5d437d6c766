//! Variable stores and array bookkeeping.
//!
//! Every store maps a 64-bit uid (symbol id in the low half, array index in
//! the high half) to a value. Zero and the empty string are never stored:
//! writing them deletes the entry. Each store additionally keeps, per symbol,
//! the sorted set of occupied indexes so array operations do not have to scan
//! the whole store. A scalar is simply index 0 of its array.

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::rc::Rc;

use super::symbol::SymId;

/// Largest usable array index plus one.
pub const SCRIPT_MAX_ARRAYSIZE: u32 = u32::MAX;

pub type Uid = u64;

#[inline]
pub fn reference_uid(id: SymId, index: u32) -> Uid {
    u64::from(id) | (u64::from(index) << 32)
}

#[inline]
pub fn uid_id(uid: Uid) -> SymId {
    uid as u32
}

#[inline]
pub fn uid_index(uid: Uid) -> u32 {
    (uid >> 32) as u32
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegValue {
    Num(i64),
    Str(String),
}

impl RegValue {
    pub fn is_empty(&self) -> bool {
        match self {
            RegValue::Num(n) => *n == 0,
            RegValue::Str(s) => s.is_empty(),
        }
    }

    pub fn empty(is_string: bool) -> RegValue {
        if is_string {
            RegValue::Str(String::new())
        } else {
            RegValue::Num(0)
        }
    }
}

/// A key/value variable store with array index tracking.
#[derive(Debug, Default, Clone)]
pub struct RegDb {
    vars: HashMap<Uid, RegValue>,
    arrays: HashMap<SymId, BTreeSet<u32>>,
}

/// Store shared between a script and the frames that reference it.
pub type RegDbRef = Rc<RefCell<RegDb>>;

pub fn new_regdb_ref() -> RegDbRef {
    Rc::new(RefCell::new(RegDb::default()))
}

impl RegDb {
    pub fn get(&self, uid: Uid) -> Option<&RegValue> {
        self.vars.get(&uid)
    }

    pub fn get_num(&self, uid: Uid) -> i64 {
        match self.vars.get(&uid) {
            Some(RegValue::Num(n)) => *n,
            Some(RegValue::Str(s)) => s.trim().parse().unwrap_or(0),
            None => 0,
        }
    }

    pub fn get_str(&self, uid: Uid) -> String {
        match self.vars.get(&uid) {
            Some(RegValue::Str(s)) => s.clone(),
            Some(RegValue::Num(n)) => n.to_string(),
            None => String::new(),
        }
    }

    pub fn set(&mut self, uid: Uid, value: RegValue) {
        if value.is_empty() {
            self.remove(uid);
            return;
        }
        self.vars.insert(uid, value);
        self.arrays.entry(uid_id(uid)).or_default().insert(uid_index(uid));
    }

    pub fn set_num(&mut self, uid: Uid, value: i64) {
        self.set(uid, RegValue::Num(value));
    }

    pub fn set_str(&mut self, uid: Uid, value: &str) {
        self.set(uid, RegValue::Str(value.to_string()));
    }

    pub fn remove(&mut self, uid: Uid) {
        self.vars.remove(&uid);
        let id = uid_id(uid);
        if let Some(set) = self.arrays.get_mut(&id) {
            set.remove(&uid_index(uid));
            if set.is_empty() {
                self.arrays.remove(&id);
            }
        }
    }

    /// Highest occupied index plus one.
    pub fn array_size(&self, id: SymId) -> u32 {
        self.arrays
            .get(&id)
            .and_then(|set| set.iter().next_back())
            .map(|&last| last.saturating_add(1))
            .unwrap_or(0)
    }

    /// Number of occupied indexes.
    pub fn array_count(&self, id: SymId) -> usize {
        self.arrays.get(&id).map(BTreeSet::len).unwrap_or(0)
    }

    /// Occupied indexes in ascending order.
    pub fn array_indexes(&self, id: SymId) -> Vec<u32> {
        self.arrays
            .get(&id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Occupied indexes at or above `start`.
    pub fn array_indexes_from(&self, id: SymId, start: u32) -> Vec<u32> {
        self.arrays
            .get(&id)
            .map(|set| set.range(start..).copied().collect())
            .unwrap_or_default()
    }

    pub fn has_array(&self, id: SymId) -> bool {
        self.arrays.contains_key(&id)
    }

    pub fn clear_array(&mut self, id: SymId) {
        if let Some(set) = self.arrays.remove(&id) {
            for index in set {
                self.vars.remove(&reference_uid(id, index));
            }
        }
    }

    /// Drops every variable whose symbol matches `pred`.
    pub fn retain_ids(&mut self, mut keep: impl FnMut(SymId) -> bool) {
        self.vars.retain(|uid, _| keep(uid_id(*uid)));
        self.arrays.retain(|id, _| keep(*id));
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn clear(&mut self) {
        self.vars.clear();
        self.arrays.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (Uid, &RegValue)> {
        self.vars.iter().map(|(uid, v)| (*uid, v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uid_packing() {
        let uid = reference_uid(77, 5);
        assert_eq!(uid_id(uid), 77);
        assert_eq!(uid_index(uid), 5);
        assert_eq!(reference_uid(77, 0), 77);
        let last = reference_uid(SymId::MAX, SCRIPT_MAX_ARRAYSIZE - 1);
        assert_eq!(uid_index(last), u32::MAX - 1);
    }

    #[test]
    fn test_empty_values_are_removed() {
        let mut db = RegDb::default();
        db.set_num(reference_uid(3, 0), 9);
        db.set_str(reference_uid(4, 0), "x");
        assert_eq!(db.len(), 2);

        db.set_num(reference_uid(3, 0), 0);
        db.set_str(reference_uid(4, 0), "");
        assert!(db.is_empty());
        assert!(!db.has_array(3));
        assert!(!db.has_array(4));
    }

    #[test]
    fn test_array_size_is_highest_index_plus_one() {
        let mut db = RegDb::default();
        db.set_num(reference_uid(10, 0), 1);
        db.set_num(reference_uid(10, 7), 1);
        assert_eq!(db.array_size(10), 8);
        assert_eq!(db.array_count(10), 2);

        db.set_num(reference_uid(10, 7), 0);
        assert_eq!(db.array_size(10), 1);

        db.set_num(reference_uid(10, 0), 0);
        assert_eq!(db.array_size(10), 0);
    }

    #[test]
    fn test_index_zero_is_an_ordinary_index() {
        let mut db = RegDb::default();
        db.set_num(reference_uid(5, 2), 3);
        assert_eq!(db.array_indexes(5), vec![2]);
        db.set_num(reference_uid(5, 0), 1);
        assert_eq!(db.array_indexes(5), vec![0, 2]);
        assert_eq!(db.array_indexes_from(5, 1), vec![2]);
    }

    #[test]
    fn test_clear_array() {
        let mut db = RegDb::default();
        for i in 0..4 {
            db.set_num(reference_uid(8, i), i64::from(i) + 1);
        }
        db.set_num(reference_uid(9, 0), 42);
        db.clear_array(8);
        assert_eq!(db.array_size(8), 0);
        assert_eq!(db.get_num(reference_uid(9, 0)), 42);
        assert_eq!(db.len(), 1);
    }

    #[test]
    fn test_cross_type_reads() {
        let mut db = RegDb::default();
        db.set_str(reference_uid(1, 0), "12");
        db.set_num(reference_uid(2, 0), 34);
        assert_eq!(db.get_num(reference_uid(1, 0)), 12);
        assert_eq!(db.get_str(reference_uid(2, 0)), "34");
        assert_eq!(db.get_str(reference_uid(3, 0)), "");
    }
}
