//! Coalesced-chain engine over the raw slot arrays.
//!
//! [`Slots`] is a cheap view of one region: typed pointers into the
//! slot arrays plus the shared counters. The accessor methods do plain
//! (non-atomic) reads and writes, so every call site must hold the
//! affected slot's line lock or one of the exclusive gates; the chain
//! operations at the bottom additionally restructure chains and require
//! full exclusivity (both gates).
//!
//! Chains never coalesce across homes: inserting a key whose home slot
//! is occupied by a foreign entry evicts that entry to a free slot, so
//! a chain rooted at `h` only ever contains keys hashing to `h`. Delete
//! relies on this: removing a chain head promotes its first successor
//! into the home slot, which is all the rechaining reachability needs.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::hash::KeyHashFn;
use crate::Error;

use super::layout;
use super::region::TableRegion;

/// Typed view of a region's slot arrays.
pub struct Slots<'a> {
    n: u32,
    k: u32,
    v: u32,
    key_lens: *mut u32,
    nexts: *mut u32,
    value_lens: *mut u32,
    key_cells: *mut u16,
    value_cells: *mut u16,
    size: &'a AtomicU32,
    cursor: &'a AtomicU32,
    _region: PhantomData<&'a TableRegion>,
}

impl<'a> Slots<'a> {
    pub fn new(region: &'a TableRegion) -> Self {
        let h = region.header();
        let (n, k, v) = (h.capacity, h.max_key_len, h.max_value_len);
        let base = region.base_mut_ptr();
        unsafe {
            Slots {
                n,
                k,
                v,
                key_lens: base.add(layout::key_lens_offset(n)) as *mut u32,
                nexts: base.add(layout::nexts_offset(n)) as *mut u32,
                value_lens: base.add(layout::value_lens_offset(n)) as *mut u32,
                key_cells: base.add(layout::key_cells_offset(n)) as *mut u16,
                value_cells: base.add(layout::value_cells_offset(n, k)) as *mut u16,
                size: region.size_word(),
                cursor: region.free_cursor(),
                _region: PhantomData,
            }
        }
    }

    /// Capacity N; also the INVALID next sentinel.
    pub fn capacity(&self) -> u32 {
        self.n
    }

    pub fn invalid(&self) -> u32 {
        self.n
    }

    /// Reduce a hash to a home slot index.
    pub fn home(&self, units: &[u16], hasher: KeyHashFn) -> u32 {
        hasher(units) % self.n
    }

    // --- Slot field accessors ---
    //
    // Safety contract for all of these: `slot < N`, and the caller holds
    // the slot's line lock (shared for reads, exclusive for writes) or a
    // fully exclusive gate pair.

    pub unsafe fn key_len(&self, slot: u32) -> u32 {
        *self.key_lens.add(slot as usize)
    }

    pub unsafe fn is_occupied(&self, slot: u32) -> bool {
        let len = self.key_len(slot);
        len >= 1 && len <= self.k
    }

    pub unsafe fn next(&self, slot: u32) -> u32 {
        *self.nexts.add(slot as usize)
    }

    pub unsafe fn set_next(&self, slot: u32, next: u32) {
        debug_assert_ne!(slot, next, "a slot must never chain to itself");
        *self.nexts.add(slot as usize) = next;
    }

    pub unsafe fn value_len(&self, slot: u32) -> u32 {
        *self.value_lens.add(slot as usize)
    }

    pub unsafe fn key_units(&self, slot: u32) -> &[u16] {
        let len = self.key_len(slot).min(self.k) as usize;
        std::slice::from_raw_parts(self.key_cells.add(slot as usize * self.k as usize), len)
    }

    pub unsafe fn value_units(&self, slot: u32) -> &[u16] {
        let len = self.value_len(slot).min(self.v) as usize;
        std::slice::from_raw_parts(self.value_cells.add(slot as usize * self.v as usize), len)
    }

    pub unsafe fn key_matches(&self, slot: u32, units: &[u16]) -> bool {
        self.key_len(slot) as usize == units.len() && self.key_units(slot) == units
    }

    pub unsafe fn read_key(&self, slot: u32) -> String {
        String::from_utf16_lossy(self.key_units(slot))
    }

    pub unsafe fn read_value(&self, slot: u32) -> String {
        String::from_utf16_lossy(self.value_units(slot))
    }

    /// Home slot of the key currently stored in `slot`.
    pub unsafe fn home_of(&self, slot: u32, hasher: KeyHashFn) -> u32 {
        self.home(self.key_units(slot), hasher)
    }

    pub unsafe fn write_value(&self, slot: u32, units: &[u16]) {
        debug_assert!(units.len() <= self.v as usize);
        std::ptr::copy_nonoverlapping(
            units.as_ptr(),
            self.value_cells.add(slot as usize * self.v as usize),
            units.len(),
        );
        *self.value_lens.add(slot as usize) = units.len() as u32;
    }

    /// Occupy `slot` with a fresh entry. The key length is written last
    /// so a slot never looks occupied with a half-written key.
    pub unsafe fn write_entry(&self, slot: u32, key: &[u16], value: &[u16], next: u32) {
        debug_assert!(!key.is_empty() && key.len() <= self.k as usize);
        self.write_value(slot, value);
        std::ptr::copy_nonoverlapping(
            key.as_ptr(),
            self.key_cells.add(slot as usize * self.k as usize),
            key.len(),
        );
        self.set_next(slot, next);
        *self.key_lens.add(slot as usize) = key.len() as u32;
    }

    /// Move the record in `src` into `dst`, leaving `src` empty.
    pub unsafe fn relocate(&self, src: u32, dst: u32) {
        let key: Vec<u16> = self.key_units(src).to_vec();
        let value: Vec<u16> = self.value_units(src).to_vec();
        let next = self.next(src);
        self.write_entry(dst, &key, &value, next);
        self.clear_slot(src);
    }

    pub unsafe fn clear_slot(&self, slot: u32) {
        *self.key_lens.add(slot as usize) = 0;
        self.set_next(slot, self.invalid());
    }

    // --- Counters ---

    pub fn len(&self) -> u32 {
        self.size.load(Ordering::Relaxed)
    }

    pub fn bump_size(&self) {
        self.size.fetch_add(1, Ordering::Relaxed);
    }

    pub fn drop_size(&self) {
        self.size.fetch_sub(1, Ordering::Relaxed);
    }

    /// Scan forward from the advisory cursor for an empty slot,
    /// advancing the cursor past a hit. Exclusive-access variant; the
    /// lock-based allocator in `mod.rs` try-locks candidates instead.
    pub unsafe fn find_free(&self) -> Option<u32> {
        let start = self.cursor.load(Ordering::Relaxed);
        for i in 0..self.n {
            let idx = (start.wrapping_add(i)) % self.n;
            if self.key_len(idx) == 0 {
                self.cursor.store((idx + 1) % self.n, Ordering::Relaxed);
                return Some(idx);
            }
        }
        None
    }

    pub fn cursor_hint(&self) -> u32 {
        self.cursor.load(Ordering::Relaxed) % self.n
    }

    pub fn advance_cursor(&self, past: u32) {
        self.cursor.store((past + 1) % self.n, Ordering::Relaxed);
    }

    // --- Chain operations (full exclusivity required) ---

    /// Locate `units` starting from its home. Returns the slot index.
    ///
    /// # Safety
    /// Caller holds both gates exclusively (or is otherwise the sole
    /// accessor of the region).
    pub unsafe fn lookup(&self, units: &[u16], hasher: KeyHashFn) -> Option<u32> {
        let home = self.home(units, hasher);
        if self.key_len(home) == 0 {
            return None;
        }
        if self.home_of(home, hasher) != home {
            // Home usurped by a foreign chain: the key cannot be present.
            return None;
        }
        let mut cur = home;
        for _ in 0..self.n {
            if self.key_matches(cur, units) {
                return Some(cur);
            }
            let nxt = self.next(cur);
            if nxt >= self.n {
                return None;
            }
            cur = nxt;
        }
        None
    }

    /// Upsert `units` → `value`.
    ///
    /// # Safety
    /// Caller holds both gates exclusively (or is otherwise the sole
    /// accessor of the region).
    pub unsafe fn insert(
        &self,
        units: &[u16],
        value: &[u16],
        hasher: KeyHashFn,
    ) -> Result<(), Error> {
        let home = self.home(units, hasher);

        if self.key_len(home) == 0 {
            self.write_entry(home, units, value, self.invalid());
            self.bump_size();
            return Ok(());
        }

        if self.home_of(home, hasher) != home {
            // A foreign entry sits on this key's home: evict it to a
            // free slot and splice its chain around the move.
            let free = self.find_free().ok_or(Error::TableFull)?;
            let foreign_home = self.home_of(home, hasher);
            self.relocate(home, free);
            let mut pred = foreign_home;
            for _ in 0..self.n {
                let nxt = self.next(pred);
                if nxt == home {
                    break;
                }
                debug_assert!(nxt < self.n, "evicted entry must have a predecessor");
                pred = nxt;
            }
            self.set_next(pred, free);
            self.write_entry(home, units, value, self.invalid());
            self.bump_size();
            return Ok(());
        }

        // Walk this key's chain: overwrite in place or append at the tail.
        let mut cur = home;
        loop {
            if self.key_matches(cur, units) {
                self.write_value(cur, value);
                return Ok(());
            }
            let nxt = self.next(cur);
            if nxt >= self.n {
                break;
            }
            cur = nxt;
        }
        let free = self.find_free().ok_or(Error::TableFull)?;
        self.write_entry(free, units, value, self.invalid());
        self.set_next(cur, free);
        self.bump_size();
        Ok(())
    }

    /// Remove `units` if present. Rechaining: deleting the chain head
    /// promotes its first successor into the home slot.
    ///
    /// # Safety
    /// Caller holds both gates exclusively (or is otherwise the sole
    /// accessor of the region).
    pub unsafe fn delete(&self, units: &[u16], hasher: KeyHashFn) -> bool {
        let home = self.home(units, hasher);
        if self.key_len(home) == 0 || self.home_of(home, hasher) != home {
            return false;
        }

        let mut prev = self.invalid();
        let mut cur = home;
        let mut found = false;
        for _ in 0..self.n {
            if self.key_matches(cur, units) {
                found = true;
                break;
            }
            let nxt = self.next(cur);
            if nxt >= self.n {
                break;
            }
            prev = cur;
            cur = nxt;
        }
        if !found {
            return false;
        }

        let nxt = self.next(cur);
        if prev != self.invalid() {
            // Mid-chain or tail entry: unlink it.
            self.set_next(prev, nxt);
            self.clear_slot(cur);
        } else if nxt < self.n {
            // Chain head with successors: promote the first successor
            // into the home slot so the rest stay reachable.
            self.relocate(nxt, home);
        } else {
            self.clear_slot(home);
        }
        self.drop_size();
        true
    }

    /// Reset every slot to empty and both counters to zero.
    ///
    /// # Safety
    /// Caller holds both gates exclusively.
    pub unsafe fn clear(&self) {
        for slot in 0..self.n {
            self.clear_slot(slot);
        }
        self.size.store(0, Ordering::Relaxed);
        self.cursor.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::murmur2;

    fn units(s: &str) -> Vec<u16> {
        s.encode_utf16().collect()
    }

    /// Everything hashes to slot 0.
    fn zero_hash(_: &[u16]) -> u32 {
        0
    }

    /// "a" and "b" share home 0; every other key gets home 1.
    fn ab_hash(u: &[u16]) -> u32 {
        match u.first() {
            Some(0x61) | Some(0x62) => 0,
            _ => 1,
        }
    }

    fn region(n: u32) -> TableRegion {
        TableRegion::anonymous(n, 8, 8).unwrap()
    }

    #[test]
    fn insert_lookup_roundtrip() {
        let region = region(8);
        let slots = Slots::new(&region);
        unsafe {
            slots.insert(&units("a"), &units("1"), murmur2).unwrap();
            slots.insert(&units("b"), &units("2"), murmur2).unwrap();
            slots.insert(&units("c"), &units("3"), murmur2).unwrap();

            assert_eq!(slots.len(), 3);
            let b = slots.lookup(&units("b"), murmur2).unwrap();
            assert_eq!(slots.read_value(b), "2");
            assert!(slots.lookup(&units("d"), murmur2).is_none());
        }
    }

    #[test]
    fn update_in_place_keeps_size() {
        let region = region(8);
        let slots = Slots::new(&region);
        unsafe {
            slots.insert(&units("k"), &units("v1"), murmur2).unwrap();
            slots.insert(&units("k"), &units("v2"), murmur2).unwrap();
            assert_eq!(slots.len(), 1);
            let s = slots.lookup(&units("k"), murmur2).unwrap();
            assert_eq!(slots.read_value(s), "v2");
        }
    }

    #[test]
    fn collision_chains_through_free_slots() {
        let region = region(8);
        let slots = Slots::new(&region);
        unsafe {
            slots.insert(&units("a"), &units("1"), zero_hash).unwrap();
            slots.insert(&units("b"), &units("2"), zero_hash).unwrap();

            // "a" owns slot 0, "b" overflows into slot 1, linked behind it.
            assert_eq!(slots.read_key(0), "a");
            assert_eq!(slots.next(0), 1);
            assert_eq!(slots.read_key(1), "b");
            assert_eq!(slots.next(1), slots.invalid());
        }
    }

    #[test]
    fn deleting_head_promotes_successor() {
        let region = region(8);
        let slots = Slots::new(&region);
        unsafe {
            slots.insert(&units("a"), &units("1"), zero_hash).unwrap();
            slots.insert(&units("b"), &units("2"), zero_hash).unwrap();

            assert!(slots.delete(&units("a"), zero_hash));

            // "b" moved home; its old slot is empty and unlinked.
            assert_eq!(slots.read_key(0), "b");
            assert_eq!(slots.next(0), slots.invalid());
            assert_eq!(slots.key_len(1), 0);
            assert_eq!(slots.next(1), slots.invalid());
            assert_eq!(slots.len(), 1);
            assert_eq!(slots.lookup(&units("b"), zero_hash), Some(0));
            assert!(slots.lookup(&units("a"), zero_hash).is_none());
        }
    }

    #[test]
    fn deleting_mid_chain_unlinks() {
        let region = region(8);
        let slots = Slots::new(&region);
        unsafe {
            for (k, v) in [("a", "1"), ("b", "2"), ("c", "3")] {
                slots.insert(&units(k), &units(v), zero_hash).unwrap();
            }
            assert!(slots.delete(&units("b"), zero_hash));
            assert_eq!(slots.len(), 2);
            assert!(slots.lookup(&units("b"), zero_hash).is_none());
            let a = slots.lookup(&units("a"), zero_hash).unwrap();
            let c = slots.lookup(&units("c"), zero_hash).unwrap();
            assert_eq!(slots.read_value(a), "1");
            assert_eq!(slots.read_value(c), "3");
        }
    }

    #[test]
    fn foreign_occupant_is_evicted_from_home() {
        let region = region(8);
        let slots = Slots::new(&region);
        unsafe {
            // "a" takes slot 0; "b" overflows into slot 1 (chain of home 0).
            slots.insert(&units("a"), &units("1"), ab_hash).unwrap();
            slots.insert(&units("b"), &units("2"), ab_hash).unwrap();
            assert_eq!(slots.read_key(1), "b");

            // "x" hashes to 1, which "b" is squatting on.
            slots.insert(&units("x"), &units("9"), ab_hash).unwrap();

            assert_eq!(slots.read_key(1), "x");
            assert_eq!(slots.next(1), slots.invalid());

            // "b" moved to a free slot and chain 0 follows it there.
            let b = slots.lookup(&units("b"), ab_hash).unwrap();
            assert_ne!(b, 1);
            assert_eq!(slots.next(0), b);
            assert_eq!(slots.read_value(b), "2");
            assert_eq!(slots.len(), 3);
        }
    }

    #[test]
    fn fills_to_capacity_then_reports_full() {
        let region = region(4);
        let slots = Slots::new(&region);
        unsafe {
            for (i, k) in ["a", "b", "c", "d"].iter().enumerate() {
                slots.insert(&units(k), &units("v"), zero_hash).unwrap();
                assert_eq!(slots.len(), i as u32 + 1);
            }
            assert_eq!(
                slots.insert(&units("e"), &units("v"), zero_hash),
                Err(Error::TableFull)
            );
            // Updates still succeed at capacity.
            slots.insert(&units("a"), &units("w"), zero_hash).unwrap();
            assert_eq!(slots.len(), 4);
        }
    }

    #[test]
    fn delete_then_reinsert_reuses_slots() {
        let region = region(4);
        let slots = Slots::new(&region);
        unsafe {
            for k in ["a", "b", "c", "d"] {
                slots.insert(&units(k), &units("v"), murmur2).unwrap();
            }
            for k in ["a", "b", "c", "d"] {
                assert!(slots.delete(&units(k), murmur2));
            }
            assert_eq!(slots.len(), 0);
            for k in ["p", "q", "r", "s"] {
                slots.insert(&units(k), &units("v"), murmur2).unwrap();
            }
            assert_eq!(slots.len(), 4);
            for k in ["p", "q", "r", "s"] {
                assert!(slots.lookup(&units(k), murmur2).is_some());
            }
        }
    }

    #[test]
    fn randomized_against_model() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};
        use std::collections::HashMap;

        let region = region(64);
        let slots = Slots::new(&region);
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut model: HashMap<String, String> = HashMap::new();

        unsafe {
            for step in 0..2000 {
                let key = format!("k{}", rng.gen_range(0..48));
                if rng.gen_bool(0.6) {
                    let value = format!("v{step}");
                    // 48 distinct keys in a 64-slot table never fill it.
                    slots.insert(&units(&key), &units(&value), murmur2).unwrap();
                    model.insert(key, value);
                } else {
                    let removed = slots.delete(&units(&key), murmur2);
                    assert_eq!(removed, model.remove(&key).is_some());
                }
            }

            assert_eq!(slots.len() as usize, model.len());
            for (k, v) in &model {
                let slot = slots
                    .lookup(&units(k), murmur2)
                    .unwrap_or_else(|| panic!("{k} lost"));
                assert_eq!(&slots.read_value(slot), v);
            }
            // Every occupied slot is reachable from its own home.
            for slot in 0..slots.capacity() {
                if slots.is_occupied(slot) {
                    let key = slots.read_key(slot);
                    assert_eq!(slots.lookup(&units(&key), murmur2), Some(slot));
                }
            }
        }
    }
}
