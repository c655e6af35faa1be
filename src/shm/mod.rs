//! Shared-memory string map backend.
//!
//! Provides [`SharedTable`] — a fixed-capacity, coalesced-chaining
//! string map living entirely inside one shared byte region. Any number
//! of threads (or processes attached to the same named region) operate
//! on it concurrently: lookups take momentary shared line locks, inserts
//! take exclusive line locks on at most two slots at a time, and chain
//! surgery (delete, home eviction, clear) briefly drains everyone
//! through the global gates.
//!
//! Contended exclusive line locks carry a deadline; on timeout the
//! operation releases everything it holds, sleeps a randomized backoff
//! and restarts, surfacing [`Error::Deadlock`] only past a configured
//! retry bound.

pub mod chain;
pub mod layout;
pub mod lock;
pub mod region;

use std::io;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, warn};

use crate::error::Error;
use crate::hash::{murmur2, KeyHashFn};
use chain::Slots;
use region::TableRegion;

/// Construction parameters. Capacity and the key/value widths are fixed
/// for the region's lifetime and persisted in its header; the hasher and
/// the lock-recovery tuning are per-handle.
#[derive(Clone)]
pub struct TableOptions {
    /// Number of slots (N).
    pub capacity: u32,
    /// Maximum key length in UTF-16 code units (K).
    pub max_key_len: u32,
    /// Maximum value length in UTF-16 code units (V).
    pub max_value_len: u32,
    /// Key hash; every peer on the same region must use the same one.
    pub hasher: KeyHashFn,
    /// Deadline for a single exclusive line-lock acquisition.
    pub lock_timeout: Duration,
    /// Restarts before a mutating operation surfaces `Deadlock`.
    pub max_retries: u32,
}

impl Default for TableOptions {
    fn default() -> Self {
        TableOptions {
            capacity: 1024,
            max_key_len: 64,
            max_value_len: 256,
            hasher: murmur2,
            lock_timeout: Duration::from_millis(5),
            max_retries: 64,
        }
    }
}

/// The shared-memory string map handle.
///
/// Handles are cheap views: several handles (across threads via `Arc`,
/// or across processes via [`SharedTable::open`]) may point at the same
/// region. All state lives in the region itself.
pub struct SharedTable {
    region: TableRegion,
    hasher: KeyHashFn,
    lock_timeout: Duration,
    max_retries: u32,
}

enum SetAttempt {
    Done,
    Full,
    Eviction,
    Contended,
    Timeout,
}

/// Outcome of a lined free-slot scan.
enum Alloc {
    /// An empty slot, returned still exclusively locked.
    Slot(u32),
    /// No empty slot found, but at least one busy word was skipped and
    /// may have hidden one — not a verdict on fullness.
    Contended,
    /// Every slot was inspected under its lock and found occupied.
    Exhausted,
}

impl SharedTable {
    /// Create a named region and a handle onto it.
    pub fn create(name: &str, options: &TableOptions) -> io::Result<Self> {
        let region = TableRegion::create(
            name,
            options.capacity,
            options.max_key_len,
            options.max_value_len,
        )?;
        Ok(Self::with_region(region, options))
    }

    /// Attach to an existing named region, reading (N, K, V) from its
    /// header. Uses the default hasher and lock tuning; peers that
    /// plugged a custom hash must use [`SharedTable::open_with`].
    pub fn open(name: &str) -> io::Result<Self> {
        Self::open_with(name, &TableOptions::default())
    }

    /// Attach to an existing named region with explicit per-handle
    /// options. The capacity fields of `options` are ignored; the
    /// header is authoritative.
    pub fn open_with(name: &str, options: &TableOptions) -> io::Result<Self> {
        let region = TableRegion::open(name)?;
        Ok(Self::with_region(region, options))
    }

    /// Open a compatible named region or (re)create it.
    pub fn create_or_open(name: &str, options: &TableOptions) -> io::Result<Self> {
        let region = TableRegion::create_or_open(
            name,
            options.capacity,
            options.max_key_len,
            options.max_value_len,
        )?;
        Ok(Self::with_region(region, options))
    }

    /// Create an anonymous region for single-process sharing (wrap the
    /// handle in an `Arc` and clone it across threads).
    pub fn anonymous(options: &TableOptions) -> io::Result<Self> {
        let region = TableRegion::anonymous(
            options.capacity,
            options.max_key_len,
            options.max_value_len,
        )?;
        Ok(Self::with_region(region, options))
    }

    fn with_region(region: TableRegion, options: &TableOptions) -> Self {
        SharedTable {
            region,
            hasher: options.hasher,
            lock_timeout: options.lock_timeout,
            max_retries: options.max_retries,
        }
    }

    /// Remove the backing file of a named region.
    pub fn unlink(&self) -> io::Result<()> {
        self.region.unlink()
    }

    // --- Introspection ---

    /// Current number of entries. Unlocked snapshot.
    pub fn len(&self) -> usize {
        self.region.size_word().load(Ordering::Relaxed) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Slot capacity N.
    pub fn capacity(&self) -> usize {
        self.region.capacity() as usize
    }

    /// Maximum key length K in UTF-16 code units.
    pub fn max_key_len(&self) -> usize {
        self.region.header().max_key_len as usize
    }

    /// Maximum value length V in UTF-16 code units.
    pub fn max_value_len(&self) -> usize {
        self.region.header().max_value_len as usize
    }

    /// Home slot of `key` under this handle's hasher.
    pub fn hash_of(&self, key: &str) -> u32 {
        let units: Vec<u16> = key.encode_utf16().collect();
        (self.hasher)(&units) % self.region.capacity()
    }

    // --- Core operations ---

    /// Upsert `key` → `value`.
    pub fn set(&self, key: &str, value: &str) -> Result<(), Error> {
        let k = self.encode_key(key)?;
        let v = self.encode_value(value)?;
        let home = self.home(&k);

        lock::gate_shared_acquire(self.region.writer_gate());
        let outcome = self.set_with_line_locks(home, &k, &v);
        lock::gate_shared_release(self.region.writer_gate());

        match outcome {
            SetAttempt::Done => Ok(()),
            // Chain surgery, or an allocation verdict the contended
            // lined scan could not settle: the exclusive path decides
            // definitively (its scan runs with everyone drained).
            SetAttempt::Eviction | SetAttempt::Contended => self.set_exclusive(&k, &v),
            SetAttempt::Full => Err(Error::TableFull),
            SetAttempt::Timeout => Err(Error::Deadlock {
                attempts: self.max_retries,
            }),
        }
    }

    /// Value for `key`, or `None` when absent. Never fails: invalid or
    /// over-long keys cannot be stored, so they simply aren't found.
    pub fn get(&self, key: &str) -> Option<String> {
        let k = self.encode_key(key).ok()?;
        self.walk_lookup(&k, |slots, slot| unsafe { slots.read_value(slot) })
    }

    /// Whether `key` is present. Same lookup as [`SharedTable::get`].
    pub fn has(&self, key: &str) -> bool {
        match self.encode_key(key) {
            Ok(k) => self.walk_lookup(&k, |_, _| ()).is_some(),
            Err(_) => false,
        }
    }

    /// Remove `key`. Returns whether it was present; absent keys are a
    /// no-op. Runs under the exclusive gates: unlinking and rechaining
    /// restructure the chain, so readers are drained first.
    pub fn delete(&self, key: &str) -> Result<bool, Error> {
        let k = match self.encode_key(key) {
            Ok(k) => k,
            // An over-long key cannot have been stored.
            Err(Error::KeyTooLong { .. }) => return Ok(false),
            Err(e) => return Err(e),
        };
        lock::gate_excl_acquire(self.region.writer_gate());
        lock::gate_excl_acquire(self.region.reader_gate());
        let removed = unsafe { Slots::new(&self.region).delete(&k, self.hasher) };
        lock::gate_excl_release(self.region.reader_gate());
        lock::gate_excl_release(self.region.writer_gate());
        Ok(removed)
    }

    /// Empty the table and reset the free-slot cursor.
    pub fn clear(&self) {
        lock::gate_excl_acquire(self.region.writer_gate());
        lock::gate_excl_acquire(self.region.reader_gate());
        unsafe { Slots::new(&self.region).clear() };
        lock::gate_excl_release(self.region.reader_gate());
        lock::gate_excl_release(self.region.writer_gate());
        debug!("table cleared");
    }

    /// Lazy key iterator. Weakly consistent: each step takes a momentary
    /// shared line lock and nothing is held between yields, so keys
    /// inserted or deleted mid-scan may or may not be observed, while a
    /// key present throughout the scan is always yielded.
    pub fn keys(&self) -> Keys<'_> {
        Keys {
            table: self,
            next_slot: 0,
        }
    }

    /// Apply `f` to every entry, collecting the results. The entry's
    /// line lock is held across each invocation, so `f` observes a
    /// stable (key, value) pair. `f` must not call back into this table
    /// except through a held [`WriteGuard`].
    pub fn map<T>(&self, mut f: impl FnMut(&str, &str) -> T) -> Vec<T> {
        self.reduce(Vec::new(), |mut acc, key, value| {
            acc.push(f(key, value));
            acc
        })
    }

    /// Fold over every entry. Per-entry locking as in
    /// [`SharedTable::map`].
    pub fn reduce<A>(&self, init: A, mut f: impl FnMut(A, &str, &str) -> A) -> A {
        let slots = Slots::new(&self.region);
        let mut acc = init;
        for slot in 0..self.region.capacity() {
            let _gate = SharedGate::lock(self.region.reader_gate());
            let _line = SharedLine::lock(self.region.line_lock(slot));
            let entry = unsafe {
                slots
                    .is_occupied(slot)
                    .then(|| (slots.read_key(slot), slots.read_value(slot)))
            };
            if let Some((key, value)) = entry {
                // Locks stay held across the callback; they are
                // released (even on panic) when the guards drop.
                acc = f(acc, &key, &value);
            }
        }
        acc
    }

    /// Take the global gate exclusively. While the guard lives, other
    /// writers block and readers proceed; the guard's own operations
    /// skip all gate and line locking. Dropping the guard releases the
    /// gate.
    ///
    /// Calling the plain (non-guard) mutating operations from the
    /// context that holds the guard deadlocks; use the guard's methods.
    pub fn lock_write(&self) -> WriteGuard<'_> {
        lock::gate_excl_acquire(self.region.writer_gate());
        WriteGuard { table: self }
    }

    // --- Internals ---

    fn home(&self, units: &[u16]) -> u32 {
        (self.hasher)(units) % self.region.capacity()
    }

    fn encode_key(&self, key: &str) -> Result<Vec<u16>, Error> {
        if key.is_empty() {
            return Err(Error::InvalidKey);
        }
        let units: Vec<u16> = key.encode_utf16().collect();
        let max = self.max_key_len();
        if units.len() > max {
            return Err(Error::KeyTooLong {
                len: units.len(),
                max,
            });
        }
        Ok(units)
    }

    fn encode_value(&self, value: &str) -> Result<Vec<u16>, Error> {
        let units: Vec<u16> = value.encode_utf16().collect();
        let max = self.max_value_len();
        if units.len() > max {
            return Err(Error::ValueTooLong {
                len: units.len(),
                max,
            });
        }
        Ok(units)
    }

    /// Line-locked insert loop: restart on lock timeout until the retry
    /// budget runs out. The writer gate is already held in shared mode
    /// and stays held across restarts.
    fn set_with_line_locks(&self, home: u32, key: &[u16], value: &[u16]) -> SetAttempt {
        let mut attempt = 0u32;
        loop {
            match self.try_set_once(home, key, value) {
                outcome @ (SetAttempt::Timeout | SetAttempt::Contended) => {
                    attempt += 1;
                    if attempt >= self.max_retries {
                        warn!(attempt, "insert gave up after lock-recovery restarts");
                        return outcome;
                    }
                    debug!(attempt, "contended insert, restarting");
                    backoff(attempt);
                }
                other => return other,
            }
        }
    }

    /// One insert attempt under hand-over-hand exclusive line locks (at
    /// most two held at once: the walk predecessor and its successor, or
    /// the chain tail and a freshly allocated slot).
    fn try_set_once(&self, home: u32, key: &[u16], value: &[u16]) -> SetAttempt {
        let slots = Slots::new(&self.region);
        let deadline = Instant::now() + self.lock_timeout;

        let home_word = self.region.line_lock(home);
        if !lock::line_lock_excl_until(home_word, deadline) {
            return SetAttempt::Timeout;
        }

        unsafe {
            if slots.key_len(home) == 0 {
                slots.write_entry(home, key, value, slots.invalid());
                slots.bump_size();
                lock::line_unlock_excl(home_word);
                return SetAttempt::Done;
            }

            if slots.home_of(home, self.hasher) != home {
                // Foreign occupant: moving it touches three slots, which
                // exceeds this path's two-lock budget. Escalate.
                lock::line_unlock_excl(home_word);
                return SetAttempt::Eviction;
            }

            let mut cur = home;
            loop {
                if slots.key_matches(cur, key) {
                    slots.write_value(cur, value);
                    lock::line_unlock_excl(self.region.line_lock(cur));
                    return SetAttempt::Done;
                }
                let nxt = slots.next(cur);
                if nxt >= slots.capacity() {
                    break;
                }
                if !lock::line_lock_excl_until(self.region.line_lock(nxt), deadline) {
                    lock::line_unlock_excl(self.region.line_lock(cur));
                    return SetAttempt::Timeout;
                }
                lock::line_unlock_excl(self.region.line_lock(cur));
                cur = nxt;
            }

            // `cur` is the locked chain tail; append in a free slot.
            match self.alloc_free_locked(&slots, cur) {
                Alloc::Slot(free) => {
                    slots.write_entry(free, key, value, slots.invalid());
                    slots.set_next(cur, free);
                    slots.bump_size();
                    lock::line_unlock_excl(self.region.line_lock(free));
                    lock::line_unlock_excl(self.region.line_lock(cur));
                    SetAttempt::Done
                }
                Alloc::Contended => {
                    lock::line_unlock_excl(self.region.line_lock(cur));
                    SetAttempt::Contended
                }
                Alloc::Exhausted => {
                    lock::line_unlock_excl(self.region.line_lock(cur));
                    SetAttempt::Full
                }
            }
        }
    }

    /// Scan for an empty slot from the advisory cursor, try-locking
    /// candidates and skipping contended ones (a busy word means someone
    /// is filling or probing that slot). A skipped word may have hidden
    /// an empty slot, so a fruitless scan that skipped anything reports
    /// `Contended` rather than `Exhausted`; `held` is the caller's own
    /// locked tail, which is occupied and never counts as a skip.
    /// `Exhausted` is definitive: no delete can run while the writer
    /// gate is held in shared mode, so occupied slots stay occupied.
    fn alloc_free_locked(&self, slots: &Slots<'_>, held: u32) -> Alloc {
        let n = slots.capacity();
        let start = slots.cursor_hint();
        let mut skipped = false;
        for i in 0..n {
            let idx = start.wrapping_add(i) % n;
            if idx == held {
                continue;
            }
            let word = self.region.line_lock(idx);
            if !lock::line_try_lock_excl(word) {
                skipped = true;
                continue;
            }
            if unsafe { slots.key_len(idx) } == 0 {
                slots.advance_cursor(idx);
                return Alloc::Slot(idx);
            }
            lock::line_unlock_excl(word);
        }
        if skipped {
            Alloc::Contended
        } else {
            Alloc::Exhausted
        }
    }

    /// Insert under both exclusive gates: used when a foreign occupant
    /// must be evicted from the key's home slot, which restructures a
    /// chain the way delete does.
    fn set_exclusive(&self, key: &[u16], value: &[u16]) -> Result<(), Error> {
        lock::gate_excl_acquire(self.region.writer_gate());
        lock::gate_excl_acquire(self.region.reader_gate());
        let result = unsafe { Slots::new(&self.region).insert(key, value, self.hasher) };
        lock::gate_excl_release(self.region.reader_gate());
        lock::gate_excl_release(self.region.writer_gate());
        result
    }

    /// Shared-locked chain walk. Holds the traversal gate for the whole
    /// walk and one shared line lock at a time; `read` runs under the
    /// matched slot's lock.
    fn walk_lookup<T>(&self, key: &[u16], read: impl FnOnce(&Slots<'_>, u32) -> T) -> Option<T> {
        let slots = Slots::new(&self.region);
        let home = self.home(key);
        let _gate = SharedGate::lock(self.region.reader_gate());

        let mut cur = home;
        let mut line = SharedLine::lock(self.region.line_lock(cur));
        unsafe {
            if slots.key_len(cur) == 0 || slots.home_of(cur, self.hasher) != home {
                return None;
            }
            for _ in 0..slots.capacity() {
                if slots.key_matches(cur, key) {
                    return Some(read(&slots, cur));
                }
                let nxt = slots.next(cur);
                drop(line);
                if nxt >= slots.capacity() {
                    return None;
                }
                cur = nxt;
                line = SharedLine::lock(self.region.line_lock(cur));
            }
        }
        drop(line);
        None
    }
}

// Handles only hold the region view plus copies of the per-handle
// options; all shared state is behind the region's locking protocol.
unsafe impl Send for SharedTable {}
unsafe impl Sync for SharedTable {}

/// Exclusive write session returned by [`SharedTable::lock_write`].
///
/// While it lives, concurrent `set`/`delete` calls block at the writer
/// gate and reads proceed. Its methods run with gate and line locking
/// skipped; dropping it reopens the gate.
pub struct WriteGuard<'a> {
    table: &'a SharedTable,
}

impl WriteGuard<'_> {
    /// Upsert without taking any locks (chain surgery still drains
    /// concurrent readers for the splice).
    pub fn set(&self, key: &str, value: &str) -> Result<(), Error> {
        let k = self.table.encode_key(key)?;
        let v = self.table.encode_value(value)?;
        self.surgery(|slots| unsafe { slots.insert(&k, &v, self.table.hasher) })
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let k = self.table.encode_key(key).ok()?;
        let slots = Slots::new(&self.table.region);
        unsafe {
            slots
                .lookup(&k, self.table.hasher)
                .map(|slot| slots.read_value(slot))
        }
    }

    pub fn has(&self, key: &str) -> bool {
        let Ok(k) = self.table.encode_key(key) else {
            return false;
        };
        let slots = Slots::new(&self.table.region);
        unsafe { slots.lookup(&k, self.table.hasher).is_some() }
    }

    pub fn delete(&self, key: &str) -> Result<bool, Error> {
        let k = match self.table.encode_key(key) {
            Ok(k) => k,
            Err(Error::KeyTooLong { .. }) => return Ok(false),
            Err(e) => return Err(e),
        };
        Ok(self.surgery(|slots| unsafe { slots.delete(&k, self.table.hasher) }))
    }

    pub fn clear(&self) {
        self.surgery(|slots| unsafe { slots.clear() });
    }

    /// Snapshot of all keys. Writers are gated out, so this is exact.
    pub fn keys(&self) -> Vec<String> {
        self.reduce(Vec::new(), |mut acc, key, _| {
            acc.push(key.to_owned());
            acc
        })
    }

    pub fn map<T>(&self, mut f: impl FnMut(&str, &str) -> T) -> Vec<T> {
        self.reduce(Vec::new(), |mut acc, key, value| {
            acc.push(f(key, value));
            acc
        })
    }

    pub fn reduce<A>(&self, init: A, mut f: impl FnMut(A, &str, &str) -> A) -> A {
        let slots = Slots::new(&self.table.region);
        let mut acc = init;
        for slot in 0..self.table.region.capacity() {
            let entry = unsafe {
                slots
                    .is_occupied(slot)
                    .then(|| (slots.read_key(slot), slots.read_value(slot)))
            };
            if let Some((key, value)) = entry {
                acc = f(acc, &key, &value);
            }
        }
        acc
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Run `f` with concurrent readers drained. The writer gate is
    /// already held by this guard.
    fn surgery<T>(&self, f: impl FnOnce(&Slots<'_>) -> T) -> T {
        lock::gate_excl_acquire(self.table.region.reader_gate());
        let out = f(&Slots::new(&self.table.region));
        lock::gate_excl_release(self.table.region.reader_gate());
        out
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        lock::gate_excl_release(self.table.region.writer_gate());
    }
}

/// Lazy key iterator; see [`SharedTable::keys`].
pub struct Keys<'a> {
    table: &'a SharedTable,
    next_slot: u32,
}

impl Iterator for Keys<'_> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        let region = &self.table.region;
        let slots = Slots::new(region);
        while self.next_slot < region.capacity() {
            let slot = self.next_slot;
            self.next_slot += 1;

            let _gate = SharedGate::lock(region.reader_gate());
            let _line = SharedLine::lock(region.line_lock(slot));
            let key = unsafe { slots.is_occupied(slot).then(|| slots.read_key(slot)) };
            if key.is_some() {
                return key;
            }
        }
        None
    }
}

// --- RAII wrappers for the read-side locks ---

struct SharedGate<'a>(&'a AtomicU32);

impl<'a> SharedGate<'a> {
    fn lock(word: &'a AtomicU32) -> Self {
        lock::gate_shared_acquire(word);
        SharedGate(word)
    }
}

impl Drop for SharedGate<'_> {
    fn drop(&mut self) {
        lock::gate_shared_release(self.0);
    }
}

struct SharedLine<'a>(&'a AtomicI32);

impl<'a> SharedLine<'a> {
    fn lock(word: &'a AtomicI32) -> Self {
        lock::line_lock_shared(word);
        SharedLine(word)
    }
}

impl Drop for SharedLine<'_> {
    fn drop(&mut self) {
        lock::line_unlock_shared(self.0);
    }
}

/// Randomized, escalating sleep between lock-recovery restarts.
fn backoff(attempt: u32) {
    let cap = 50u64 << attempt.min(6) as u64;
    let micros = rand::thread_rng().gen_range(cap / 2..=cap);
    std::thread::sleep(Duration::from_micros(micros));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> SharedTable {
        SharedTable::anonymous(&TableOptions {
            capacity: 8,
            max_key_len: 8,
            max_value_len: 8,
            ..TableOptions::default()
        })
        .unwrap()
    }

    #[test]
    fn basic_set_get_keys() {
        let table = small();
        table.set("a", "1").unwrap();
        table.set("b", "2").unwrap();
        table.set("c", "3").unwrap();

        assert_eq!(table.len(), 3);
        assert_eq!(table.get("b").as_deref(), Some("2"));
        assert_eq!(table.get("missing"), None);

        let mut keys: Vec<String> = table.keys().collect();
        keys.sort();
        assert_eq!(keys, ["a", "b", "c"]);
    }

    #[test]
    fn overwrite_keeps_size() {
        let table = small();
        table.set("k", "v").unwrap();
        table.set("k", "w").unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.get("k").as_deref(), Some("w"));
    }

    #[test]
    fn key_and_value_length_limits() {
        let table = small();

        table.set("12345678", "x").unwrap(); // exactly K
        assert_eq!(
            table.set("123456789", "x"),
            Err(Error::KeyTooLong { len: 9, max: 8 })
        );
        assert_eq!(
            table.set("k", "123456789"),
            Err(Error::ValueTooLong { len: 9, max: 8 })
        );
        assert_eq!(table.set("", "x"), Err(Error::InvalidKey));
        assert_eq!(table.delete(""), Err(Error::InvalidKey));

        // Limits are in UTF-16 code units, not bytes.
        table.set("éééééééé", "ü").unwrap();
        assert_eq!(table.get("éééééééé").as_deref(), Some("ü"));
    }

    #[test]
    fn fills_to_capacity_then_table_full() {
        let table = small();
        for i in 0..8 {
            table.set(&format!("k{i}"), "v").unwrap();
        }
        assert_eq!(table.len(), 8);
        assert_eq!(table.set("extra", "v"), Err(Error::TableFull));
        // Updating an existing key still works at capacity.
        table.set("k3", "w").unwrap();
        assert_eq!(table.get("k3").as_deref(), Some("w"));
    }

    #[test]
    fn delete_is_idempotent() {
        let table = small();
        table.set("k", "v").unwrap();
        assert_eq!(table.len(), 1);
        assert!(table.delete("k").unwrap());
        assert_eq!(table.len(), 0);
        assert_eq!(table.get("k"), None);
        assert!(!table.delete("k").unwrap());
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn drain_and_refill() {
        let table = small();
        for i in 0..8 {
            table.set(&format!("k{i}"), "v").unwrap();
        }
        for i in 0..8 {
            assert!(table.delete(&format!("k{i}")).unwrap());
        }
        assert_eq!(table.len(), 0);
        for i in 0..8 {
            table.set(&format!("n{i}"), "v").unwrap();
        }
        assert_eq!(table.len(), 8);
        for i in 0..8 {
            assert!(table.has(&format!("n{i}")));
        }
    }

    #[test]
    fn clear_resets_everything() {
        let table = small();
        for i in 0..5 {
            table.set(&format!("k{i}"), "v").unwrap();
        }
        table.clear();
        assert_eq!(table.len(), 0);
        assert_eq!(table.keys().count(), 0);
        table.set("fresh", "v").unwrap();
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn reduce_counts_entries() {
        let table = small();
        for i in 0..6 {
            table.set(&format!("k{i}"), &i.to_string()).unwrap();
        }
        let count = table.reduce(0usize, |acc, _, _| acc + 1);
        assert_eq!(count, table.len());

        let sum = table.reduce(0u32, |acc, _, value| acc + value.parse::<u32>().unwrap());
        assert_eq!(sum, 15);
    }

    #[test]
    fn map_collects_per_entry() {
        let table = small();
        table.set("a", "1").unwrap();
        table.set("b", "2").unwrap();
        let mut pairs = table.map(|key, value| format!("{key}={value}"));
        pairs.sort();
        assert_eq!(pairs, ["a=1", "b=2"]);
    }

    #[test]
    fn write_guard_bypass_operations() {
        let table = small();
        table.set("before", "1").unwrap();

        let guard = table.lock_write();
        guard.set("during", "2").unwrap();
        assert_eq!(guard.get("before").as_deref(), Some("1"));
        assert_eq!(guard.get("during").as_deref(), Some("2"));
        assert!(guard.delete("before").unwrap());
        assert_eq!(guard.len(), 1);
        drop(guard);

        assert_eq!(table.get("during").as_deref(), Some("2"));
        assert_eq!(table.get("before"), None);
        table.set("after", "3").unwrap();
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn hash_of_is_a_home_slot() {
        let table = small();
        for key in ["a", "b", "long-ish", "ü"] {
            assert!((table.hash_of(key) as usize) < table.capacity());
        }
    }

    #[test]
    fn custom_hasher_is_used() {
        fn always_three(_: &[u16]) -> u32 {
            3
        }
        let table = SharedTable::anonymous(&TableOptions {
            capacity: 8,
            max_key_len: 8,
            max_value_len: 8,
            hasher: always_three,
            ..TableOptions::default()
        })
        .unwrap();

        assert_eq!(table.hash_of("anything"), 3);
        table.set("x", "1").unwrap();
        table.set("y", "2").unwrap();
        assert_eq!(table.get("x").as_deref(), Some("1"));
        assert_eq!(table.get("y").as_deref(), Some("2"));
        assert_eq!(table.len(), 2);
    }
}
