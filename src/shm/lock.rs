//! Line locks and global gates over atomic words in the shared region.
//!
//! Every lock here is a bare 32-bit word inside the mapping, so peers in
//! other processes see the same state. Contended acquisitions suspend on
//! the word's address: on Linux that is a `futex` wait without the
//! private flag (peer processes get woken too), elsewhere a bounded
//! sleep/poll loop.
//!
//! Line-lock word encoding: `0` unlocked, `1` writer-held, `-r` for `r`
//! shared readers.
//!
//! Gate word encoding: bit 31 is the exclusive flag, bits 0..31 count
//! shared holders. Exclusive acquisition first claims the flag (blocking
//! later shared acquisitions), then drains the shared count.

use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::time::{Duration, Instant};

/// Exclusive flag in a gate word.
const GATE_EXCL: u32 = 1 << 31;

/// Shared-holder count mask in a gate word.
const GATE_COUNT: u32 = GATE_EXCL - 1;

// ---------------------------------------------------------------------------
// Wait / wake primitive
// ---------------------------------------------------------------------------

#[cfg(target_os = "linux")]
mod waiter {
    use super::*;

    /// Sleep until `word` changes away from `expected`, a wake arrives,
    /// or `timeout` elapses. Spurious returns are fine; callers loop.
    pub fn wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) {
        let ts = timeout.map(|t| libc::timespec {
            tv_sec: t.as_secs() as libc::time_t,
            tv_nsec: t.subsec_nanos() as libc::c_long,
        });
        let ts_ptr = ts
            .as_ref()
            .map_or(std::ptr::null(), |t| t as *const libc::timespec);
        unsafe {
            // FUTEX_WAIT without FUTEX_PRIVATE_FLAG: the word lives in a
            // shared mapping and peers in other processes must be woken.
            libc::syscall(
                libc::SYS_futex,
                word.as_ptr(),
                libc::FUTEX_WAIT,
                expected,
                ts_ptr,
            );
        }
    }

    pub fn wake_all(word: &AtomicU32) {
        unsafe {
            libc::syscall(libc::SYS_futex, word.as_ptr(), libc::FUTEX_WAKE, i32::MAX);
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod waiter {
    use super::*;

    /// Poll fallback: re-check after a short sleep. Correctness only
    /// depends on eventually re-reading the word, not on the wake side.
    pub fn wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) {
        let _ = timeout;
        if word.load(Ordering::Acquire) != expected {
            return;
        }
        std::thread::sleep(Duration::from_micros(50));
    }

    pub fn wake_all(_word: &AtomicU32) {}
}

/// View an i32 lock word as the u32 the wait primitive expects.
///
/// `AtomicI32` and `AtomicU32` have identical size and representation;
/// only the address and bit pattern matter to the waiter.
fn as_u32_word(word: &AtomicI32) -> &AtomicU32 {
    unsafe { &*(word as *const AtomicI32 as *const AtomicU32) }
}

// ---------------------------------------------------------------------------
// Line locks
// ---------------------------------------------------------------------------

/// Acquire a line lock in shared mode. Blocks indefinitely: shared
/// acquisitions are used by lookups and traversal, which never fail.
pub fn line_lock_shared(word: &AtomicI32) {
    loop {
        let v = word.load(Ordering::Acquire);
        if v > 0 {
            // Writer-held; sleep until the word changes.
            waiter::wait(as_u32_word(word), v as u32, Some(LINE_WAIT_SLICE));
            continue;
        }
        if word
            .compare_exchange_weak(v, v - 1, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }
    }
}

/// Release a shared line lock, waking writers once the count drains.
pub fn line_unlock_shared(word: &AtomicI32) {
    let prev = word.fetch_add(1, Ordering::AcqRel);
    if prev == -1 {
        waiter::wake_all(as_u32_word(word));
    }
}

/// Acquire a line lock exclusively, giving up at `deadline`.
///
/// Returns false on timeout; the caller must then release every line
/// lock it holds and restart (deadlock recovery).
pub fn line_lock_excl_until(word: &AtomicI32, deadline: Instant) -> bool {
    loop {
        let v = word.load(Ordering::Acquire);
        if v == 0 {
            if word
                .compare_exchange_weak(0, 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
            continue;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        let remaining = deadline - now;
        waiter::wait(
            as_u32_word(word),
            v as u32,
            Some(remaining.min(LINE_WAIT_SLICE)),
        );
    }
}

/// One-shot exclusive attempt, used by the free-slot scan to skip
/// contended candidates instead of waiting on them.
pub fn line_try_lock_excl(word: &AtomicI32) -> bool {
    word.compare_exchange(0, 1, Ordering::AcqRel, Ordering::Relaxed)
        .is_ok()
}

/// Release an exclusive line lock.
pub fn line_unlock_excl(word: &AtomicI32) {
    word.store(0, Ordering::Release);
    waiter::wake_all(as_u32_word(word));
}

/// Upper bound on a single sleep inside a lock loop, so deadlines and
/// fallback polling stay responsive.
const LINE_WAIT_SLICE: Duration = Duration::from_millis(2);

// ---------------------------------------------------------------------------
// Global gates
// ---------------------------------------------------------------------------

/// Acquire a gate in shared mode. Blocks while the exclusive flag is
/// set, then increments the shared count.
pub fn gate_shared_acquire(word: &AtomicU32) {
    loop {
        let v = word.load(Ordering::Acquire);
        if v & GATE_EXCL != 0 {
            waiter::wait(word, v, Some(LINE_WAIT_SLICE));
            continue;
        }
        if word
            .compare_exchange_weak(v, v + 1, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }
    }
}

/// Release a shared gate holding, waking an exclusive acquirer waiting
/// for the count to drain.
pub fn gate_shared_release(word: &AtomicU32) {
    let prev = word.fetch_sub(1, Ordering::AcqRel);
    if prev & GATE_COUNT == 1 {
        waiter::wake_all(word);
    }
}

/// Acquire a gate exclusively: claim the flag, then wait for the shared
/// count to drain to zero.
pub fn gate_excl_acquire(word: &AtomicU32) {
    loop {
        let v = word.load(Ordering::Acquire);
        if v & GATE_EXCL != 0 {
            waiter::wait(word, v, Some(LINE_WAIT_SLICE));
            continue;
        }
        if word
            .compare_exchange_weak(v, v | GATE_EXCL, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            break;
        }
    }
    loop {
        let v = word.load(Ordering::Acquire);
        if v & GATE_COUNT == 0 {
            return;
        }
        waiter::wait(word, v, Some(LINE_WAIT_SLICE));
    }
}

/// Release an exclusive gate holding.
pub fn gate_excl_release(word: &AtomicU32) {
    word.fetch_and(!GATE_EXCL, Ordering::AcqRel);
    waiter::wake_all(word);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, AtomicU32};
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn line_shared_then_excl() {
        let word = AtomicI32::new(0);
        line_lock_shared(&word);
        line_lock_shared(&word);
        assert_eq!(word.load(Ordering::Relaxed), -2);

        // A writer cannot get in while readers hold the word.
        let deadline = Instant::now() + Duration::from_millis(10);
        assert!(!line_lock_excl_until(&word, deadline));

        line_unlock_shared(&word);
        line_unlock_shared(&word);
        assert_eq!(word.load(Ordering::Relaxed), 0);

        let deadline = Instant::now() + Duration::from_millis(10);
        assert!(line_lock_excl_until(&word, deadline));
        assert_eq!(word.load(Ordering::Relaxed), 1);
        line_unlock_excl(&word);
    }

    #[test]
    fn line_excl_times_out_under_holder() {
        let word = AtomicI32::new(0);
        let deadline = Instant::now() + Duration::from_millis(50);
        assert!(line_lock_excl_until(&word, deadline));

        let start = Instant::now();
        let deadline = Instant::now() + Duration::from_millis(20);
        assert!(!line_lock_excl_until(&word, deadline));
        assert!(start.elapsed() >= Duration::from_millis(20));
        line_unlock_excl(&word);
    }

    #[test]
    fn try_lock_skips_contended_word() {
        let word = AtomicI32::new(0);
        assert!(line_try_lock_excl(&word));
        assert!(!line_try_lock_excl(&word));
        line_unlock_excl(&word);
        assert!(line_try_lock_excl(&word));
        line_unlock_excl(&word);
    }

    #[test]
    fn gate_exclusive_blocks_shared() {
        let word = Arc::new(AtomicU32::new(0));
        gate_excl_acquire(&word);
        assert_eq!(word.load(Ordering::Relaxed), GATE_EXCL);

        let w = word.clone();
        let handle = thread::spawn(move || {
            gate_shared_acquire(&w);
            gate_shared_release(&w);
        });

        // Give the thread a moment to hit the gate.
        thread::sleep(Duration::from_millis(50));
        assert!(!handle.is_finished());

        gate_excl_release(&word);
        handle.join().unwrap();
    }

    #[test]
    fn gate_exclusive_waits_for_shared_drain() {
        let word = Arc::new(AtomicU32::new(0));
        gate_shared_acquire(&word);

        let w = word.clone();
        let handle = thread::spawn(move || {
            gate_excl_acquire(&w);
            gate_excl_release(&w);
        });

        thread::sleep(Duration::from_millis(50));
        assert!(!handle.is_finished());

        gate_shared_release(&word);
        handle.join().unwrap();
        assert_eq!(word.load(Ordering::Relaxed), 0);
    }
}
