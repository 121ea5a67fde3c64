/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! C1 — the shared-state view (spec §4.1). A typed, atomic view over the
//! coordination words in `S`, with futex wait/notify and an async-wait
//! emulation on a single dedicated worker thread.

use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use linux_futex::{Futex, Shared};

use crate::process::{Slot, MIN_STATE_BYTES, NUM_SLOTS};
use crate::Error;

/// Outcome of a wait on a state word (spec §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The value changed and a notify arrived.
    Ok,
    /// The timeout elapsed with no observed change.
    TimedOut,
    /// The value already differed from `expected` at call time.
    NotEqual,
}

struct WaitRequest {
    base: usize,
    slot: Slot,
    expected: i32,
    timeout: Option<Duration>,
    responder: tokio::sync::oneshot::Sender<WaitOutcome>,
}

// SAFETY: `base` is a raw pointer into the shared-state region, which this
// writer never deallocates for the lifetime of the `Writer`; sending it
// across the worker thread boundary is the same access the owning thread
// already has.
unsafe impl Send for WaitRequest {}

/// Runs blocking futex waits one at a time off a request channel.
///
/// The source this specification was distilled from performs `Atomics.wait`
/// on a single dedicated worker thread, since its main thread cannot block.
/// This crate has no such restriction, but keeps the same shape: one
/// thread, one in-flight wait at a time, so async callers never block their
/// own executor on a cross-process futex.
struct WaitWorker {
    tx: mpsc::Sender<WaitRequest>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl WaitWorker {
    fn spawn() -> Self {
        let (tx, rx) = mpsc::channel::<WaitRequest>();
        let handle = std::thread::Builder::new()
            .name("shm-stream-writer-wait".into())
            .spawn(move || {
                for req in rx {
                    // SAFETY: see `WaitRequest`'s Send impl above.
                    let word = unsafe { word_at(req.base, req.slot) };
                    let outcome = blocking_wait(word, req.expected, req.timeout);
                    let _ = req.responder.send(outcome);
                }
            })
            .expect("failed to spawn shm-stream-writer wait worker");
        Self {
            tx,
            handle: Some(handle),
        }
    }
}

impl Drop for WaitWorker {
    fn drop(&mut self) {
        // Dropping `tx` (implicitly, by replacing the field's owner) closes
        // the channel, which ends the worker's `for req in rx` loop.
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// # Safety
/// `base` must point at the start of an array of at least [`NUM_SLOTS`]
/// `Futex<Shared>` words, valid and process-shared for as long as any
/// handle derived from it is used.
unsafe fn word_at<'a>(base: usize, slot: Slot) -> &'a Futex<Shared> {
    let ptr = base as *const Futex<Shared>;
    // SAFETY: forwarded from the caller.
    unsafe { &*ptr.add(slot as usize) }
}

fn blocking_wait(word: &Futex<Shared>, expected: i32, timeout: Option<Duration>) -> WaitOutcome {
    let cur = word.value.load(std::sync::atomic::Ordering::SeqCst);
    if cur != expected as u32 {
        return WaitOutcome::NotEqual;
    }
    match timeout {
        Some(t) => match word.wait_for(expected as u32, t) {
            Ok(()) => WaitOutcome::Ok,
            Err(_) => {
                // Re-check: a notify can race a timeout expiring.
                if word.value.load(std::sync::atomic::Ordering::SeqCst) != expected as u32 {
                    WaitOutcome::Ok
                } else {
                    WaitOutcome::TimedOut
                }
            }
        },
        None => {
            let _ = word.wait(expected as u32);
            WaitOutcome::Ok
        }
    }
}

/// A typed, atomic view over the shared-state region `S` (spec §3, §4.1).
///
/// Cheap to clone: every clone refers to the same underlying shared memory
/// and the same dedicated wait worker.
#[derive(Clone)]
pub struct SharedState {
    base: usize,
    worker: Arc<WaitWorker>,
}

// SAFETY: `base` is a raw pointer into process-shared memory. All access
// goes through `Futex<Shared>`'s atomic operations; there is no unsynchronized
// byte access behind this type.
unsafe impl Send for SharedState {}
unsafe impl Sync for SharedState {}

impl SharedState {
    /// # Safety
    /// `base` must point at a process-shareable, 4-byte-aligned region of at
    /// least `len` bytes, live for as long as any clone of the returned
    /// `SharedState` (and any `Writer` built from it) is in use. No other
    /// writer may concurrently mutate the `WRITE_*` slots.
    pub unsafe fn from_raw(base: *mut u8, len: usize) -> Result<Self, Error> {
        if len < MIN_STATE_BYTES {
            return Err(Error::InvalidRegion(
                "shared-state region shorter than 128 bytes",
            ));
        }
        if (base as usize) % std::mem::align_of::<Futex<Shared>>() != 0 {
            return Err(Error::InvalidRegion("shared-state region misaligned"));
        }
        Ok(Self {
            base: base as usize,
            worker: Arc::new(WaitWorker::spawn()),
        })
    }

    fn word(&self, slot: Slot) -> &Futex<Shared> {
        // SAFETY: validated at construction; `self.base` outlives `self`.
        unsafe { word_at(self.base, slot) }
    }

    pub fn load(&self, slot: Slot) -> i32 {
        self.word(slot).value.load(std::sync::atomic::Ordering::SeqCst) as i32
    }

    pub fn store(&self, slot: Slot, value: i32) {
        self.word(slot)
            .value
            .store(value as u32, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn notify(&self, slot: Slot) {
        self.word(slot).wake(i32::MAX);
    }

    /// Blocking wait, for use from `write_sync` and `end()`'s bounded spin.
    pub fn wait(&self, slot: Slot, expected: i32, timeout: Option<Duration>) -> WaitOutcome {
        blocking_wait(self.word(slot), expected, timeout)
    }

    /// Async wait, emulated on the dedicated wait worker (spec §4.1, §5).
    pub async fn wait_async(
        &self,
        slot: Slot,
        expected: i32,
        timeout: Option<Duration>,
    ) -> WaitOutcome {
        if self.load(slot) != expected {
            return WaitOutcome::NotEqual;
        }
        let (tx, rx) = tokio::sync::oneshot::channel();
        let req = WaitRequest {
            base: self.base,
            slot,
            expected,
            timeout,
            responder: tx,
        };
        if self.worker.tx.send(req).is_err() {
            return WaitOutcome::TimedOut;
        }
        rx.await.unwrap_or(WaitOutcome::TimedOut)
    }
}

/// The shared byte region `B` (spec §3). Only [`crate::framer::RingFramer`]
/// writes through this.
#[derive(Clone, Copy)]
pub struct SharedBuffer {
    base: *mut u8,
    len: usize,
}

// SAFETY: the only writer of `B` is the single `RingFramer` owned by this
// writer's `WriteEngine`; reads belong to the external Reader and are
// synchronized through `WRITE_INDEX`'s release-style publication (spec §3
// invariant 5).
unsafe impl Send for SharedBuffer {}
unsafe impl Sync for SharedBuffer {}

impl SharedBuffer {
    /// # Safety
    /// `base` must point at a process-shareable region of at least `len`
    /// bytes, writable for the lifetime of any `SharedBuffer` built from it,
    /// and not concurrently written by anyone other than this writer.
    pub unsafe fn from_raw(base: *mut u8, len: usize, extra_space: usize) -> Result<Self, Error> {
        if len <= extra_space + 1 {
            return Err(Error::InvalidRegion(
                "shared-buffer region too small for even one empty frame",
            ));
        }
        Ok(Self { base, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// # Safety
    /// `offset + bytes.len() <= self.len()` and no other writer is
    /// concurrently writing this range.
    pub unsafe fn write_at(&self, offset: usize, bytes: &[u8]) {
        debug_assert!(offset + bytes.len() <= self.len);
        // SAFETY: forwarded from the caller; `self.base` is valid for
        // `self.len` bytes per construction.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.base.add(offset), bytes.len());
        }
    }
}
