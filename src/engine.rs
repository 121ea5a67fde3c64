/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! C3 — the write engine (spec §4.3). Drives the ring framer, decides
//! sync-spin vs async-buffer vs wrap vs split, and manages the overflow
//! queue.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::core_state::Core;
use crate::events::Event;
use crate::framer::RingFramer;
use crate::process::Slot;
use crate::state::WaitOutcome;
use crate::Error;

/// The outcome of classifying the current cursor/cycle against the
/// reader's published position (spec §4.3 steps 2-4).
enum Case {
    /// No space, reader behind us in the same ring position.
    Full { read_index: i32 },
    /// No space, reader ahead of us: wrap.
    Wrap,
    /// Payload larger than the remaining contiguous space.
    Split { leftover: usize },
    /// Payload fits in the remaining contiguous space.
    Fits,
}

struct EngineInner {
    write_cursor: usize,
    cycle: u32,
    overflow_queue: VecDeque<Vec<u8>>,
}

/// C3. Owns the writer-local cursor/cycle and the overflow queue; the only
/// component that decides when to wrap, split, buffer, or block.
pub struct WriteEngine {
    core: Arc<Core>,
    framer: RingFramer,
    buffer_len: usize,
    inner: Mutex<EngineInner>,
    /// Mirrors spec §4.3's "rebind the public write entry point" as an
    /// explicit mode flag (spec §9 "Public entry rebinding") instead of a
    /// function-pointer swap. A `watch` channel rather than a bare
    /// `AtomicBool` so `wait_until_drained` can await the transition to
    /// `false` directly, instead of re-subscribing to the public event
    /// broadcast (which would race an external caller also draining it).
    buffering: tokio::sync::watch::Sender<bool>,
}

impl WriteEngine {
    pub fn new(core: Arc<Core>, framer: RingFramer) -> Self {
        let buffer_len = framer.buffer_len();
        Self {
            core,
            framer,
            buffer_len,
            inner: Mutex::new(EngineInner {
                write_cursor: 0,
                cycle: 0,
                overflow_queue: VecDeque::new(),
            }),
            buffering: tokio::sync::watch::Sender::new(false),
        }
    }

    pub fn write_cursor(&self) -> usize {
        self.inner.lock().unwrap().write_cursor
    }

    pub fn cycle(&self) -> u32 {
        self.inner.lock().unwrap().cycle
    }

    pub fn need_drain(&self) -> bool {
        *self.buffering.borrow()
    }

    /// Resolves once the overflow queue has fully drained (spec §4.3.1).
    /// Settles immediately if it already has. Used by the lifecycle
    /// controller's end-after-drain handshake (spec §4.4 step 2) instead of
    /// subscribing to the public event stream, so it never races an
    /// external caller independently listening for `Drain`.
    pub async fn wait_until_drained(&self) {
        let mut rx = self.buffering.subscribe();
        loop {
            if !*rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn queue_is_empty(&self) -> bool {
        self.inner.lock().unwrap().overflow_queue.is_empty()
    }

    /// `write(payload)`: asynchronous, never blocks (spec §4.3 public
    /// contract).
    pub async fn write(self: &Arc<Self>, payload: impl Into<Vec<u8>>) -> bool {
        let payload = payload.into();
        if self.need_drain() {
            self.inner.lock().unwrap().overflow_queue.push_back(payload);
            return true;
        }
        match self.place(payload).await {
            Ok(backpressure) => backpressure,
            Err(err) => {
                self.fail(err).await;
                false
            }
        }
    }

    /// `write_sync(payload)`: may block the calling thread (spec §4.3).
    pub fn write_sync(self: &Arc<Self>, payload: impl Into<Vec<u8>>) -> bool {
        let payload = payload.into();
        if self.need_drain() {
            self.inner.lock().unwrap().overflow_queue.push_back(payload);
            return true;
        }
        match self.place_blocking(payload) {
            Ok(backpressure) => backpressure,
            Err(err) => {
                let this = Arc::clone(self);
                // `write_sync` itself is synchronous; hand the fatal error
                // to the async destroy path on a detached task, matching
                // the "all errors surface through destroy" policy (spec §7)
                // without forcing every sync caller onto an async runtime
                // just to observe the teardown.
                tokio::spawn(async move { this.fail(err).await });
                false
            }
        }
    }

    /// `flush()`: attempts to drain the overflow queue, returns whether it
    /// fully drained (spec §4.3 public contract).
    pub async fn flush(self: &Arc<Self>) -> bool {
        self.drain().await;
        !self.need_drain()
    }

    async fn fail(self: &Arc<Self>, err: Error) {
        log::error!("shm-stream-writer write engine fault: {err}");
        self.core.destroy(Some(err)).await;
    }

    fn classify(&self, write_cursor: usize, cycle: u32, payload_len: usize) -> Result<Case, Error> {
        let r = self.core.state.load(Slot::ReadIndex);
        let rc = self.core.state.load(Slot::ReadCycle);
        let behind = (r as usize) > write_cursor || (rc as u32) < cycle;
        let bound = if behind { r as usize } else { self.buffer_len };

        if bound < write_cursor {
            return Err(Error::Corrupted {
                reason: "overwritten",
                write_cursor,
                bound,
            });
        }
        if rc as u32 > cycle {
            return Err(Error::Corrupted {
                reason: "reader ahead",
                write_cursor,
                bound,
            });
        }

        let extra = self.core.config.extra_space();
        let leftover = bound as isize - write_cursor as isize - extra as isize - 1;

        if leftover <= 0 {
            if behind {
                Ok(Case::Full { read_index: r })
            } else {
                Ok(Case::Wrap)
            }
        } else if (leftover as usize) < payload_len {
            // `leftover` already reserves one frame's overhead (spec §4.3
            // step 3); the split threshold therefore compares it directly
            // against the payload length, matching the testable property
            // in spec §8 ("split law") and scenario S6, where a payload of
            // exactly `|B| - EXTRA_SPACE - 1` bytes must NOT split. See
            // DESIGN.md for why this diverges from the literal `leftover <
            // |payload| + EXTRA_SPACE` wording in spec §4.3 step 7.
            Ok(Case::Split {
                leftover: leftover as usize,
            })
        } else {
            Ok(Case::Fits)
        }
    }

    fn do_wrap(&self, inner: &mut EngineInner) {
        // Order follows spec §4.3 step 6 literally: WRITE_INDEX=0 is
        // published before WRITE_CYCLE advances, so a reader never
        // observes the new cycle paired with a stale nonzero write index.
        self.core.state.store(Slot::WriteIndex, 0);
        inner.cycle += 1;
        self.core.state.store(Slot::WriteCycle, inner.cycle as i32);
        self.core.state.notify(Slot::WriteIndex);
        inner.write_cursor = 0;
        log::debug!("shm-stream-writer wrapped to cycle {}", inner.cycle);
    }

    /// The async variant of the Case A-D automaton (spec §4.3 steps 1-8).
    async fn place(self: &Arc<Self>, mut payload: Vec<u8>) -> Result<bool, Error> {
        loop {
            if !self.core.writable() {
                return Ok(false);
            }
            let (wc, cycle) = {
                let inner = self.inner.lock().unwrap();
                (inner.write_cursor, inner.cycle)
            };
            match self.classify(wc, cycle, payload.len())? {
                Case::Full { read_index } => {
                    // Check without awaiting: if the reader has already
                    // moved on, resolve synchronously and recurse (spec
                    // §4.3 step 5 async branch, "resolves synchronously").
                    // Only register a continuation when a real suspension
                    // is needed.
                    if self.core.state.load(Slot::ReadIndex) != read_index {
                        continue;
                    }
                    let _ = self.buffering.send(true);
                    self.inner.lock().unwrap().overflow_queue.push_back(payload);
                    let this = Arc::clone(self);
                    let state = self.core.state.clone();
                    let spin_timeout = self.core.config.spin_timeout;
                    tokio::spawn(async move {
                        // Spin on a bounded timeout rather than waiting
                        // forever: a reader that vanishes while this writer
                        // is destroyed must not leave the wait worker
                        // parked in an unkillable futex syscall.
                        loop {
                            if !this.core.writable() {
                                return;
                            }
                            match state
                                .wait_async(Slot::ReadIndex, read_index, Some(spin_timeout))
                                .await
                            {
                                WaitOutcome::TimedOut => continue,
                                WaitOutcome::Ok | WaitOutcome::NotEqual => break,
                            }
                        }
                        this.drain().await;
                    });
                    return Ok(true);
                }
                Case::Wrap => {
                    self.do_wrap(&mut self.inner.lock().unwrap());
                    continue;
                }
                Case::Split { leftover } => {
                    let head: Vec<u8> = payload.drain(..leftover).collect();
                    let next_cursor = self.framer.store(wc, &head, true);
                    self.inner.lock().unwrap().write_cursor = next_cursor;
                    continue;
                }
                Case::Fits => {
                    let next_cursor = self.framer.store(wc, &payload, false);
                    self.inner.lock().unwrap().write_cursor = next_cursor;
                    return Ok(false);
                }
            }
        }
    }

    /// The blocking variant of the Case A-D automaton, used by
    /// `write_sync`.
    fn place_blocking(self: &Arc<Self>, mut payload: Vec<u8>) -> Result<bool, Error> {
        loop {
            if !self.core.writable() {
                return Ok(false);
            }
            let (wc, cycle) = {
                let inner = self.inner.lock().unwrap();
                (inner.write_cursor, inner.cycle)
            };
            match self.classify(wc, cycle, payload.len())? {
                Case::Full { read_index } => {
                    let mut spins = 0u32;
                    loop {
                        if spins >= self.core.config.read_spins {
                            return Err(Error::ReadTooLong);
                        }
                        let outcome = self.core.state.wait(
                            Slot::ReadIndex,
                            read_index,
                            Some(self.core.config.spin_timeout),
                        );
                        spins += 1;
                        if !matches!(outcome, WaitOutcome::TimedOut) {
                            break;
                        }
                    }
                    continue;
                }
                Case::Wrap => {
                    self.do_wrap(&mut self.inner.lock().unwrap());
                    continue;
                }
                Case::Split { leftover } => {
                    let head: Vec<u8> = payload.drain(..leftover).collect();
                    let next_cursor = self.framer.store(wc, &head, true);
                    self.inner.lock().unwrap().write_cursor = next_cursor;
                    continue;
                }
                Case::Fits => {
                    let next_cursor = self.framer.store(wc, &payload, false);
                    self.inner.lock().unwrap().write_cursor = next_cursor;
                    return Ok(false);
                }
            }
        }
    }

    /// Drains the overflow queue in FIFO order (spec §4.3.1).
    pub async fn drain(self: &Arc<Self>) {
        loop {
            let next = self.inner.lock().unwrap().overflow_queue.pop_front();
            let Some(payload) = next else { break };
            match self.place(payload).await {
                Ok(true) => {
                    // Backpressure again: `place` already re-armed a waiter
                    // that will re-enter `drain` on the next wake.
                    return;
                }
                Ok(false) => continue,
                Err(err) => {
                    self.fail(err).await;
                    return;
                }
            }
        }
        let _ = self.buffering.send(false);
        self.core.emit(Event::Drain).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::core_state::Core;
    use crate::events;
    use crate::framer::RingFramer;
    use crate::state::{SharedBuffer, SharedState};
    use std::alloc::{alloc_zeroed, Layout};

    fn make_engine(buf_len: usize) -> (Arc<WriteEngine>, Vec<u8>, SharedState) {
        let layout = Layout::from_size_align(128, 8).unwrap();
        let state_base = unsafe { alloc_zeroed(layout) };
        let state = unsafe { SharedState::from_raw(state_base, 128).unwrap() };
        let mut backing = vec![0u8; buf_len];
        let mut config = Config::default();
        // Keep any spin loop a test's background tasks fall into short,
        // since nothing here ever notifies READ_INDEX.
        config.spin_timeout = std::time::Duration::from_millis(20);
        let buffer =
            unsafe { SharedBuffer::from_raw(backing.as_mut_ptr(), backing.len(), config.extra_space()).unwrap() };

        let tx = events::channel();
        let core = Arc::new(Core::new(state.clone(), config, tx));
        let framer = RingFramer::new(buffer, state.clone(), config);
        (Arc::new(WriteEngine::new(core, framer)), backing, state)
    }

    #[tokio::test]
    async fn fits_advances_write_cursor_without_split() {
        let (engine, backing, state) = make_engine(64);
        let backpressure = engine.write(b"hello".to_vec()).await;
        assert!(!backpressure);
        assert_eq!(&backing[4..9], b"hello");
        assert_eq!(state.load(Slot::WriteIndex), engine.write_cursor() as i32);
    }

    #[tokio::test]
    async fn wraps_when_the_tail_is_too_small_and_the_reader_has_room() {
        // bound=64, extra_space=4 (4 prefix + 0 postfix), +1 for NOT_FINAL.
        // Not enough room before the end of the buffer at cursor 60, but the
        // reader (at 50, same cycle) leaves plenty of room after a wrap to 0.
        let (engine, _backing, state) = make_engine(64);
        state.store(Slot::ReadIndex, 50);
        state.store(Slot::ReadCycle, 0);
        {
            let mut inner = engine_inner_for_test(&engine);
            inner.write_cursor = 60;
            inner.cycle = 0;
        }
        let backpressure = engine.write(b"abc".to_vec()).await;
        assert!(!backpressure);
        assert_eq!(engine.write_cursor(), 8); // wrapped to 0, then wrote prefix+3+postfix+1
        assert_eq!(engine.cycle(), 1);
    }

    fn engine_inner_for_test(engine: &Arc<WriteEngine>) -> std::sync::MutexGuard<'_, EngineInner> {
        engine.inner.lock().unwrap()
    }

    #[tokio::test]
    async fn splits_a_payload_and_buffers_the_remainder_with_no_reader() {
        let (engine, backing, _state) = make_engine(20);
        // extra_space=4, buffer=20: fits at most 15 payload bytes from
        // cursor 0 without a split (leftover = 20-0-4-1 = 15). A split
        // always consumes exactly the remaining contiguous space, so the
        // next frame has nowhere to go without a reader advancing
        // READ_INDEX; this one queues and reports backpressure.
        let payload = vec![7u8; 16];
        let backpressure = engine.write(payload).await;
        assert!(backpressure);
        assert!(engine.need_drain());
        // First chunk carries the NOT_FINAL marker.
        assert_eq!(backing[4 + 15], 1);
        assert_eq!(engine.write_cursor(), 0);
        assert_eq!(engine.cycle(), 1);
    }

    // Scenario S2 (spec §8): |B|=16, reader stalled at READ_INDEX=0, write
    // a 16-byte payload. The literal per-step Case A-D algorithm (classify
    // on `leftover`, not on whether the whole payload fits the whole
    // buffer) finds leftover=11 at cursor 0, which is nonzero, so it takes
    // Case C (split) before it ever reaches a "no space" case: an 11-byte
    // head frame is written (the only bytes that fit before the end of the
    // ring), then the wrap/Case-A path queues the 5-byte remainder. This
    // differs from S2's literal table ("no frame written", whole string
    // queued) while still satisfying every invariant in §3 and the split
    // law in §8; see DESIGN.md ("Open Question decisions" / S2) for why
    // this crate follows the algorithm over the table's shorthand.
    #[tokio::test]
    async fn s2_stalled_reader_splits_the_tail_that_fits_then_queues_the_remainder() {
        let (engine, backing, state) = make_engine(16);
        state.store(Slot::ReadIndex, 0);
        state.store(Slot::ReadCycle, 0);

        let payload = b"hello world 1234".to_vec();
        assert_eq!(payload.len(), 16);
        let backpressure = engine.write(payload).await;

        assert!(backpressure);
        assert!(engine.need_drain());
        assert_eq!(&backing[0..4], &11u32.to_le_bytes());
        assert_eq!(&backing[4..15], b"hello world");
        assert_eq!(backing[15], 1); // NOT_FINAL=1: a split head, not a complete frame
        assert_eq!(engine.write_cursor(), 0); // wrapped after the head filled the ring
        assert_eq!(engine.cycle(), 1);
    }

    // Scenario S3 (spec §8): |B|=16, write_cursor=10, reader ahead at
    // READ_INDEX=4 in the same cycle, write_sync("ABCDEFGH"). `classify()`
    // against these exact numbers does not land on S3's table outcome (a
    // single post-wrap frame): at cursor 10, leftover = 16-10-4-1 = 1,
    // which is positive, so Case C (split) fires first and writes a
    // 1-byte head ("A", NOT_FINAL=1) before any wrap happens. Only then
    // does the wrap occur; the remaining 7 bytes re-classify at the
    // post-wrap cursor 0 as Case A (full, reader behind) against
    // READ_INDEX=4, which spins and exhausts `ReadTooLong` since this
    // test's reader never advances. See DESIGN.md ("Open Question
    // decisions" / S3) for why this crate follows the algorithm over the
    // table's shorthand, same as S2.
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn s3_literal_numbers_split_then_wrap_then_spin_on_the_reader() {
        let (engine, backing, state) = make_engine(16);
        state.store(Slot::ReadIndex, 4);
        state.store(Slot::ReadCycle, 0);
        {
            let mut inner = engine_inner_for_test(&engine);
            inner.write_cursor = 10;
            inner.cycle = 0;
        }

        let backpressure = engine.write_sync(b"ABCDEFGH".to_vec());

        assert!(!backpressure);
        assert_eq!(&backing[10..14], &1u32.to_le_bytes());
        assert_eq!(&backing[14..15], b"A");
        assert_eq!(backing[15], 1); // NOT_FINAL=1: a split head, not S3's single frame
        assert_eq!(engine.write_cursor(), 0); // wrapped after the head consumed the tail
        assert_eq!(engine.cycle(), 1);

        // write_sync's error path hands the fault to a detached destroy
        // task rather than blocking the caller on it; wait for it to land.
        tokio::time::timeout(std::time::Duration::from_secs(2), async {
            while !engine.core.is_destroyed() {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("write_sync's ReadTooLong fault should reach destroy");

        assert_eq!(engine.core.last_error(), Some(Error::ReadTooLong));
    }

    // Scenario S6 (spec §8): a payload of exactly `|B| - EXTRA_SPACE - 1`
    // bytes must produce a single unsplit frame (NOT_FINAL=0), not a split.
    // This is the exact boundary the double-counted `extra_space() + 1`
    // regression used to miss: |B|=64, EXTRA_SPACE=4, so leftover must be
    // 64-0-4-1=59, matching the payload length exactly (leftover < len is
    // false, so Case::Fits, not Case::Split).
    #[tokio::test]
    async fn exact_fit_payload_does_not_split() {
        let (engine, backing, state) = make_engine(64);
        let payload = vec![9u8; 59];

        let backpressure = engine.write(payload.clone()).await;

        assert!(!backpressure);
        assert!(!engine.need_drain());
        assert_eq!(&backing[0..4], &59u32.to_le_bytes());
        assert_eq!(&backing[4..63], payload.as_slice());
        assert_eq!(backing[63], 0); // NOT_FINAL=0, no split
        assert_eq!(engine.write_cursor(), 64);
        assert_eq!(state.load(Slot::WriteIndex), 64);
        assert_eq!(engine.cycle(), 0);
    }

    #[tokio::test]
    async fn wait_until_drained_settles_immediately_when_nothing_is_buffered() {
        let (engine, _backing, _state) = make_engine(64);
        assert!(!engine.need_drain());
        // Must not hang: there is no reader to ever flip the flag.
        engine.wait_until_drained().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn wait_until_drained_resolves_once_the_overflow_queue_empties() {
        let (engine, _backing, state) = make_engine(20);
        let payload = vec![7u8; 16];
        let backpressure = engine.write(payload).await;
        assert!(backpressure);
        assert!(engine.need_drain());

        let waiter = Arc::clone(&engine);
        let waited = tokio::spawn(async move {
            waiter.wait_until_drained().await;
        });

        // Let the reader "catch up" so the backpressure task's spin loop
        // observes READ_INDEX moving and drains the queue.
        state.store(Slot::ReadIndex, 20);
        state.notify(Slot::ReadIndex);

        tokio::time::timeout(std::time::Duration::from_secs(1), waited)
            .await
            .expect("wait_until_drained should resolve once the queue drains")
            .unwrap();
        assert!(!engine.need_drain());
    }
}
