/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! The public `Writer` type: composes C1-C4 (spec §2) behind the external
//! interface of spec §6.

use std::sync::Arc;

use crate::config::Config;
use crate::core_state::Core;
use crate::engine::WriteEngine;
use crate::events::{self, EventReceiver};
use crate::framer::RingFramer;
use crate::lifecycle::LifecycleController;
use crate::state::{SharedBuffer, SharedState};
use crate::Error;

/// The writer side of a shared-memory byte stream (spec §1).
///
/// Owns the writer-local cursor/cycle, the overflow queue, and the
/// lifecycle state machine. The companion Reader is an external
/// collaborator (spec §1, §6) this crate never constructs.
pub struct Writer {
    core: Arc<Core>,
    engine: Arc<WriteEngine>,
    lifecycle: Arc<LifecycleController>,
}

impl Writer {
    /// Builds a writer over externally-allocated shared-state and
    /// shared-buffer regions.
    ///
    /// # Safety
    /// - `state_base` must point at a process-shareable, 4-byte-aligned
    ///   region of at least `state_len` bytes (spec §6: `state_len >=
    ///   128`), live for as long as this `Writer` (and anything cloned
    ///   from its internals) exists. No other writer may concurrently
    ///   mutate the `WRITE_*` slots in this region.
    /// - `buffer_base` must point at a process-shareable region of at
    ///   least `buffer_len` bytes (spec §6: `buffer_len >
    ///   config.extra_space() + 1`), writable for the same duration, with
    ///   no other writer of it.
    pub unsafe fn new(
        state_base: *mut u8,
        state_len: usize,
        buffer_base: *mut u8,
        buffer_len: usize,
        config: Config,
    ) -> Result<Self, Error> {
        // SAFETY: forwarded from the caller.
        let state = unsafe { SharedState::from_raw(state_base, state_len)? };
        // SAFETY: forwarded from the caller.
        let buffer = unsafe {
            SharedBuffer::from_raw(buffer_base, buffer_len, config.extra_space())?
        };

        let events_tx = events::channel();
        let core = Arc::new(Core::new(state, config, events_tx));

        let framer = RingFramer::new(buffer, core.state.clone(), config);
        let engine = Arc::new(WriteEngine::new(Arc::clone(&core), framer));
        let lifecycle = LifecycleController::new(Arc::clone(&core), Arc::clone(&engine));

        Ok(Self {
            core,
            engine,
            lifecycle,
        })
    }

    /// Startup handshake (spec §4.4). Must be called once before the peer
    /// is considered attached; `write`/`write_sync` are usable beforehand
    /// but will simply queue behind the ring until a Reader shows up.
    pub async fn synchronize(&self) -> Result<(), Error> {
        self.lifecycle.synchronize().await
    }

    /// Asynchronous write; never blocks (spec §4.3). Returns `true` if the
    /// caller should stop producing until the next `drain` event.
    pub async fn write(&self, payload: impl Into<Vec<u8>>) -> bool {
        self.engine.write(payload).await
    }

    /// Synchronous write; may block the calling thread on the shared
    /// state word (spec §4.3).
    pub fn write_sync(&self, payload: impl Into<Vec<u8>>) -> bool {
        self.engine.write_sync(payload)
    }

    /// Attempts to drain the overflow queue; returns whether it fully
    /// drained (spec §4.3 public contract).
    pub async fn flush(&self) -> bool {
        self.engine.flush().await
    }

    /// Orderly end (spec §4.4).
    pub async fn end(&self) {
        self.lifecycle.end().await
    }

    /// Unconditional teardown (spec §4.4). Pass `None` for a clean
    /// destroy, `Some(err)` to report a fault.
    pub async fn destroy(&self, err: Option<Error>) {
        self.lifecycle.destroy(err).await
    }

    /// The lifecycle event stream (`ready`, `drain`, `finish`, `error`,
    /// `close`; spec §6). Each call hands out a fresh, independent
    /// broadcast subscription: the returned receiver sees every event
    /// emitted *after* this call, not anything emitted earlier, so
    /// subscribe before driving the writer if you need `Ready`.
    pub fn events(&self) -> EventReceiver {
        self.core.subscribe_events()
    }

    // ---- Observable attributes (spec §6) ----

    pub fn writable(&self) -> bool {
        self.core.writable()
    }

    pub fn writable_ended(&self) -> bool {
        self.core.is_ending()
    }

    pub fn writable_finished(&self) -> bool {
        self.core.is_finished()
    }

    pub fn writable_errored(&self) -> bool {
        self.core.is_errored()
    }

    pub fn ready(&self) -> bool {
        self.core.is_ready()
    }

    pub fn closed(&self) -> bool {
        self.core.is_closed()
    }

    pub fn writable_need_drain(&self) -> bool {
        self.engine.need_drain()
    }

    /// Always `false`: this writer only ever speaks length-prefixed byte
    /// frames (spec §6).
    pub fn writable_object_mode(&self) -> bool {
        false
    }

    /// The last fatal error recorded, if any. Complements the one-shot
    /// [`crate::Event::Error`] for callers that attach to [`Writer::events`]
    /// after the writer has already destroyed.
    pub fn last_error(&self) -> Option<Error> {
        self.core.last_error()
    }

    /// The writer-local write cursor (spec §3). Diagnostic only.
    pub fn write_cursor(&self) -> usize {
        self.engine.write_cursor()
    }

    /// The writer-local wrap counter (spec §3). Diagnostic only.
    pub fn cycle(&self) -> u32 {
        self.engine.cycle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{ProcessSign, Slot};
    use crate::Event;
    use std::time::Duration;

    // Leaked on purpose: these tests hand out raw pointers that must
    // outlive the `Writer` built from them, which is simplest to express
    // as a 'static allocation rather than threading lifetimes through.
    fn shared_regions(buf_len: usize) -> (*mut u8, &'static mut [u8]) {
        let state = vec![0u8; 128].leak();
        let buffer = vec![0u8; buf_len].leak();
        (state.as_mut_ptr(), buffer)
    }

    #[test]
    fn observable_attributes_default_to_a_fresh_unready_writer() {
        let (state_ptr, buffer) = shared_regions(64);
        let writer = unsafe {
            Writer::new(state_ptr, 128, buffer.as_mut_ptr(), buffer.len(), Config::default())
        }
        .unwrap();

        assert!(writer.writable());
        assert!(!writer.ready());
        assert!(!writer.closed());
        assert!(!writer.writable_object_mode());
    }

    #[test]
    fn new_rejects_undersized_regions() {
        let (state_ptr, buffer) = shared_regions(64);

        let too_short_state =
            unsafe { Writer::new(state_ptr, 4, buffer.as_mut_ptr(), buffer.len(), Config::default()) };
        assert!(matches!(too_short_state, Err(Error::InvalidRegion(_))));

        let tiny_buffer = vec![0u8; 1].leak();
        let too_short_buffer =
            unsafe { Writer::new(state_ptr, 128, tiny_buffer.as_mut_ptr(), tiny_buffer.len(), Config::default()) };
        assert!(matches!(too_short_buffer, Err(Error::InvalidRegion(_))));
    }

    // End-to-end: attach, write a frame synchronously, then run an orderly
    // end against a reader that immediately finishes (spec §8 S1 + S5).
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn synchronize_write_and_end_round_trip() {
        let (state_ptr, buffer) = shared_regions(64);
        let mut config = Config::default();
        config.spin_timeout = Duration::from_millis(20);
        let writer =
            unsafe { Writer::new(state_ptr, 128, buffer.as_mut_ptr(), buffer.len(), config) }.unwrap();

        // SAFETY: test-only access to the same region handed to the writer,
        // standing in for the external Reader this crate never constructs.
        let reader_state = unsafe { crate::state::SharedState::from_raw(state_ptr, 128).unwrap() };
        reader_state.store(Slot::ReadProcess, ProcessSign::Ready.into());

        // Subscribe before driving the handshake: a broadcast subscriber
        // only sees events sent after it subscribes.
        let events = writer.events();

        writer.synchronize().await.unwrap();
        assert!(writer.ready());

        let backpressure = writer.write_sync(b"AB".to_vec());
        assert!(!backpressure);
        assert_eq!(&buffer[0..4], &2u32.to_le_bytes());
        assert_eq!(&buffer[4..6], b"AB");
        assert_eq!(buffer[6], 0);
        assert_eq!(writer.write_cursor(), 7);

        let acking = reader_state.clone();
        tokio::spawn(async move {
            reader_state.store(Slot::ReadIndex, 7);
            reader_state.notify(Slot::ReadIndex);
            tokio::time::sleep(Duration::from_millis(10)).await;
            acking.store(Slot::ReadProcess, ProcessSign::Finished.into());
            acking.notify(Slot::ReadProcess);
        });

        writer.end().await;

        assert!(writer.writable_finished());
        assert!(!writer.writable_errored());

        // A clean `end()` only reaches FINISHED (spec §4.4 "Orderly end");
        // `closed` is reserved for `destroy`, which the embedding caller
        // invokes separately to finalize teardown once it observes `finish`.
        assert!(!writer.closed());
        writer.destroy(None).await;
        assert!(writer.closed());

        assert_eq!(events.recv().await.unwrap(), Event::Ready);
        assert_eq!(events.recv().await.unwrap(), Event::Finish);
        assert_eq!(events.recv().await.unwrap(), Event::Close);
    }
}
