/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! Fields shared between the write engine (C3) and the lifecycle
//! controller (C4): the observable attributes of spec §6 and the event
//! sink both components emit through.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::config::Config;
use crate::events::{Event, EventReceiver};
use crate::process::{ProcessSign, Slot};
use crate::state::SharedState;
use crate::Error;

/// State shared by [`crate::engine::WriteEngine`] and
/// [`crate::lifecycle::LifecycleController`], and read by
/// [`crate::Writer`]'s observable-attribute accessors.
pub struct Core {
    pub state: SharedState,
    pub config: Config,
    events_tx: tokio::sync::broadcast::Sender<Event>,

    ready: AtomicBool,
    ending: AtomicBool,
    ended: AtomicBool,
    finished: AtomicBool,
    errored: AtomicBool,
    destroyed: AtomicBool,
    closed: AtomicBool,
    watching: AtomicBool,

    last_error: Mutex<Option<Error>>,
}

impl Core {
    pub fn new(
        state: SharedState,
        config: Config,
        events_tx: tokio::sync::broadcast::Sender<Event>,
    ) -> Self {
        Self {
            state,
            config,
            events_tx,
            ready: AtomicBool::new(false),
            ending: AtomicBool::new(false),
            ended: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            errored: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            watching: AtomicBool::new(false),
            last_error: Mutex::new(None),
        }
    }

    pub fn writable(&self) -> bool {
        !self.destroyed.load(Ordering::SeqCst) && !self.ending.load(Ordering::SeqCst)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn is_ending(&self) -> bool {
        self.ending.load(Ordering::SeqCst)
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    pub fn is_errored(&self) -> bool {
        self.errored.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_watching(&self) -> bool {
        self.watching.load(Ordering::SeqCst)
    }

    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    pub fn set_ending(&self) {
        self.ending.store(true, Ordering::SeqCst);
    }

    pub fn set_finished_ended(&self) {
        self.finished.store(true, Ordering::SeqCst);
        self.ended.store(true, Ordering::SeqCst);
    }

    pub fn set_watching(&self, value: bool) {
        self.watching.store(value, Ordering::SeqCst);
    }

    pub fn record_error(&self, err: Error) {
        self.errored.store(true, Ordering::SeqCst);
        *self.last_error.lock().unwrap() = Some(err);
    }

    pub fn last_error(&self) -> Option<Error> {
        self.last_error.lock().unwrap().clone()
    }

    /// Broadcasts `event` to every current subscriber (spec §6, §9 "Event
    /// emission"). A `send` error here only means nobody is currently
    /// subscribed via [`crate::Writer::events`]; there is no queue to
    /// preserve the event for, so it is dropped, same as any other
    /// broadcast channel with zero active receivers.
    pub async fn emit(&self, event: Event) {
        log::debug!("shm-stream-writer event: {event:?}");
        let _ = self.events_tx.send(event);
    }

    /// Hands out a fresh, independent subscription to the event broadcast
    /// (spec §6). Each subscriber sees every event sent after it
    /// subscribes; unlike a work queue, two subscribers never compete for
    /// the same event.
    pub fn subscribe_events(&self) -> EventReceiver {
        self.events_tx.subscribe()
    }

    /// Destroy (spec §4.4 "Destroy"). Idempotent under concurrent callers:
    /// background tasks (write-fault handlers, the liveness watch, `end()`'s
    /// failure paths) can all reach this on separate executor threads, so
    /// the idempotence check is a `compare_exchange` claim on `destroyed`
    /// rather than a `load` followed by a later `store` — a plain
    /// check-then-act would let two racing callers both pass the check and
    /// double-emit `Error`/`Close` (spec §8 testable property 5).
    pub async fn destroy(&self, err: Option<Error>) {
        if self
            .destroyed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        self.set_watching(false);

        let wp = self.state.load(Slot::WriteProcess);
        let rp = self.state.load(Slot::ReadProcess);
        let both_pre_terminal = matches!(
            ProcessSign::from_i32(wp),
            Some(ProcessSign::Ready) | Some(ProcessSign::Empty)
        ) && matches!(
            ProcessSign::from_i32(rp),
            Some(ProcessSign::Ready) | Some(ProcessSign::Empty)
        );
        if both_pre_terminal {
            let sign = if err.is_some() {
                ProcessSign::Failed
            } else {
                ProcessSign::Finished
            };
            self.state.store(Slot::WriteProcess, sign.into());
            self.state.notify(Slot::WriteProcess);
        }

        if let Some(e) = err {
            log::warn!("shm-stream-writer destroying with error: {e}");
            self.record_error(e.clone());
            self.emit(Event::Error(e)).await;
        }

        self.closed.store(true, Ordering::SeqCst);
        self.emit(Event::Close).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events;
    use std::alloc::{alloc_zeroed, Layout};
    use std::sync::Arc;

    fn make_core() -> Arc<Core> {
        let layout = Layout::from_size_align(128, 8).unwrap();
        let base = unsafe { alloc_zeroed(layout) };
        let state = unsafe { SharedState::from_raw(base, 128).unwrap() };
        Arc::new(Core::new(state, Config::default(), events::channel()))
    }

    #[tokio::test]
    async fn destroy_twice_is_a_no_op_the_second_time() {
        let core = make_core();
        core.destroy(Some(Error::ReadTooLong)).await;
        assert!(core.is_closed());
        let first_error = core.last_error();

        core.destroy(Some(Error::FinishTimeout)).await;
        assert_eq!(core.last_error(), first_error);
    }

    // Testable property 5 (spec §8): destroy() must stay idempotent even
    // when called concurrently from separate tasks, the way the crate's
    // own background fault handlers actually do (engine write faults from
    // both `place()`'s error path and `write_sync`'s detached task, the
    // liveness watch's terminal-peer branch, and `end()`'s failure
    // paths). A maintainer review caught that the original check-then-act
    // (`load` the flag, `store` it several `.await` points later) let two
    // racing callers both pass the check and double-emit `Error`/`Close`;
    // this pins the `compare_exchange` fix by firing 8 concurrent
    // destroys and checking exactly one of each event landed.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_destroy_calls_emit_error_and_close_exactly_once() {
        let core = make_core();
        let mut events = core.subscribe_events();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let core = Arc::clone(&core);
                tokio::spawn(async move {
                    let err = if i % 2 == 0 {
                        Some(Error::ReadTooLong)
                    } else {
                        Some(Error::FinishTimeout)
                    };
                    core.destroy(err).await;
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        let mut error_count = 0;
        let mut close_count = 0;
        while let Ok(event) = events.try_recv() {
            match event {
                Event::Error(_) => error_count += 1,
                Event::Close => close_count += 1,
                _ => {}
            }
        }
        assert_eq!(error_count, 1);
        assert_eq!(close_count, 1);
        assert!(core.is_destroyed());
        assert!(core.is_closed());
    }
}
