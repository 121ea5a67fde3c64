/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! C4 — the lifecycle controller (spec §4.4). Startup handshake, peer
//! liveness watch, orderly end, and destroy.

use std::sync::Arc;

use crate::core_state::Core;
use crate::engine::WriteEngine;
use crate::events::Event;
use crate::process::{ProcessSign, Slot};
use crate::state::WaitOutcome;
use crate::Error;

/// C4. Drives the `WRITE_PROCESS` state machine against the peer's
/// `READ_PROCESS` word.
pub struct LifecycleController {
    core: Arc<Core>,
    engine: Arc<WriteEngine>,
}

impl LifecycleController {
    pub fn new(core: Arc<Core>, engine: Arc<WriteEngine>) -> Arc<Self> {
        Arc::new(Self { core, engine })
    }

    /// Startup handshake (spec §4.4 "Startup handshake").
    pub async fn synchronize(self: &Arc<Self>) -> Result<(), Error> {
        loop {
            self.core.state.store(Slot::WriteProcess, ProcessSign::Ready.into());
            self.core.state.notify(Slot::WriteProcess);

            let peer = self.core.state.load(Slot::ReadProcess);
            match ProcessSign::from_i32(peer) {
                Some(ProcessSign::Ready) => {
                    self.core.set_ready();
                    self.core.emit(Event::Ready).await;
                    self.spawn_watch();
                    return Ok(());
                }
                Some(ProcessSign::Empty) => {
                    let outcome = self
                        .core
                        .state
                        .wait_async(
                            Slot::ReadProcess,
                            ProcessSign::Empty.into(),
                            Some(self.core.config.start_timeout),
                        )
                        .await;
                    match outcome {
                        WaitOutcome::NotEqual => continue,
                        WaitOutcome::TimedOut => {
                            self.core.destroy(Some(Error::ReaderStartTimeout)).await;
                            return Err(Error::ReaderStartTimeout);
                        }
                        WaitOutcome::Ok => {
                            let peer2 = self.core.state.load(Slot::ReadProcess);
                            if peer2 == i32::from(ProcessSign::Ready) {
                                continue;
                            }
                            self.core.destroy(Some(Error::ReaderExitedAtSync)).await;
                            return Err(Error::ReaderExitedAtSync);
                        }
                    }
                }
                _ => {
                    self.core.destroy(Some(Error::ReaderExitedBeforeSync)).await;
                    return Err(Error::ReaderExitedBeforeSync);
                }
            }
        }
    }

    fn spawn_watch(self: &Arc<Self>) {
        self.core.set_watching(true);
        let this = Arc::clone(self);
        tokio::spawn(async move { this.watch().await });
    }

    /// Liveness watch (spec §4.4 "Liveness watch").
    async fn watch(self: &Arc<Self>) {
        let mut s = self.core.state.load(Slot::ReadProcess);
        loop {
            if !self.core.is_watching() {
                return;
            }
            match ProcessSign::from_i32(s) {
                Some(ProcessSign::Finishing) => {
                    if self.engine.queue_is_empty() {
                        self.end().await;
                    } else {
                        self.arm_end_after_drain();
                    }
                    return;
                }
                Some(ProcessSign::Failed) | Some(ProcessSign::Finished) => {
                    self.core.destroy(Some(Error::ReaderExitedWhileWatch)).await;
                    return;
                }
                _ => {
                    // Bounded, like the Case A buffering loop in
                    // `engine.rs`: READ_PROCESS is Reader-owned, so a
                    // crashed or hung peer never notifies it, and this
                    // writer would otherwise wait forever with no way for
                    // `destroy()` (which only flips `watching` off) to
                    // force it awake. Re-checking `is_watching()` on every
                    // timeout lets `destroy()` actually end this task.
                    loop {
                        let outcome = self
                            .core
                            .state
                            .wait_async(Slot::ReadProcess, s, Some(self.core.config.spin_timeout))
                            .await;
                        if !self.core.is_watching() {
                            return;
                        }
                        if !matches!(outcome, WaitOutcome::TimedOut) {
                            break;
                        }
                    }
                    s = self.core.state.load(Slot::ReadProcess);
                }
            }
        }
    }

    /// "Arm a one-shot listener on the next drain that calls `end()`"
    /// (spec §4.4 step 2). Waits on the write engine's own overflow-queue
    /// state directly, rather than subscribing to the public event stream:
    /// that stream is a broadcast any external caller may also be
    /// listening on, and this handshake must fire regardless of whether
    /// anyone else is.
    fn arm_end_after_drain(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.engine.wait_until_drained().await;
            this.end().await;
        });
    }

    /// Orderly end (spec §4.4 "Orderly end").
    pub async fn end(self: &Arc<Self>) {
        if !self.core.writable() {
            return;
        }
        self.core.set_ending();
        self.core.set_watching(false);

        let origin = self.core.state.load(Slot::ReadProcess);
        if matches!(
            ProcessSign::from_i32(origin),
            Some(ProcessSign::Ready) | Some(ProcessSign::Empty) | Some(ProcessSign::Finishing)
        ) {
            self.core.state.store(Slot::WriteProcess, ProcessSign::Finishing.into());
            self.core.state.notify(Slot::WriteProcess);
        }

        let mut spins = 0u32;
        let mut current = origin;
        while current == origin
            && !ProcessSign::from_i32(current).is_some_and(ProcessSign::is_terminal)
            && spins < self.core.config.finish_spins
        {
            self.core
                .state
                .wait(Slot::ReadProcess, origin, Some(self.core.config.spin_timeout));
            spins += 1;
            current = self.core.state.load(Slot::ReadProcess);
        }

        match ProcessSign::from_i32(current) {
            Some(ProcessSign::Finished) => {
                self.core.state.store(Slot::WriteProcess, ProcessSign::Finished.into());
                self.core.state.notify(Slot::WriteProcess);
                self.core.set_finished_ended();
                self.core.emit(Event::Finish).await;
            }
            Some(ProcessSign::Failed) => {
                self.core.destroy(Some(Error::FinishReaderFailed)).await;
            }
            _ => {
                self.core.destroy(Some(Error::FinishTimeout)).await;
            }
        }
    }

    /// Destroy (spec §4.4 "Destroy"). Idempotent: a second call is a no-op
    /// (spec §8 testable property 5).
    pub async fn destroy(self: &Arc<Self>, err: Option<Error>) {
        self.core.destroy(err).await;
    }
}
