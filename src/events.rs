/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! Lifecycle events emitted by a [`crate::Writer`] (spec §6, §9 "Event
//! emission"). `ready`, `finish`, `error`, and `close` fire at most once;
//! `drain` may fire repeatedly.

use crate::Error;

/// A lifecycle event emitted by a [`crate::Writer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The peer reached `READY` and the startup handshake completed.
    Ready,
    /// The overflow queue was fully flushed back into the ring.
    ///
    /// May fire more than once; every other event fires at most once.
    Drain,
    /// Orderly end completed: the peer acknowledged `FINISHING` by
    /// reaching `FINISHED`.
    Finish,
    /// The writer hit a fatal condition and is tearing down.
    Error(Error),
    /// The writer finished tearing down, clean or not.
    Close,
}

/// Capacity of the lifecycle event broadcast. This crate's own events are
/// sparse (at most a handful of one-shot events plus occasional `Drain`),
/// so a subscriber would need to fall many events behind before missing
/// one; generous enough that a slow-polling caller never sees `Lagged`.
const EVENT_CAPACITY: usize = 32;

/// Receiving half of the writer's event stream.
///
/// Every call to [`crate::Writer::events`] hands out an independent
/// subscription via `Sender::subscribe`: a true broadcast, where each
/// subscriber sees every event sent *after* it subscribes (spec §6, §9
/// "Event emission" — this is not a competing-consumer work queue, so two
/// independent callers never race each other for the same event).
pub type EventReceiver = tokio::sync::broadcast::Receiver<Event>;

pub(crate) fn channel() -> tokio::sync::broadcast::Sender<Event> {
    tokio::sync::broadcast::channel(EVENT_CAPACITY).0
}
