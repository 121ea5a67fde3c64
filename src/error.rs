/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! The writer's error taxonomy (spec §7). Every variant is fatal: observing
//! one always leads to [`crate::Writer::destroy`].

use thiserror::Error;

/// Errors that can terminate a [`crate::Writer`].
///
/// All of these are unrecoverable by design: the write engine and lifecycle
/// controller route every one of them through `destroy`, which publishes
/// `FAILED` to the peer (when still reachable) and emits
/// [`crate::Event::Error`] followed by [`crate::Event::Close`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A ring invariant was violated: the reader observed ahead of the
    /// writer, or the writer's own cursor/cycle bookkeeping went negative.
    #[error("shared ring corrupted ({reason}): write_cursor={write_cursor} bound={bound}")]
    Corrupted {
        reason: &'static str,
        write_cursor: usize,
        bound: usize,
    },

    /// A synchronous write spun `READ_SPINS` times without the reader
    /// advancing `READ_INDEX`.
    #[error("synchronous write exhausted read_spins waiting on the reader")]
    ReadTooLong,

    /// `START_TIMEOUT` elapsed before the peer ever reached `READY`.
    #[error("reader did not attach within the startup timeout")]
    ReaderStartTimeout,

    /// The peer's process word was already terminal (`FINISHING`,
    /// `FINISHED`, or `FAILED`) before this writer ever attached.
    #[error("reader process word was already terminal before synchronize")]
    ReaderExitedBeforeSync,

    /// The peer left `EMPTY` during the startup handshake but landed
    /// somewhere other than `READY`.
    #[error("reader left EMPTY without reaching READY")]
    ReaderExitedAtSync,

    /// The peer's process word became terminal (`FAILED`/`FINISHED`)
    /// while this writer was in steady-state liveness watch.
    #[error("reader process word became terminal during steady-state watch")]
    ReaderExitedWhileWatch,

    /// `FINISH_SPINS` elapsed during orderly end without the peer's
    /// process word changing away from its value at the start of `end()`.
    #[error("finish_spins elapsed without reader state change during end()")]
    FinishTimeout,

    /// The peer reached `FAILED` while this writer was waiting for it to
    /// reach `FINISHED` during orderly end.
    #[error("reader ended FAILED during orderly end")]
    FinishReaderFailed,

    /// A handle passed to [`crate::Writer::new`] failed validation (too
    /// short, misaligned, or otherwise unusable).
    #[error("invalid shared region: {0}")]
    InvalidRegion(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;
