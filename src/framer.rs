/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! C2 — the ring framer (spec §4.2). The only component that mutates `B`
//! and `WRITE_INDEX`.

use crate::config::Config;
use crate::process::Slot;
use crate::state::{SharedBuffer, SharedState};

/// Frames payload bytes into the shared byte region, handling the
/// length-prefix / postfix / not-final layout (spec §3).
pub struct RingFramer {
    buffer: SharedBuffer,
    state: SharedState,
    config: Config,
}

impl RingFramer {
    pub fn new(buffer: SharedBuffer, state: SharedState, config: Config) -> Self {
        Self {
            buffer,
            state,
            config,
        }
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }

    /// Writes one frame at `write_cursor` and publishes the new
    /// `WRITE_INDEX`.
    ///
    /// Caller must have already established, via the write engine's Case
    /// A-D classification, that
    /// `write_cursor + PREFIX_SIZE + payload.len() + POSTFIX_SIZE + 1 <=
    /// buffer_len()`. This precondition is never violated from within this
    /// crate, so no error is returned here (spec §4.2).
    pub fn store(&self, write_cursor: usize, payload: &[u8], not_final: bool) -> usize {
        let mut cursor = write_cursor;

        let len_bytes = (payload.len() as u32).to_le_bytes();
        // SAFETY: precondition documented above guarantees this range is
        // in-bounds; this is the only writer of `B`.
        unsafe { self.buffer.write_at(cursor, &len_bytes) };
        cursor += self.config.prefix_size;

        unsafe { self.buffer.write_at(cursor, payload) };
        cursor += payload.len();

        // POSTFIX_SIZE bytes reserved for the wire format; this writer
        // makes no claim about their content, only their length.
        cursor += self.config.postfix_size;

        let not_final_byte: [u8; 1] = [if not_final { 1 } else { 0 }];
        unsafe { self.buffer.write_at(cursor, &not_final_byte) };
        cursor += 1;

        // Release-style publication: payload bytes become visible to the
        // Reader only after this store (spec §3 invariant 5).
        self.state.store(Slot::WriteIndex, cursor as i32);
        self.state.notify(Slot::WriteIndex);

        cursor
    }
}
