/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use std::time::Duration;

/// Tunable framing and timeout constants (spec §6).
///
/// Defaults match the spec exactly; most deployments only ever override
/// `postfix_size`, which depends on what the Reader's wire format reserves
/// after each payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Bytes reserved for the little-endian length prefix of each frame.
    pub prefix_size: usize,
    /// Bytes reserved after the payload, before the `NOT_FINAL` byte.
    pub postfix_size: usize,
    /// Spin iterations a synchronous write performs on `READ_INDEX` before
    /// failing with [`crate::Error::ReadTooLong`].
    pub read_spins: u32,
    /// Timeout passed to each individual spin/wait iteration.
    pub spin_timeout: Duration,
    /// Timeout for the peer to reach `READY` during the startup handshake.
    pub start_timeout: Duration,
    /// Spin iterations `end()` performs waiting for the peer's process
    /// word to change before failing with [`crate::Error::FinishTimeout`].
    pub finish_spins: u32,
}

impl Config {
    /// `EXTRA_SPACE` (spec §3): length prefix + postfix, NOT including the
    /// trailing `NOT_FINAL` byte. Callers that need the full per-frame
    /// overhead (e.g. the minimum buffer length, spec §6) add `+ 1`
    /// themselves, exactly once, matching spec §4.3 step 3's `leftover =
    /// bound − write_cursor − EXTRA_SPACE − 1`.
    pub const fn extra_space(&self) -> usize {
        self.prefix_size + self.postfix_size
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            prefix_size: 4,
            postfix_size: 0,
            read_spins: 10,
            spin_timeout: Duration::from_millis(1000),
            start_timeout: Duration::from_millis(5000),
            finish_spins: 10,
        }
    }
}
