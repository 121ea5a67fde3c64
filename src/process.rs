/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! Wire-level constants shared with the Reader side (spec §3, §6). A real
//! Reader implementation (out of scope for this crate) needs these exact
//! slot indices and sign values to interoperate.

/// Index of a 32-bit word inside the shared-state region `S`.
///
/// The region is required to hold at least eight `i32` words (spec §6); the
/// six named here are the only ones this writer touches. The remaining two
/// are reserved padding, left untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum Slot {
    WriteIndex = 0,
    WriteCycle = 1,
    WriteProcess = 2,
    ReadIndex = 3,
    ReadCycle = 4,
    ReadProcess = 5,
}

/// Number of 32-bit words the shared-state region must provide. `S` itself
/// may be larger (spec requires only "at least eight"); the extra capacity
/// is reserved for future slots and left untouched by this writer.
pub const NUM_SLOTS: usize = 8;

/// Minimum byte length of the shared-state region `S` (spec §6).
pub const MIN_STATE_BYTES: usize = 128;

/// Lifecycle sign stored in a `*_PROCESS` word (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ProcessSign {
    /// Not yet attached.
    Empty = 0,
    /// Attached and running.
    Ready = 1,
    /// Requesting orderly end.
    Finishing = 2,
    /// Ended cleanly.
    Finished = 3,
    /// Ended with error.
    Failed = 4,
}

impl ProcessSign {
    pub fn from_i32(v: i32) -> Option<Self> {
        match v {
            0 => Some(Self::Empty),
            1 => Some(Self::Ready),
            2 => Some(Self::Finishing),
            3 => Some(Self::Finished),
            4 => Some(Self::Failed),
            _ => None,
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed)
    }
}

impl From<ProcessSign> for i32 {
    fn from(sign: ProcessSign) -> Self {
        sign as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_defined_sign() {
        for (value, sign) in [
            (0, ProcessSign::Empty),
            (1, ProcessSign::Ready),
            (2, ProcessSign::Finishing),
            (3, ProcessSign::Finished),
            (4, ProcessSign::Failed),
        ] {
            assert_eq!(ProcessSign::from_i32(value), Some(sign));
            assert_eq!(i32::from(sign), value);
        }
    }

    #[test]
    fn rejects_undefined_values() {
        assert_eq!(ProcessSign::from_i32(5), None);
        assert_eq!(ProcessSign::from_i32(-1), None);
    }

    #[test]
    fn only_finished_and_failed_are_terminal() {
        assert!(!ProcessSign::Empty.is_terminal());
        assert!(!ProcessSign::Ready.is_terminal());
        assert!(!ProcessSign::Finishing.is_terminal());
        assert!(ProcessSign::Finished.is_terminal());
        assert!(ProcessSign::Failed.is_terminal());
    }
}
