/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! Writer side of a shared-memory byte stream between one Writer and one
//! Reader, coordinated through a second shared region of 32-bit atomics
//! that supports futex-style wait/notify.
//!
//! The companion Reader is an external collaborator: this crate only ever
//! owns the `WRITE_*` half of the coordination words and the producer
//! cursor over the byte region. See [`Writer`] for the entry point.

mod config;
mod core_state;
mod engine;
mod error;
mod events;
mod framer;
mod lifecycle;
mod process;
mod state;
mod writer;

pub use config::Config;
pub use error::{Error, Result};
pub use events::{Event, EventReceiver};
pub use process::{ProcessSign, Slot};
pub use writer::Writer;
