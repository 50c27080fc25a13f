// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//! Library side of the `afh` binary, so commands can be tested without
//! spawning it.

pub mod commands;
pub mod logging;
