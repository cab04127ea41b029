// SPDX-License-Identifier: MIT

//! The companion supervisor's PTY primitive (F): fork a PTY, exec a
//! companion command as its foreground process, stream merged
//! stdout/stderr line by line, and deliver Ctrl+C into the whole
//! foreground process group.

mod error;
mod session;

pub use error::PtyError;
pub use session::{spawn, PtyChild, PtyCommand};
