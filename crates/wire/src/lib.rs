// SPDX-License-Identifier: MIT

//! Line-oriented control-socket protocol: request parsing, response
//! envelopes, and the async framing helpers that read/write them.

mod error;
mod framing;
mod request;
mod response;

pub use error::ProtocolError;
pub use framing::{read_envelope, read_request_line, write_envelope, write_request_line, write_stream_line};
pub use request::{parse, ConnectOptions, Request};
pub use response::{payload, Envelope, ResponseLine, StatusLevel};
