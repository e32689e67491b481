//! Utility modules

pub mod error;
pub mod resp;

pub use error::{ClientError, ProtocolError, Result};
pub use resp::{Redirect, RespDecoder, RespEncoder, RespValue};
