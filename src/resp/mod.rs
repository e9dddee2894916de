//! The RESP3 wire codec: decoder (§4.1 decode side) and encoder
//! (§4.1 encode side).

pub mod decode;
pub mod encode;
pub mod token;

pub use decode::decode;
pub use encode::{encode_command, CommandEncoder};
pub use token::{Aggregate, RespToken};
