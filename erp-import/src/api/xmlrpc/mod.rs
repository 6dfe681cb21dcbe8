//! XML-RPC wire format
//!
//! Requests are written with `quick-xml`, responses are parsed with
//! `roxmltree`. Only the value types the ERP actually emits are supported.

mod decode;
mod encode;
mod value;

pub use decode::{Response, decode_response};
pub use encode::encode_call;
pub use value::{Record, RpcValue};
