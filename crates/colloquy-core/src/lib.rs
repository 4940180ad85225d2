//! colloquy-core: wire types and transport contract for the colloquy
//! RPC framework.
//!
//! This crate defines:
//! - The message envelope ([`Message`], [`MsgType`], [`Meta`])
//! - The status triple ([`Status`])
//! - Body codecs and their registry ([`codec`])
//! - Transfer filters and the ordered pipe ([`xfer`], [`XferPipe`])
//! - Wire protocols ([`Proto`], [`RawProto`], [`JsonProto`])
//! - The transport contract and built-in drivers ([`transport`])
//!
//! The stateful session/peer layer lives in the `colloquy` crate.

pub mod codec;
pub mod message;
pub mod proto;
pub mod status;
pub mod transport;
pub mod xfer;

pub use codec::{BodyValue, Codec};
pub use message::{Message, Meta, MsgType, CODEC_NONE};
pub use proto::{
    default_proto_func, json_proto_func, raw_proto_func, JsonProto, Proto, ProtoFunc, RawProto,
    DEFAULT_READ_LIMIT,
};
pub use status::{code, Status};
pub use transport::{BoxIoStream, Conn, DialOpts, IoStream, Listener, Transport};
pub use xfer::{GzipFilter, XferFilter, XferPipe};
