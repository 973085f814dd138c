//! # huddle-protocol
//!
//! Wire frame definitions for the Huddle conversation engine.
//!
//! Clients exchange JSON text frames with the server over a WebSocket:
//!
//! - `InboundFrame` - content addressed to a conversation, or to a team or
//!   recipient through the legacy addressing fields
//! - `OutboundFrame` - a persisted message with its sender identity
//!
//! ## Example
//!
//! ```rust
//! use huddle_protocol::{codec, Address};
//!
//! let frame = codec::decode_inbound(br#"{"conversation_id": 7, "content": "hi"}"#).unwrap();
//! assert_eq!(frame.address(), Some(Address::Conversation(7)));
//! ```

pub mod codec;
pub mod frames;

pub use codec::{decode_inbound, encode_outbound, FrameCodec, ProtocolError};
pub use frames::{Address, InboundFrame, OutboundFrame, SenderInfo};
