//! Wire protocol framing for the taskgrid network
//!
//! Two sub-protocols share one frame layout, distinguished by a short fixed
//! byte tag at the start of every frame:
//! - `PD`: peer discovery/gossip
//! - `DO`: task demand-offer
//!
//! Frame layout: `[2-byte tag][1-byte kind][8-byte BE unix-ms timestamp]
//! [4-byte BE payload length][JSON payload]`.
//!
//! Decoding is total: malformed, truncated or oversized frames yield a typed
//! [`DecodeError`], never a partial message. Callers treat decode failure
//! like a dropped frame: no reply, no state change.

pub mod codec;
pub mod message;

pub use codec::{DecodeError, EncodeError, MessageCodec, WireConfig, FRAME_HEADER_LEN};
pub use message::{
    CannotAssign, ForceReport, Hello, Message, MessageBody, MessageKind, Peers, Protocol,
    ReportComputedTask, ResultsAccepted, ResultsRejected, TaskToCompute, WantToCompute,
};
