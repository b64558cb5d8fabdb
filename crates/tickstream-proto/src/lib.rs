//! Wire framing codec and message catalog shared by the tickstream
//! server and client. The `tokio` feature adds async encode/decode on
//! top of the same header layout the sync path uses.

pub mod frame;
pub mod message;

pub use frame::{
    CHECKSUM_LEN, FrameError, HEADER_LEN, MAGIC_1, MAGIC_2, MAX_PAYLOAD,
    VERSION, decode_sync, encode, encode_sync,
};
#[cfg(feature = "tokio")]
pub use frame::{decode_async, encode_async};
pub use message::{
    AckPayload, AuthRequest, CatalogError, DataBatch, ErrorCode, ErrorPayload,
    HeartbeatRequest, MessageType, PongPayload, SubscribeRequest,
    SubscriptionMode, Tick, ValidationError, decode_payload, encode_payload,
    validate_auth_request, validate_data_batch, validate_heartbeat_request,
    validate_subscribe_request, validate_tick,
};

/// Our frame's `Frame` re-export, for callers that want the raw struct.
pub use frame::Frame;
