//! Wire protocol for Culvert tunnel communication.
//!
//! One framed byte stream carries everything between a tunnel client and the
//! server: the registration handshake, liveness probes, suspend/resume, and
//! the multiplexed request/response exchanges themselves.

mod codec;
mod frame;
mod relay;

pub use codec::{CodecError, FrameCodec, MAX_FRAME_SIZE};
pub use frame::{
    CloseReason, ExchangeStatus, Frame, FrameType, CONTROL_EXCHANGE_ID, HEADER_LEN, MAGIC_BYTE,
    PROTOCOL_VERSION,
};
pub use relay::{is_hop_by_hop, RequestHead, ResponseHead};
