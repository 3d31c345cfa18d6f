//! Wire protocol: varint primitives, frame header codec, property block codec.
//!
//! Every transport message carries exactly one BLIP frame:
//!
//! ```text
//! varint(message_number) || varint(flags) || payload_bytes
//! ```
//!
//! The first frame of a message additionally begins its payload with the
//! encoded property block (see [`properties`]).

pub mod frame;
pub mod properties;
pub mod varint;

pub use frame::{Frame, FrameHeader, MAX_FLAG};
pub use properties::Properties;

/// Base frame size used by the send scheduler.
pub const DEFAULT_FRAME_SIZE: usize = 4096;

/// Frame-size multiplier applied when the scheduler has no competing
/// non-urgent traffic to interleave with.
pub const BIG_FRAME_FACTOR: usize = 4;

/// Maximum unacknowledged bytes per outgoing message before the sender is
/// paused (moved to the icebox) awaiting an ack.
pub const MAX_UNACKED_BYTES: u64 = 128_000;

/// The receiver emits an ack every time its byte count crosses a multiple
/// of this interval.
pub const ACK_INTERVAL: u64 = 50_000;
