//! Wire-level types shared by the bridge and whatever sits on the bus side.
//!
//! - [`Segment`]: the message content tree
//! - [`BusMessage`]: gateway message converted for the engine
//! - [`OutboundMessage`]: engine reply headed for the chat surface

pub mod bus;
pub mod segment;

pub use bus::{BusMessage, ConversationInfo, OutboundMessage, OutboundTarget, SenderInfo};
pub use segment::{
    Mention, MentionedRole, MentionedUser, ReplyTarget, RoutingHint, Segment, SegmentKind,
    Segments,
};
