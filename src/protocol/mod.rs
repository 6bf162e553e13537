pub mod filters;
pub mod messages;
pub mod tracks;

pub use filters::{FilterChain, FilterSpec};
pub use messages::{IncomingMessage, OutgoingMessage, PlayerEvent, TrackEndReason};
pub use tracks::{Track, TrackInfo};
