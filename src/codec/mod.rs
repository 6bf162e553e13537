pub mod ogg;
pub mod probe;
pub mod transcode;
pub mod volume;
pub mod webm;

pub use ogg::OggPacketParser;
pub use probe::{ContainerKind, detect_container};
pub use transcode::Transcoder;
pub use volume::VolumeTransform;
