//! Container detection via header byte sniffing.
//!
//! The player peeks at the first bytes of a source stream to decide
//! whether the direct demux path applies or the stream must go through
//! ffmpeg.

/// Containers the direct (no-transcode) path understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    /// OGG pages — assumed to carry Opus when taken as passthrough.
    Ogg,
    /// EBML / Matroska / WebM — typically Opus audio.
    Webm,
    /// Anything else; handed to ffmpeg.
    Unknown,
}

/// Sniff the container from the first bytes of a stream.
///
/// Requires at least 4 bytes; shorter input is `Unknown`.
pub fn detect_container(header: &[u8]) -> ContainerKind {
    if header.len() < 4 {
        return ContainerKind::Unknown;
    }

    // OGG capture pattern
    if header.starts_with(b"OggS") {
        return ContainerKind::Ogg;
    }

    // EBML magic (WebM / Matroska)
    if header.starts_with(&[0x1A, 0x45, 0xDF, 0xA3]) {
        return ContainerKind::Webm;
    }

    ContainerKind::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_ogg() {
        assert_eq!(detect_container(b"OggS\x00\x02"), ContainerKind::Ogg);
    }

    #[test]
    fn detect_webm() {
        let hdr = [0x1A, 0x45, 0xDF, 0xA3, 0x9F, 0x42];
        assert_eq!(detect_container(&hdr), ContainerKind::Webm);
    }

    #[test]
    fn detect_unknown() {
        assert_eq!(detect_container(b"ID3\x04\x00"), ContainerKind::Unknown);
        assert_eq!(detect_container(b"Og"), ContainerKind::Unknown);
    }
}
