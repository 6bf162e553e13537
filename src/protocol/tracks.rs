use std::io::{Cursor, Read, Write};

use base64::prelude::*;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};

/// Header flag marking a versioned track blob.
const TRACK_INFO_VERSIONED: u32 = 1;
/// Wire version this node writes. Version 1 blobs (no uri field) decode too.
const TRACK_VERSION: u8 = 2;

/// A single audio track: the opaque encoded descriptor plus its metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Track {
    /// Base64-encoded track descriptor.
    pub track: String,
    /// Decoded metadata.
    pub info: TrackInfo,
}

impl Track {
    /// Build a Track from info, encoding the descriptor blob.
    pub fn new(info: TrackInfo) -> Self {
        let track = info.encode();
        Self { track, info }
    }

    /// Decode an opaque descriptor blob.
    pub fn decode(encoded: &str) -> Option<Self> {
        let info = TrackInfo::decode(encoded)?;
        Some(Self {
            track: encoded.to_string(),
            info,
        })
    }
}

/// Metadata for an audio track.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrackInfo {
    pub identifier: String,
    pub is_seekable: bool,
    pub author: String,
    /// Duration in milliseconds. 0 for streams.
    pub length: u64,
    pub is_stream: bool,
    /// Start position in milliseconds.
    pub position: u64,
    pub title: String,
    pub uri: Option<String>,
    pub source_name: String,
}

impl TrackInfo {
    /// Encode into the upstream-compatible base64 blob: a 4-byte
    /// size/flags header word, a version byte, UTF-length-prefixed strings
    /// and big-endian u64 length/position.
    pub fn encode(&self) -> String {
        let mut body = Vec::new();
        body.write_u8(TRACK_VERSION).unwrap();

        write_utf(&mut body, &self.title);
        write_utf(&mut body, &self.author);
        body.write_u64::<BigEndian>(self.length).unwrap();
        write_utf(&mut body, &self.identifier);
        body.write_u8(self.is_stream as u8).unwrap();
        write_opt_utf(&mut body, self.uri.as_deref());
        write_utf(&mut body, &self.source_name);
        body.write_u64::<BigEndian>(self.position).unwrap();

        let mut buf = Vec::with_capacity(4 + body.len());
        let header = body.len() as u32 | (TRACK_INFO_VERSIONED << 30);
        buf.write_u32::<BigEndian>(header).unwrap();
        buf.extend_from_slice(&body);

        BASE64_STANDARD.encode(&buf)
    }

    /// Decode a base64 descriptor blob. Returns `None` for malformed or
    /// unknown-version input.
    pub fn decode(encoded: &str) -> Option<Self> {
        let data = BASE64_STANDARD.decode(encoded).ok()?;
        if data.len() < 4 {
            return None;
        }

        let mut cursor = Cursor::new(data);
        let header = cursor.read_u32::<BigEndian>().ok()?;
        let flags = (header >> 30) & 0x03;

        let version = if (flags & TRACK_INFO_VERSIONED) != 0 {
            cursor.read_u8().ok()?
        } else {
            1
        };
        if version > TRACK_VERSION {
            return None;
        }

        let title = read_utf(&mut cursor)?;
        let author = read_utf(&mut cursor)?;
        let length = cursor.read_u64::<BigEndian>().ok()?;
        let identifier = read_utf(&mut cursor)?;
        let is_stream = cursor.read_u8().ok()? != 0;
        let uri = if version >= 2 {
            read_opt_utf(&mut cursor)
        } else {
            None
        };
        let source_name = read_utf(&mut cursor)?;
        let position = cursor.read_u64::<BigEndian>().ok().unwrap_or(0);

        Some(Self {
            identifier,
            is_seekable: !is_stream,
            author,
            length,
            is_stream,
            position,
            title,
            uri,
            source_name,
        })
    }
}

fn write_utf(w: &mut Vec<u8>, s: &str) {
    let bytes = s.as_bytes();
    w.write_u16::<BigEndian>(bytes.len() as u16).unwrap();
    w.write_all(bytes).unwrap();
}

fn write_opt_utf(w: &mut Vec<u8>, s: Option<&str>) {
    match s {
        Some(s) => {
            w.write_u8(1).unwrap();
            write_utf(w, s);
        }
        None => {
            w.write_u8(0).unwrap();
        }
    }
}

fn read_utf<R: Read>(r: &mut R) -> Option<String> {
    let len = r.read_u16::<BigEndian>().ok()? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).ok()?;
    String::from_utf8(buf).ok()
}

fn read_opt_utf<R: Read>(r: &mut R) -> Option<String> {
    let present = r.read_u8().ok()? != 0;
    if present { read_utf(r) } else { None }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TrackInfo {
        TrackInfo {
            identifier: "dQw4w9WgXcQ".into(),
            is_seekable: true,
            author: "Rick Astley".into(),
            length: 212_000,
            is_stream: false,
            position: 0,
            title: "Never Gonna Give You Up".into(),
            uri: Some("https://www.youtube.com/watch?v=dQw4w9WgXcQ".into()),
            source_name: "youtube".into(),
        }
    }

    #[test]
    fn roundtrip() {
        let info = sample();
        let decoded = TrackInfo::decode(&info.encode()).unwrap();
        assert_eq!(decoded, info);
    }

    #[test]
    fn roundtrip_without_uri() {
        let mut info = sample();
        info.uri = None;
        info.source_name = "local".into();
        info.identifier = "/tmp/a.ogg".into();
        let decoded = TrackInfo::decode(&info.encode()).unwrap();
        assert_eq!(decoded, info);
    }

    #[test]
    fn stream_is_not_seekable() {
        let mut info = sample();
        info.is_stream = true;
        info.is_seekable = false;
        let decoded = TrackInfo::decode(&info.encode()).unwrap();
        assert!(!decoded.is_seekable);
        assert!(decoded.is_stream);
    }

    #[test]
    fn rejects_garbage() {
        assert!(TrackInfo::decode("not base64 at all!!").is_none());
        assert!(TrackInfo::decode("AAAA").is_none());
    }

    #[test]
    fn versioned_header_flag_is_set() {
        let data = BASE64_STANDARD.decode(sample().encode()).unwrap();
        let header = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        assert_eq!(header >> 30, 1);
        assert_eq!((header & 0x3FFF_FFFF) as usize, data.len() - 4);
    }
}
