//! Secure RTP over UDP to the platform voice endpoint.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};

use crypto_secretbox::aead::{Aead, KeyInit};
use crypto_secretbox::{Key, Nonce, XSalsa20Poly1305};
use tokio::net::UdpSocket;

use crate::common::AnyResult;

/// The Opus silence frame, sent to flush the decoder on pause.
pub const SILENCE_FRAME: [u8; 3] = [0xF8, 0xFF, 0xFE];

/// Samples per 20 ms frame at 48 kHz.
const SAMPLES_PER_FRAME: u32 = 960;

pub struct UdpLink {
    socket: Arc<UdpSocket>,
    addr: SocketAddr,
    ssrc: u32,
    cipher: XSalsa20Poly1305,
    sequence: AtomicU16,
    timestamp: AtomicU32,
}

impl UdpLink {
    pub fn new(socket: Arc<UdpSocket>, addr: SocketAddr, ssrc: u32, secret_key: [u8; 32]) -> Self {
        Self {
            socket,
            addr,
            ssrc,
            cipher: XSalsa20Poly1305::new(Key::from_slice(&secret_key)),
            sequence: AtomicU16::new(0),
            timestamp: AtomicU32::new(0),
        }
    }

    /// Encrypt and send one Opus frame.
    pub async fn send_opus(&self, payload: &[u8]) -> AnyResult<()> {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let timestamp = self
            .timestamp
            .fetch_add(SAMPLES_PER_FRAME, Ordering::SeqCst);

        let mut header = [0u8; 12];
        header[0] = 0x80; // version 2
        header[1] = 0x78; // payload type: Opus
        header[2..4].copy_from_slice(&sequence.to_be_bytes());
        header[4..8].copy_from_slice(&timestamp.to_be_bytes());
        header[8..12].copy_from_slice(&self.ssrc.to_be_bytes());

        // xsalsa20_poly1305: nonce is the RTP header zero-padded to 24 bytes
        let mut nonce = [0u8; 24];
        nonce[..12].copy_from_slice(&header);

        let encrypted = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), payload)
            .map_err(|e| format!("voice packet encryption failed: {e:?}"))?;

        let mut packet = Vec::with_capacity(12 + encrypted.len());
        packet.extend_from_slice(&header);
        packet.extend_from_slice(&encrypted);

        self.socket.send_to(&packet, self.addr).await?;
        Ok(())
    }
}

/// UDP hole-punch IP discovery: a 74-byte request carrying the ssrc, the
/// response echoes our external address and port.
pub async fn discover_ip(
    socket: &UdpSocket,
    addr: SocketAddr,
    ssrc: u32,
) -> AnyResult<(String, u16)> {
    let mut packet = [0u8; 74];
    packet[0..2].copy_from_slice(&1u16.to_be_bytes());
    packet[2..4].copy_from_slice(&70u16.to_be_bytes());
    packet[4..8].copy_from_slice(&ssrc.to_be_bytes());

    socket.send_to(&packet, addr).await?;

    let mut buf = [0u8; 74];
    let timeout = tokio::time::Duration::from_secs(2);
    match tokio::time::timeout(timeout, socket.recv(&mut buf)).await {
        Ok(Ok(n)) if n >= 74 => {
            let ip = std::str::from_utf8(&buf[8..72])?
                .trim_matches('\0')
                .to_string();
            let port = u16::from_le_bytes([buf[72], buf[73]]);
            Ok((ip, port))
        }
        Ok(Ok(_)) => Err("IP discovery response too short".into()),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err("IP discovery timed out".into()),
    }
}
