//! Inline software volume.
//!
//! Volume changes apply live without restarting the pipeline: each Opus
//! packet is decoded, the PCM is scaled, and the frame is re-encoded.
//! At factor 1.0 the transform is bypassed entirely and packets pass
//! through untouched.

use audiopus::coder::{Decoder, Encoder};
use audiopus::{Application, Channels, SampleRate};

use crate::common::AnyResult;

/// 120 ms at 48 kHz stereo, the largest frame Opus permits.
const MAX_SAMPLES: usize = 5760 * 2;

pub struct VolumeTransform {
    decoder: Decoder,
    encoder: Encoder,
    pcm: Vec<i16>,
    out: Vec<u8>,
}

impl VolumeTransform {
    pub fn new() -> AnyResult<Self> {
        let decoder = Decoder::new(SampleRate::Hz48000, Channels::Stereo)?;
        let encoder = Encoder::new(SampleRate::Hz48000, Channels::Stereo, Application::Audio)?;
        Ok(Self {
            decoder,
            encoder,
            pcm: vec![0i16; MAX_SAMPLES],
            out: vec![0u8; 4000],
        })
    }

    /// Re-encode `packet` scaled by `factor` (1.0 = unity). The caller is
    /// expected to skip the call entirely at unity gain.
    pub fn process(&mut self, packet: &[u8], factor: f32) -> AnyResult<Vec<u8>> {
        let samples = self.decoder.decode(Some(packet), &mut self.pcm[..], false)?;
        let total = samples * 2; // interleaved stereo

        for sample in &mut self.pcm[..total] {
            *sample = (f32::from(*sample) * factor)
                .round()
                .clamp(f32::from(i16::MIN), f32::from(i16::MAX)) as i16;
        }

        let written = self.encoder.encode(&self.pcm[..total], &mut self.out[..])?;
        Ok(self.out[..written].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transform_roundtrips_an_encoded_frame() {
        let mut encoder =
            Encoder::new(SampleRate::Hz48000, Channels::Stereo, Application::Audio).unwrap();
        // one 20 ms frame of a quiet ramp
        let pcm: Vec<i16> = (0..960 * 2).map(|i| (i % 128) as i16).collect();
        let mut buf = vec![0u8; 4000];
        let len = encoder.encode(&pcm, &mut buf).unwrap();

        let mut transform = VolumeTransform::new().unwrap();
        let quieter = transform.process(&buf[..len], 0.5).unwrap();
        assert!(!quieter.is_empty());
    }

    #[test]
    fn zero_factor_still_yields_a_frame() {
        let mut encoder =
            Encoder::new(SampleRate::Hz48000, Channels::Stereo, Application::Audio).unwrap();
        let pcm = vec![1000i16; 960 * 2];
        let mut buf = vec![0u8; 4000];
        let len = encoder.encode(&pcm, &mut buf).unwrap();

        let mut transform = VolumeTransform::new().unwrap();
        let silent = transform.process(&buf[..len], 0.0).unwrap();
        assert!(!silent.is_empty());
    }
}
