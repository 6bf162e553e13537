use serde::{Deserialize, Serialize};

/// Center frequencies of the 15 equalizer bands, in Hz.
const EQ_BAND_HZ: [u32; 15] = [
    25, 40, 63, 100, 160, 250, 400, 630, 1000, 1600, 2500, 4000, 6300, 10000, 16000,
];

/// Client-supplied audio filter configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FilterSpec {
    pub volume: Option<f64>,
    pub equalizer: Option<Vec<EqBand>>,
    pub timescale: Option<Timescale>,
    pub tremolo: Option<Oscillation>,
    pub vibrato: Option<Oscillation>,
    pub rotation: Option<Rotation>,
    pub low_pass: Option<LowPass>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EqBand {
    pub band: u8,
    pub gain: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct Timescale {
    pub rate: f64,
    pub pitch: f64,
    pub speed: f64,
}

impl Default for Timescale {
    fn default() -> Self {
        Self {
            rate: 1.0,
            pitch: 1.0,
            speed: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct Oscillation {
    pub frequency: f64,
    pub depth: f64,
}

impl Default for Oscillation {
    fn default() -> Self {
        Self {
            frequency: 2.0,
            depth: 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rotation {
    pub rotation_hz: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LowPass {
    pub smoothing: f64,
}

/// The ordered ffmpeg argument list owned by a queue, together with the
/// seek offset and playback-rate bookkeeping derived from it.
///
/// The chain is read at argv-construction time, so mutations made while a
/// pipeline is arming are picked up by that pipeline.
#[derive(Debug, Clone, Default)]
pub struct FilterChain {
    seek_ms: Option<u64>,
    graph_args: Vec<String>,
    rate: f64,
}

impl FilterChain {
    pub fn new() -> Self {
        Self {
            seek_ms: None,
            graph_args: Vec::new(),
            rate: 1.0,
        }
    }

    /// Seek offset currently armed into the chain, in milliseconds.
    pub fn seek_ms(&self) -> u64 {
        self.seek_ms.unwrap_or(0)
    }

    /// Playback rate of the active timescale filter (1.0 when none).
    pub fn rate(&self) -> f64 {
        if self.rate > 0.0 { self.rate } else { 1.0 }
    }

    /// True when nothing would change the audio: the direct demux path is
    /// allowed and transcoding can be skipped entirely.
    pub fn is_passthrough(&self) -> bool {
        self.seek_ms.is_none() && self.graph_args.is_empty()
    }

    /// Arm (or replace) the `-ss <ms>ms -accurate_seek` pair.
    pub fn set_seek(&mut self, ms: u64) {
        self.seek_ms = Some(ms);
    }

    /// Drop the seek arguments (new track, fresh offset).
    pub fn clear_seek(&mut self) {
        self.seek_ms = None;
    }

    /// Replace the filter graph from a typed spec, preserving any active
    /// seek arguments.
    pub fn apply_spec(&mut self, spec: &FilterSpec) {
        self.graph_args = Self::assemble(spec);
        self.rate = spec.timescale.map(|t| t.speed).unwrap_or(1.0);
    }

    /// Replace the whole chain with a raw ffmpeg argument sequence. Seek
    /// and rate bookkeeping reset since the raw list owns the pipeline now.
    pub fn apply_raw(&mut self, args: Vec<String>) {
        self.seek_ms = None;
        self.rate = 1.0;
        self.graph_args = args;
    }

    /// Arguments spliced before `-i -` (input-side seek).
    pub fn input_args(&self) -> Vec<String> {
        match self.seek_ms {
            Some(ms) => vec![
                "-ss".into(),
                format!("{ms}ms"),
                "-accurate_seek".into(),
            ],
            None => Vec::new(),
        }
    }

    /// Arguments appended after the output format options.
    pub fn output_args(&self) -> &[String] {
        &self.graph_args
    }

    /// Build the `-af <graph>` pair from a spec. Filter order is fixed:
    /// volume, equalizer, timescale, tremolo, vibrato, rotation, low-pass.
    fn assemble(spec: &FilterSpec) -> Vec<String> {
        let mut graph: Vec<String> = Vec::new();

        if let Some(v) = spec.volume {
            graph.push(format!("volume={v}"));
        }

        if let Some(bands) = &spec.equalizer {
            let mut table = [0.0f64; 15];
            for band in bands {
                if let Some(slot) = table.get_mut(band.band as usize) {
                    *slot = band.gain;
                }
            }
            let eq: Vec<String> = table
                .iter()
                .enumerate()
                .filter(|(_, gain)| **gain > 0.0)
                .map(|(i, gain)| {
                    let db = (gain.log2() * 12.0).round();
                    format!("equalizer=f={}:width_type=h:width=1:g={db}", EQ_BAND_HZ[i])
                })
                .collect();
            if !eq.is_empty() {
                graph.push(eq.join(","));
            }
        }

        if let Some(ts) = spec.timescale {
            let finalspeed = ts.speed + (1.0 - ts.pitch);
            graph.push(format!(
                "aresample=48000,asetrate=48000*{},atempo={finalspeed},aresample=48000",
                ts.pitch + (1.0 - ts.rate)
            ));
        }

        if let Some(t) = spec.tremolo {
            graph.push(format!("tremolo=f={}:d={}", t.frequency, t.depth));
        }
        if let Some(v) = spec.vibrato {
            graph.push(format!("vibrato=f={}:d={}", v.frequency, v.depth));
        }
        if let Some(r) = spec.rotation {
            graph.push(format!("apulsator=hz={}", r.rotation_hz));
        }
        if let Some(lp) = spec.low_pass {
            graph.push(format!("lowpass=f={}", 500.0 / lp.smoothing));
        }

        if graph.is_empty() {
            Vec::new()
        } else {
            vec!["-af".into(), graph.join(",")]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_spec_is_passthrough() {
        let mut chain = FilterChain::new();
        chain.apply_spec(&FilterSpec::default());
        assert!(chain.is_passthrough());
        assert!(chain.output_args().is_empty());
    }

    #[test]
    fn seek_args_survive_filter_replacement() {
        let mut chain = FilterChain::new();
        chain.set_seek(3000);
        chain.apply_spec(&FilterSpec {
            tremolo: Some(Oscillation {
                frequency: 4.0,
                depth: 0.75,
            }),
            ..Default::default()
        });
        assert_eq!(chain.input_args(), vec!["-ss", "3000ms", "-accurate_seek"]);
        assert_eq!(chain.output_args()[0], "-af");
        assert_eq!(chain.output_args()[1], "tremolo=f=4:d=0.75");
    }

    #[test]
    fn timescale_graph_and_rate() {
        let mut chain = FilterChain::new();
        chain.apply_spec(&FilterSpec {
            timescale: Some(Timescale {
                speed: 2.0,
                ..Default::default()
            }),
            ..Default::default()
        });
        assert_eq!(chain.rate(), 2.0);
        // pitch 1.0, rate 1.0 -> asetrate factor 1, atempo = 2.0
        assert_eq!(
            chain.output_args()[1],
            "aresample=48000,asetrate=48000*1,atempo=2,aresample=48000"
        );
    }

    #[test]
    fn neutral_timescale_keeps_rate_one() {
        let mut chain = FilterChain::new();
        chain.apply_spec(&FilterSpec {
            timescale: Some(Timescale::default()),
            ..Default::default()
        });
        assert_eq!(chain.rate(), 1.0);
    }

    #[test]
    fn equalizer_emits_only_touched_bands() {
        let mut chain = FilterChain::new();
        chain.apply_spec(&FilterSpec {
            equalizer: Some(vec![
                EqBand { band: 0, gain: 2.0 },
                EqBand {
                    band: 14,
                    gain: 4.0,
                },
                // out-of-range band index is ignored
                EqBand {
                    band: 15,
                    gain: 8.0,
                },
            ]),
            ..Default::default()
        });
        let graph = &chain.output_args()[1];
        // log2(2)*12 = 12 dB on band 0 (25 Hz), log2(4)*12 = 24 dB on band 14
        assert_eq!(
            graph,
            "equalizer=f=25:width_type=h:width=1:g=12,\
             equalizer=f=16000:width_type=h:width=1:g=24"
        );
    }

    #[test]
    fn low_pass_cutoff_derivation() {
        let mut chain = FilterChain::new();
        chain.apply_spec(&FilterSpec {
            low_pass: Some(LowPass { smoothing: 20.0 }),
            ..Default::default()
        });
        assert_eq!(chain.output_args()[1], "lowpass=f=25");
    }

    #[test]
    fn raw_args_reset_seek_and_rate() {
        let mut chain = FilterChain::new();
        chain.set_seek(1000);
        chain.apply_raw(vec!["-af".into(), "anull".into()]);
        assert_eq!(chain.seek_ms(), 0);
        assert_eq!(chain.rate(), 1.0);
        assert!(chain.input_args().is_empty());
        assert_eq!(chain.output_args(), ["-af", "anull"]);
    }

    #[test]
    fn filter_order_is_stable() {
        let mut chain = FilterChain::new();
        chain.apply_spec(&FilterSpec {
            volume: Some(0.5),
            rotation: Some(Rotation { rotation_hz: 0.2 }),
            low_pass: Some(LowPass { smoothing: 10.0 }),
            ..Default::default()
        });
        assert_eq!(
            chain.output_args()[1],
            "volume=0.5,apulsator=hz=0.2,lowpass=f=50"
        );
    }
}
