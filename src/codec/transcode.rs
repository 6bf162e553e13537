//! External ffmpeg process wrapper.
//!
//! Input is piped into stdin (auto-detected container), output is
//! 48 kHz stereo OGG Opus on stdout. The argument list is assembled from
//! the queue's filter chain at spawn time.

use std::process::Stdio;

use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::debug;

use crate::common::AnyResult;
use crate::protocol::FilterChain;

pub struct Transcoder {
    child: Child,
}

impl Transcoder {
    /// Spawn ffmpeg for the given chain.
    pub fn spawn(chain: &FilterChain) -> AnyResult<Self> {
        let args = build_args(chain);
        debug!("spawning ffmpeg {}", args.join(" "));

        let child = Command::new("ffmpeg")
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        Ok(Self { child })
    }

    pub fn stdin(&mut self) -> Option<ChildStdin> {
        self.child.stdin.take()
    }

    pub fn stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }
}

fn build_args(chain: &FilterChain) -> Vec<String> {
    let mut args = chain.input_args();
    args.extend(
        [
            "-i",
            "-",
            "-analyzeduration",
            "0",
            "-loglevel",
            "0",
            "-f",
            "s16le",
            "-acodec",
            "libopus",
            "-f",
            "opus",
            "-ar",
            "48000",
            "-ac",
            "2",
        ]
        .into_iter()
        .map(String::from),
    );
    args.extend(chain.output_args().iter().cloned());
    args.push("pipe:1".into());
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::filters::{FilterSpec, Oscillation};

    #[test]
    fn plain_args_have_no_seek_or_graph() {
        let args = build_args(&FilterChain::new());
        assert_eq!(args[0], "-i");
        assert_eq!(args[1], "-");
        assert_eq!(args.last().unwrap(), "pipe:1");
        assert!(!args.contains(&"-af".to_string()));
    }

    #[test]
    fn seek_args_come_before_input() {
        let mut chain = FilterChain::new();
        chain.set_seek(1500);
        let args = build_args(&chain);
        assert_eq!(&args[..3], &["-ss", "1500ms", "-accurate_seek"]);
        assert_eq!(args[3], "-i");
    }

    #[test]
    fn graph_args_come_after_output_format() {
        let mut chain = FilterChain::new();
        chain.apply_spec(&FilterSpec {
            vibrato: Some(Oscillation {
                frequency: 7.0,
                depth: 0.3,
            }),
            ..Default::default()
        });
        let args = build_args(&chain);
        let af = args.iter().position(|a| a == "-af").unwrap();
        assert_eq!(args[af + 1], "vibrato=f=7:d=0.3");
        assert!(af > args.iter().position(|a| a == "-ac").unwrap());
    }
}
