//! Server-wide statistics pushed to every client once a minute.

use serde::Serialize;

use crate::pool::ThreadPool;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    pub players: i32,
    pub playing_players: i32,
    /// Milliseconds since the server came up.
    pub uptime: u64,
    pub memory: Memory,
    pub cpu: Cpu,
    pub frame_stats: FrameStats,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Memory {
    pub free: u64,
    pub used: u64,
    pub allocated: u64,
    pub reservable: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Cpu {
    pub cores: i32,
    pub system_load: f64,
    pub lavalink_load: f64,
}

/// Per-frame delivery counters. This node reports the fixed wire shape.
#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameStats {
    pub sent: i32,
    pub nulled: i32,
    pub deficit: i32,
}

pub async fn collect(pool: &ThreadPool, uptime_ms: u64) -> Stats {
    let worker_stats = pool.stats().await;
    let (used, free, total) = read_memory();

    Stats {
        players: worker_stats.players as i32,
        playing_players: worker_stats.playing_players as i32,
        uptime: uptime_ms,
        memory: Memory {
            free,
            used,
            allocated: used,
            reservable: total,
        },
        cpu: Cpu {
            cores: num_cpus(),
            system_load: read_system_load(),
            lavalink_load: 0.0,
        },
        frame_stats: FrameStats::default(),
    }
}

pub fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(1)
}

fn read_system_load() -> f64 {
    std::fs::read_to_string("/proc/loadavg")
        .ok()
        .and_then(|s| {
            s.split_whitespace()
                .next()
                .and_then(|v| v.parse::<f64>().ok())
        })
        .unwrap_or(0.0)
}

/// (rss, available, total), all in bytes, from procfs.
fn read_memory() -> (u64, u64, u64) {
    let rss = std::fs::read_to_string("/proc/self/status")
        .ok()
        .and_then(|s| {
            s.lines().find(|l| l.starts_with("VmRSS:")).and_then(|l| {
                l.split_whitespace()
                    .nth(1)
                    .and_then(|v| v.parse::<u64>().ok())
            })
        })
        .map(|kb| kb * 1024)
        .unwrap_or(0);

    let (mut total, mut free) = (0u64, 0u64);
    if let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") {
        for line in meminfo.lines() {
            let value = || {
                line.split_whitespace()
                    .nth(1)
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(0)
                    * 1024
            };
            if line.starts_with("MemTotal:") {
                total = value();
            } else if line.starts_with("MemAvailable:") {
                free = value();
            }
        }
    }
    (rss, free, total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_stats_wire_shape() {
        let json = serde_json::to_value(FrameStats::default()).unwrap();
        assert_eq!(json["sent"], 0);
        assert_eq!(json["nulled"], 0);
        assert_eq!(json["deficit"], 0);
    }

    #[test]
    fn at_least_one_core() {
        assert!(num_cpus() >= 1);
    }
}
