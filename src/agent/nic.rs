//! NIC throughput sampling.
//!
//! Reads cumulative RX/TX byte counters over all non-loopback interfaces
//! and derives a windowed bytes-per-second pair between consecutive calls.
//! The first call yields zero; counter resets clamp to zero instead of
//! going negative.

use std::time::Instant;

use tracing::debug;

#[derive(Debug, Default)]
pub struct NicSampler {
    last: Option<(Instant, u64, u64)>,
}

impl NicSampler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Windowed `(rx_bps, tx_bps)` in bytes per second since the last call.
    pub fn sample(&mut self) -> (f64, f64) {
        let now = Instant::now();
        let (rx, tx) = match read_counters() {
            Ok(counters) => counters,
            Err(e) => {
                debug!(error = %e, "interface counters unavailable");
                (0, 0)
            }
        };

        let rates = match self.last {
            None => (0.0, 0.0),
            Some((then, last_rx, last_tx)) => {
                let dt = now.duration_since(then).as_secs_f64();
                if dt <= 0.0 {
                    (0.0, 0.0)
                } else {
                    (
                        rx.saturating_sub(last_rx) as f64 / dt,
                        tx.saturating_sub(last_tx) as f64 / dt,
                    )
                }
            }
        };
        self.last = Some((now, rx, tx));
        rates
    }
}

#[cfg(target_os = "linux")]
fn read_counters() -> std::io::Result<(u64, u64)> {
    Ok(parse_proc_net_dev(&std::fs::read_to_string("/proc/net/dev")?))
}

#[cfg(not(target_os = "linux"))]
fn read_counters() -> std::io::Result<(u64, u64)> {
    // No portable counter source; heartbeats then carry zero rates.
    Ok((0, 0))
}

/// Sums RX/TX byte counters across all interfaces except loopback.
///
/// `/proc/net/dev` carries two header lines, then per interface
/// `name: rx_bytes ... tx_bytes ...` with the TX byte counter in the ninth
/// numeric column.
fn parse_proc_net_dev(text: &str) -> (u64, u64) {
    let mut rx_total = 0u64;
    let mut tx_total = 0u64;
    for line in text.lines().skip(2) {
        let Some((name, counters)) = line.split_once(':') else {
            continue;
        };
        if name.trim() == "lo" {
            continue;
        }
        let fields: Vec<&str> = counters.split_whitespace().collect();
        if fields.len() < 9 {
            continue;
        }
        rx_total += fields[0].parse::<u64>().unwrap_or(0);
        tx_total += fields[8].parse::<u64>().unwrap_or(0);
    }
    (rx_total, tx_total)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
Inter-|   Receive                                                |  Transmit
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
    lo: 9999999    1000    0    0    0     0          0         0  9999999    1000    0    0    0     0       0          0
  eth0: 1000000    2000    0    0    0     0          0         0   500000    1500    0    0    0     0       0          0
  eth1:  250000     800    0    0    0     0          0         0   125000     400    0    0    0     0       0          0
";

    #[test]
    fn test_parse_skips_loopback_and_sums() {
        let (rx, tx) = parse_proc_net_dev(SAMPLE);
        assert_eq!(rx, 1_250_000);
        assert_eq!(tx, 625_000);
    }

    #[test]
    fn test_parse_tolerates_garbage() {
        assert_eq!(parse_proc_net_dev(""), (0, 0));
        assert_eq!(parse_proc_net_dev("junk\nmore junk\nno colon here\n"), (0, 0));
        assert_eq!(parse_proc_net_dev("h1\nh2\n eth0: 1 2\n"), (0, 0));
    }

    #[test]
    fn test_first_sample_is_zero() {
        let mut sampler = NicSampler::new();
        assert_eq!(sampler.sample(), (0.0, 0.0));
    }

    #[test]
    fn test_windowed_rates_are_non_negative() {
        let mut sampler = NicSampler::new();
        sampler.sample();
        // Fake a counter reset by pretending the previous totals were huge.
        sampler.last = Some((Instant::now() - std::time::Duration::from_secs(1), u64::MAX, u64::MAX));
        let (rx, tx) = sampler.sample();
        assert_eq!(rx, 0.0);
        assert_eq!(tx, 0.0);
    }
}
