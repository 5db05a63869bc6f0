// ABOUTME: Tail-parses the proxy log file into time-bucketed anomaly counts and rtt percentiles
// ABOUTME: Read-only and off the hot path; never invoked from a connection task

use std::collections::BTreeMap;
use std::io::{Read, Seek, SeekFrom};

use serde::Serialize;

const ANOMALY_KINDS: [&str; 3] = ["out_of_order", "stray_response", "duplicate_request"];

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct KindCounts {
    pub out_of_order: u64,
    pub stray_response: u64,
    pub duplicate_request: u64,
    pub total: u64,
}

impl KindCounts {
    fn add(&mut self, kind: &str) {
        match kind {
            "out_of_order" => self.out_of_order += 1,
            "stray_response" => self.stray_response += 1,
            "duplicate_request" => self.duplicate_request += 1,
            _ => return,
        }
        self.total += 1;
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SeriesPoint {
    pub t: String,
    #[serde(flatten)]
    pub counts: KindCounts,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RttSummary {
    pub avg_ms: f64,
    pub p95_ms: f64,
    pub samples: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MetricsReport {
    pub counts: KindCounts,
    pub series: Vec<SeriesPoint>,
    pub rtt: RttSummary,
}

/// One relevant log line, decomposed for aggregation.
#[derive(Debug, Clone, PartialEq)]
struct LineMatch {
    minute: String,
    kind: &'static str,
    rtt_ms: Option<u64>,
    #[allow(dead_code)]
    tid: Option<u16>,
}

/// Read at most `max_scan_bytes` from the tail of `path`, decode lossily, and
/// derive a [`MetricsReport`] covering lines within the trailing window.
///
/// `window_minutes` bounds which one-minute buckets are kept in `series`:
/// buckets more than `window_minutes` before the latest matched line are
/// dropped. `counts`/`rtt` always aggregate every matched line in the scanned
/// tail, regardless of the window.
pub fn scan(path: impl AsRef<std::path::Path>, window_minutes: i64, max_scan_bytes: u64) -> std::io::Result<MetricsReport> {
    let mut file = std::fs::File::open(path)?;
    let len = file.metadata()?.len();
    let start = len.saturating_sub(max_scan_bytes);
    file.seek(SeekFrom::Start(start))?;
    let mut raw = Vec::with_capacity((len - start) as usize);
    file.read_to_end(&mut raw)?;
    let text = String::from_utf8_lossy(&raw);
    Ok(aggregate(&text, window_minutes))
}

fn aggregate(text: &str, window_minutes: i64) -> MetricsReport {
    let mut buckets: BTreeMap<String, KindCounts> = BTreeMap::new();
    let mut counts = KindCounts::default();
    let mut rtts: Vec<u64> = Vec::new();
    let mut last_minute: Option<String> = None;

    for line in text.lines() {
        let Some(m) = parse_line(line) else { continue };
        counts.add(m.kind);
        buckets.entry(m.minute.clone()).or_default().add(m.kind);
        if let Some(rtt) = m.rtt_ms {
            rtts.push(rtt);
        }
        last_minute = Some(m.minute);
    }

    let mut series: Vec<SeriesPoint> = buckets
        .into_iter()
        .map(|(t, counts)| SeriesPoint { t, counts })
        .collect();
    series.sort_by(|a, b| a.t.cmp(&b.t));

    if let Some(last) = last_minute.as_deref() {
        series.retain(|point| minutes_between(&point.t, last) <= window_minutes);
    }

    rtts.sort_unstable();
    let rtt = summarize_rtt(&rtts);

    MetricsReport { counts, series, rtt }
}

fn summarize_rtt(sorted: &[u64]) -> RttSummary {
    if sorted.is_empty() {
        return RttSummary { avg_ms: 0.0, p95_ms: 0.0, samples: 0 };
    }
    let sum: u64 = sorted.iter().sum();
    let avg_ms = sum as f64 / sorted.len() as f64;
    let idx = ((0.95 * sorted.len() as f64).floor() as isize - 1).max(0) as usize;
    let idx = idx.min(sorted.len() - 1);
    RttSummary { avg_ms, p95_ms: sorted[idx] as f64, samples: sorted.len() }
}

/// Minutes between two `"HH:MM"` strings, treated as same-day wall clock
/// (the scanner only ever compares buckets within one tail window).
fn minutes_between(earlier: &str, later: &str) -> i64 {
    fn to_minutes(hhmm: &str) -> i64 {
        let mut parts = hhmm.splitn(2, ':');
        let h: i64 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
        let m: i64 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
        h * 60 + m
    }
    to_minutes(later) - to_minutes(earlier)
}

fn parse_line(line: &str) -> Option<LineMatch> {
    let timestamp = parse_leading_timestamp(line)?;
    let kind = ANOMALY_KINDS.iter().copied().find(|k| line.contains(k))?;
    let rtt_ms = extract_u64(line, "rtt=");
    let tid = extract_u64(line, "tid=").map(|v| v as u16);
    Some(LineMatch { minute: timestamp, kind, rtt_ms, tid })
}

/// `"YYYY-MM-DD HH:MM:SS"` at the start of the line, truncated to `"HH:MM"`.
fn parse_leading_timestamp(line: &str) -> Option<String> {
    if !line.is_char_boundary(19) || line.len() < 19 {
        return None;
    }
    let candidate = &line[..19];
    let b = candidate.as_bytes();
    let is_digit = |i: usize| b[i].is_ascii_digit();
    let digit_positions = [0, 1, 2, 3, 5, 6, 8, 9, 11, 12, 14, 15, 17, 18];
    let separator_positions = [(4, b'-'), (7, b'-'), (10, b' '), (13, b':'), (16, b':')];

    if !digit_positions.iter().all(|&i| is_digit(i)) {
        return None;
    }
    if !separator_positions.iter().all(|&(i, expected)| b[i] == expected) {
        return None;
    }
    Some(candidate[11..16].to_string())
}

fn extract_u64(line: &str, prefix: &str) -> Option<u64> {
    let start = line.find(prefix)? + prefix.len();
    let digits: String = line[start..].chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ignores_per_frame_chatter_lines() {
        let line = "2026-07-28 14:03:22 DEBUG [modbus_proxy::connection] [conn-1] C>W len=12 tid=1 uid=17 func=3";
        assert!(parse_line(line).is_none());
    }

    #[test]
    fn matches_a_stray_response_line_and_extracts_tid() {
        let line = "2026-07-28 14:03:22 WARN [modbus_proxy::connection] [conn-1] stray_response tid=7";
        let m = parse_line(line).unwrap();
        assert_eq!(m.kind, "stray_response");
        assert_eq!(m.minute, "14:03");
        assert_eq!(m.tid, Some(7));
    }

    #[test]
    fn extracts_rtt_when_present() {
        let line = "2026-07-28 14:03:22 INFO [modbus_proxy::connection] out_of_order rtt=123ms tid=9";
        let m = parse_line(line).unwrap();
        assert_eq!(m.rtt_ms, Some(123));
    }

    #[test]
    fn aggregates_counts_and_buckets_by_minute() {
        let text = "\
2026-07-28 14:03:10 WARN [x] stray_response tid=1
2026-07-28 14:03:40 WARN [x] stray_response tid=2
2026-07-28 14:04:05 WARN [x] duplicate_request tid=3
";
        let report = aggregate(text, 60);
        assert_eq!(report.counts.stray_response, 2);
        assert_eq!(report.counts.duplicate_request, 1);
        assert_eq!(report.counts.total, 3);
        assert_eq!(report.series.len(), 2);
        assert_eq!(report.series[0].t, "14:03");
        assert_eq!(report.series[0].counts.stray_response, 2);
        assert_eq!(report.series[1].t, "14:04");
        assert_eq!(report.series[1].counts.duplicate_request, 1);
    }

    #[test]
    fn p95_index_is_floor_point_95_n_minus_one_clamped_at_zero() {
        let sorted: Vec<u64> = (1..=20).collect();
        let summary = summarize_rtt(&sorted);
        // floor(0.95 * 20) - 1 = 18 (0-indexed) -> value 19
        assert_eq!(summary.p95_ms, 19.0);
        assert_eq!(summary.samples, 20);
    }

    #[test]
    fn p95_clamped_at_zero_for_small_samples() {
        let sorted = vec![42u64];
        let summary = summarize_rtt(&sorted);
        assert_eq!(summary.p95_ms, 42.0);
    }
}
