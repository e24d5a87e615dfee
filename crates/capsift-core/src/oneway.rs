//! One-way TCP stream detection.
//!
//! A stream is "one-way" when only one direction's ACK numbers progress
//! appreciably: either the reverse path was not captured or the peer never
//! sent anything. The detector is a pure streaming aggregator; feeding it is
//! the caller's job (see the preprocess `oneway` step, which pipes
//! field-extractor lines straight in).

use std::collections::HashMap;

/// Per-packet TCP summary consumed by the detector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpPacketInfo {
    pub stream_id: u64,
    pub src_ip: String,
    pub src_port: u16,
    pub dst_ip: String,
    pub dst_port: u16,
    pub ack: u64,
    pub tcp_len: u64,
}

impl TcpPacketInfo {
    /// Parse one tab-separated extractor line:
    /// `stream \t src_ip \t src_port \t dst_ip \t dst_port \t ack \t len`.
    ///
    /// Empty ack/len fields parse as zero, matching frames where the field
    /// is absent. Returns `None` for lines with too few fields or
    /// unparseable integers.
    pub fn parse_line(line: &str) -> Option<Self> {
        let parts: Vec<&str> = line.split('\t').collect();
        if parts.len() < 7 {
            return None;
        }
        Some(Self {
            stream_id: parts[0].trim().parse().ok()?,
            src_ip: parts[1].trim().to_string(),
            src_port: parts[2].trim().parse().ok()?,
            dst_ip: parts[3].trim().to_string(),
            dst_port: parts[4].trim().parse().ok()?,
            ack: parse_or_zero(parts[5])?,
            tcp_len: parse_or_zero(parts[6])?,
        })
    }
}

fn parse_or_zero(field: &str) -> Option<u64> {
    let field = field.trim();
    if field.is_empty() {
        return Some(0);
    }
    field.parse().ok()
}

/// Which direction of the stream carried the traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveDirection {
    /// The direction first observed for the stream.
    Forward,
    /// The opposite direction.
    Reverse,
}

impl std::fmt::Display for ActiveDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActiveDirection::Forward => write!(f, "forward"),
            ActiveDirection::Reverse => write!(f, "reverse"),
        }
    }
}

/// Verdict for one stream judged one-way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OneWayAnalysis {
    pub stream_id: u64,
    pub active: ActiveDirection,
    /// ACK progression (max - min) observed on the active direction.
    pub ack_delta: u64,
}

#[derive(Debug, Default, Clone)]
struct DirectionStats {
    min_ack: u64,
    max_ack: u64,
    packets: u64,
    payload_bytes: u64,
}

impl DirectionStats {
    fn observe(&mut self, ack: u64, tcp_len: u64) {
        if self.packets == 0 {
            self.min_ack = ack;
            self.max_ack = ack;
        } else {
            self.min_ack = self.min_ack.min(ack);
            self.max_ack = self.max_ack.max(ack);
        }
        self.packets += 1;
        self.payload_bytes += tcp_len;
    }

    fn ack_progress(&self) -> u64 {
        self.max_ack - self.min_ack
    }
}

#[derive(Debug)]
struct StreamState {
    // Endpoint pair of the first packet seen; defines "forward".
    forward_src: (String, u16),
    forward: DirectionStats,
    reverse: Option<DirectionStats>,
}

/// Quiet-side packet ceiling: a direction with more traffic than this is
/// considered genuinely active even when its ACKs barely move.
const QUIET_SIDE_MAX_PACKETS: u64 = 5;

/// Streaming one-way stream detector.
///
/// Feed packets with [`OneWayDetector::add_packet`] (or raw lines with
/// [`OneWayDetector::add_line`]), then call [`OneWayDetector::analyze`].
#[derive(Debug)]
pub struct OneWayDetector {
    ack_threshold: u64,
    streams: HashMap<u64, StreamState>,
    skipped: u64,
}

impl OneWayDetector {
    pub fn new(ack_threshold: u64) -> Self {
        Self {
            ack_threshold,
            streams: HashMap::new(),
            skipped: 0,
        }
    }

    /// Number of input lines dropped as malformed.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Parse and ingest one extractor line; malformed lines bump `skipped`.
    pub fn add_line(&mut self, line: &str) {
        if line.trim().is_empty() {
            return;
        }
        match TcpPacketInfo::parse_line(line) {
            Some(info) => self.add_packet(info),
            None => self.skipped += 1,
        }
    }

    pub fn add_packet(&mut self, info: TcpPacketInfo) {
        let state = self
            .streams
            .entry(info.stream_id)
            .or_insert_with(|| StreamState {
                forward_src: (info.src_ip.clone(), info.src_port),
                forward: DirectionStats::default(),
                reverse: None,
            });

        if state.forward_src == (info.src_ip.clone(), info.src_port) {
            state.forward.observe(info.ack, info.tcp_len);
        } else {
            state
                .reverse
                .get_or_insert_with(DirectionStats::default)
                .observe(info.ack, info.tcp_len);
        }
    }

    /// Classify all aggregated streams, in ascending stream-id order.
    ///
    /// Rules:
    /// - only one direction present: always one-way;
    /// - one direction's ACK progression above the threshold while the
    ///   other stays at or below it with few packets: one-way;
    /// - both directions above the threshold: bidirectional;
    /// - both at or below: not reported.
    pub fn analyze(&self) -> Vec<OneWayAnalysis> {
        let mut verdicts = Vec::new();
        for (&stream_id, state) in &self.streams {
            let forward_progress = state.forward.ack_progress();
            match &state.reverse {
                None => {
                    verdicts.push(OneWayAnalysis {
                        stream_id,
                        active: ActiveDirection::Forward,
                        ack_delta: forward_progress,
                    });
                }
                Some(reverse) => {
                    let reverse_progress = reverse.ack_progress();
                    let forward_active = forward_progress > self.ack_threshold;
                    let reverse_active = reverse_progress > self.ack_threshold;

                    if forward_active
                        && !reverse_active
                        && reverse.packets <= QUIET_SIDE_MAX_PACKETS
                    {
                        verdicts.push(OneWayAnalysis {
                            stream_id,
                            active: ActiveDirection::Forward,
                            ack_delta: forward_progress,
                        });
                    } else if reverse_active
                        && !forward_active
                        && state.forward.packets <= QUIET_SIDE_MAX_PACKETS
                    {
                        verdicts.push(OneWayAnalysis {
                            stream_id,
                            active: ActiveDirection::Reverse,
                            ack_delta: reverse_progress,
                        });
                    }
                }
            }
        }
        verdicts.sort_by_key(|v| v.stream_id);
        verdicts
    }
}
