//! TCP connection extraction.
//!
//! One field-extraction pass per capture, streamed line-by-line into an
//! aggregator that folds per-packet records into stable [`TcpConnection`]
//! values keyed by stream id. The per-stream state lives only for the
//! duration of the pass; callers receive the finished connection list.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use log::debug;
use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::tools::{Invoker, ToolKind, field_extraction_args};

/// Payload bytes hashed per direction.
const PAYLOAD_PREFIX_LEN: usize = 64;

/// Fields requested from the extractor, in column order.
const CONNECTION_FIELDS: [&str; 12] = [
    "tcp.stream",
    "frame.time_epoch",
    "ip.src",
    "tcp.srcport",
    "ip.dst",
    "tcp.dstport",
    "tcp.flags.syn",
    "tcp.flags.ack",
    "ip.id",
    "tcp.len",
    "tcp.options",
    "tcp.payload",
];

/// Port class of the server-side port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortClass {
    /// Below 1024.
    WellKnown,
    /// 1024 through 49151.
    Registered,
    /// 49152 and above.
    Ephemeral,
}

impl PortClass {
    pub fn classify(port: u16) -> Self {
        if port < 1024 {
            PortClass::WellKnown
        } else if port < 49152 {
            PortClass::Registered
        } else {
            PortClass::Ephemeral
        }
    }
}

impl std::fmt::Display for PortClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PortClass::WellKnown => write!(f, "well-known"),
            PortClass::Registered => write!(f, "registered"),
            PortClass::Ephemeral => write!(f, "ephemeral"),
        }
    }
}

/// Stable per-connection record used for matching and reporting.
#[derive(Debug, Clone)]
pub struct TcpConnection {
    pub stream_id: u64,
    pub client_ip: String,
    pub server_ip: String,
    pub client_port: u16,
    pub server_port: u16,
    pub first_ts: f64,
    pub last_ts: f64,
    pub total_packets: u64,
    pub total_bytes: u64,
    pub client_packets: u64,
    pub server_packets: u64,
    pub client_bytes: u64,
    pub server_bytes: u64,
    /// IPIDs observed on the client side.
    pub ipid_set: BTreeSet<u16>,
    /// Canonicalised TCP options of the client SYN; empty when no SYN seen.
    pub syn_options: String,
    /// Hash over the first payload bytes in each direction; empty when the
    /// connection carried no payload.
    pub payload_hash: String,
    pub port_class: PortClass,
    /// Mean inter-packet gap in seconds.
    pub iat_mean: f64,
}

impl TcpConnection {
    pub fn duration(&self) -> f64 {
        self.last_ts - self.first_ts
    }

    /// `client -> server` endpoint summary for reports.
    pub fn endpoints(&self) -> String {
        format!(
            "{}:{} -> {}:{}",
            self.client_ip, self.client_port, self.server_ip, self.server_port
        )
    }
}

/// Extract all TCP connections from a capture.
pub fn extract_connections(invoker: &Invoker, capture: &Path) -> Result<Vec<TcpConnection>> {
    let args = field_extraction_args(capture, &CONNECTION_FIELDS, '\t', Some("tcp"));
    let mut aggregator = ConnectionAggregator::new();
    invoker.invoke_streaming(ToolKind::Tshark, &args, |line| aggregator.add_line(line))?;
    debug!(
        "extracted {} connections from {} ({} lines skipped)",
        aggregator.streams.len(),
        capture.display(),
        aggregator.skipped
    );
    Ok(aggregator.finish())
}

/// One parsed per-packet record.
#[derive(Debug)]
struct PacketRecord {
    stream_id: u64,
    ts: f64,
    src_ip: String,
    src_port: u16,
    dst_ip: String,
    dst_port: u16,
    syn: bool,
    ack: bool,
    ipid: Option<u16>,
    tcp_len: u64,
    options: String,
    payload: Vec<u8>,
}

impl PacketRecord {
    fn parse(line: &str) -> Option<Self> {
        let parts: Vec<&str> = line.split('\t').collect();
        if parts.len() < CONNECTION_FIELDS.len() {
            return None;
        }
        Some(Self {
            stream_id: parts[0].trim().parse().ok()?,
            ts: parts[1].trim().parse().ok()?,
            src_ip: parts[2].trim().to_string(),
            src_port: parts[3].trim().parse().ok()?,
            dst_ip: parts[4].trim().to_string(),
            dst_port: parts[5].trim().parse().ok()?,
            syn: parse_flag(parts[6]),
            ack: parse_flag(parts[7]),
            ipid: parse_ipid(parts[8]),
            tcp_len: parts[9].trim().parse().unwrap_or(0),
            options: canonical_hex(parts[10]),
            payload: parse_hex_bytes(parts[11], PAYLOAD_PREFIX_LEN),
        })
    }
}

/// Flags arrive as `1`/`0` (or `True`/`False` from older extractors).
fn parse_flag(field: &str) -> bool {
    matches!(field.trim(), "1" | "True" | "true")
}

fn parse_ipid(field: &str) -> Option<u16> {
    let field = field.trim();
    if let Some(hex) = field.strip_prefix("0x").or_else(|| field.strip_prefix("0X")) {
        return u16::from_str_radix(hex, 16).ok();
    }
    field.parse().ok()
}

/// Canonicalise a hex field: lowercase, separators stripped, order kept.
fn canonical_hex(field: &str) -> String {
    field
        .trim()
        .chars()
        .filter(|c| c.is_ascii_hexdigit())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Decode up to `limit` bytes from a hex field.
fn parse_hex_bytes(field: &str, limit: usize) -> Vec<u8> {
    let hex = canonical_hex(field);
    hex.as_bytes()
        .chunks_exact(2)
        .take(limit)
        .filter_map(|pair| {
            let high = (pair[0] as char).to_digit(16)?;
            let low = (pair[1] as char).to_digit(16)?;
            Some((high * 16 + low) as u8)
        })
        .collect()
}

#[derive(Debug, Default)]
struct DirectionAgg {
    packets: u64,
    bytes: u64,
    ipids: BTreeSet<u16>,
    payload_prefix: Vec<u8>,
}

impl DirectionAgg {
    fn observe(&mut self, record: &PacketRecord) {
        self.packets += 1;
        self.bytes += record.tcp_len;
        if let Some(ipid) = record.ipid {
            self.ipids.insert(ipid);
        }
        if self.payload_prefix.len() < PAYLOAD_PREFIX_LEN {
            let room = PAYLOAD_PREFIX_LEN - self.payload_prefix.len();
            self.payload_prefix
                .extend(record.payload.iter().take(room));
        }
    }
}

#[derive(Debug)]
struct StreamAgg {
    stream_id: u64,
    // Endpoints of the first packet seen; defines "forward".
    forward_src: (String, u16),
    forward_dst: (String, u16),
    first_ts: f64,
    last_ts: f64,
    prev_ts: f64,
    gap_sum: f64,
    gap_count: u64,
    forward: DirectionAgg,
    reverse: DirectionAgg,
    /// `Some(true)` when the first pure SYN came from the forward side.
    syn_forward: Option<bool>,
    syn_options: String,
}

impl StreamAgg {
    fn new(record: &PacketRecord) -> Self {
        Self {
            stream_id: record.stream_id,
            forward_src: (record.src_ip.clone(), record.src_port),
            forward_dst: (record.dst_ip.clone(), record.dst_port),
            first_ts: record.ts,
            last_ts: record.ts,
            prev_ts: record.ts,
            gap_sum: 0.0,
            gap_count: 0,
            forward: DirectionAgg::default(),
            reverse: DirectionAgg::default(),
            syn_forward: None,
            syn_options: String::new(),
        }
    }

    fn observe(&mut self, record: &PacketRecord) {
        let is_first = self.forward.packets + self.reverse.packets == 0;
        self.first_ts = self.first_ts.min(record.ts);
        if is_first {
            self.prev_ts = record.ts;
        } else if record.ts >= self.prev_ts {
            self.gap_sum += record.ts - self.prev_ts;
            self.gap_count += 1;
            self.prev_ts = record.ts;
        }
        self.last_ts = self.last_ts.max(record.ts);

        let is_forward = self.forward_src == (record.src_ip.clone(), record.src_port);
        if record.syn && !record.ack && self.syn_forward.is_none() {
            self.syn_forward = Some(is_forward);
            self.syn_options = record.options.clone();
        }
        if is_forward {
            self.forward.observe(record);
        } else {
            self.reverse.observe(record);
        }
    }

    fn finish(self) -> TcpConnection {
        // Client side: SYN sender first, then the non-well-known port,
        // then the side with the higher initial port.
        let forward_is_client = match self.syn_forward {
            Some(forward) => forward,
            None => {
                let forward_port = self.forward_src.1;
                let reverse_port = self.forward_dst.1;
                if (forward_port < 1024) != (reverse_port < 1024) {
                    forward_port >= 1024
                } else {
                    forward_port > reverse_port
                }
            }
        };

        let (client_end, server_end, client_agg, server_agg) = if forward_is_client {
            (self.forward_src, self.forward_dst, self.forward, self.reverse)
        } else {
            (self.forward_dst, self.forward_src, self.reverse, self.forward)
        };

        let payload_hash = if client_agg.payload_prefix.is_empty()
            && server_agg.payload_prefix.is_empty()
        {
            String::new()
        } else {
            let mut hasher = Sha256::new();
            hasher.update(&client_agg.payload_prefix);
            hasher.update(&server_agg.payload_prefix);
            let digest = hasher.finalize();
            digest.iter().map(|b| format!("{b:02x}")).collect()
        };

        let iat_mean = if self.gap_count > 0 {
            self.gap_sum / self.gap_count as f64
        } else {
            0.0
        };

        // SYN options belong to the client; a reverse-side SYN means the
        // capture saw the handshake from the other observation point.
        let syn_options = self.syn_options;

        TcpConnection {
            stream_id: self.stream_id,
            client_ip: client_end.0,
            client_port: client_end.1,
            server_ip: server_end.0,
            server_port: server_end.1,
            first_ts: self.first_ts,
            last_ts: self.last_ts,
            total_packets: client_agg.packets + server_agg.packets,
            total_bytes: client_agg.bytes + server_agg.bytes,
            client_packets: client_agg.packets,
            server_packets: server_agg.packets,
            client_bytes: client_agg.bytes,
            server_bytes: server_agg.bytes,
            ipid_set: client_agg.ipids,
            syn_options,
            payload_hash,
            port_class: PortClass::classify(server_end.1),
            iat_mean,
        }
    }
}

/// Streaming aggregator from extractor lines to connections.
#[derive(Debug, Default)]
struct ConnectionAggregator {
    streams: HashMap<u64, StreamAgg>,
    skipped: u64,
}

impl ConnectionAggregator {
    fn new() -> Self {
        Self::default()
    }

    fn add_line(&mut self, line: &str) {
        if line.trim().is_empty() {
            return;
        }
        let Some(record) = PacketRecord::parse(line) else {
            self.skipped += 1;
            return;
        };
        self.streams
            .entry(record.stream_id)
            .or_insert_with(|| StreamAgg::new(&record))
            .observe(&record);
    }

    fn finish(self) -> Vec<TcpConnection> {
        let mut connections: Vec<TcpConnection> =
            self.streams.into_values().map(StreamAgg::finish).collect();
        connections.sort_by_key(|c| c.stream_id);
        connections
    }
}

#[cfg(test)]
mod tests {
    use super::{
        ConnectionAggregator, PortClass, canonical_hex, parse_flag, parse_hex_bytes, parse_ipid,
    };

    fn line(
        stream: u64,
        ts: f64,
        src: (&str, u16),
        dst: (&str, u16),
        syn: bool,
        ack: bool,
        ipid: &str,
        len: u64,
        options: &str,
        payload: &str,
    ) -> String {
        format!(
            "{stream}\t{ts}\t{}\t{}\t{}\t{}\t{}\t{}\t{ipid}\t{len}\t{options}\t{payload}",
            src.0,
            src.1,
            dst.0,
            dst.1,
            if syn { "1" } else { "0" },
            if ack { "1" } else { "0" },
        )
    }

    const CLIENT: (&str, u16) = ("10.0.0.1", 50001);
    const SERVER: (&str, u16) = ("192.168.1.9", 443);

    #[test]
    fn port_classes_follow_iana_ranges() {
        assert_eq!(PortClass::classify(80), PortClass::WellKnown);
        assert_eq!(PortClass::classify(1024), PortClass::Registered);
        assert_eq!(PortClass::classify(49151), PortClass::Registered);
        assert_eq!(PortClass::classify(49152), PortClass::Ephemeral);
    }

    #[test]
    fn field_parsers_accept_extractor_variants() {
        assert!(parse_flag("1") && parse_flag("True"));
        assert!(!parse_flag("0") && !parse_flag(""));
        assert_eq!(parse_ipid("0x1a2b"), Some(0x1a2b));
        assert_eq!(parse_ipid("4660"), Some(4660));
        assert_eq!(parse_ipid(""), None);
        assert_eq!(canonical_hex("02:04:05:B4"), "020405b4");
        assert_eq!(parse_hex_bytes("de:ad:be:ef", 3), vec![0xde, 0xad, 0xbe]);
    }

    #[test]
    fn syn_sender_is_the_client() {
        let mut agg = ConnectionAggregator::new();
        // Server-side packet arrives first; the SYN still decides.
        agg.add_line(&line(1, 10.0, SERVER, CLIENT, false, false, "0x0001", 0, "", ""));
        agg.add_line(&line(1, 10.1, CLIENT, SERVER, true, false, "0x0002", 0, "020405b4", ""));
        agg.add_line(&line(1, 10.2, CLIENT, SERVER, false, true, "0x0003", 100, "", "48454c4c4f"));

        let conns = agg.finish();
        assert_eq!(conns.len(), 1);
        let conn = &conns[0];
        assert_eq!(conn.client_ip, "10.0.0.1");
        assert_eq!(conn.client_port, 50001);
        assert_eq!(conn.server_port, 443);
        assert_eq!(conn.syn_options, "020405b4");
        assert_eq!(conn.port_class, PortClass::WellKnown);
        assert_eq!(conn.client_packets, 2);
        assert_eq!(conn.server_packets, 1);
        assert_eq!(conn.client_bytes, 100);
    }

    #[test]
    fn without_syn_the_well_known_port_side_is_the_server() {
        let mut agg = ConnectionAggregator::new();
        // First packet flows server -> client; no SYN anywhere.
        agg.add_line(&line(2, 5.0, SERVER, CLIENT, false, true, "", 10, "", ""));
        agg.add_line(&line(2, 5.1, CLIENT, SERVER, false, true, "", 20, "", ""));

        let conn = &agg.finish()[0];
        assert_eq!(conn.server_ip, "192.168.1.9");
        assert_eq!(conn.client_ip, "10.0.0.1");
    }

    #[test]
    fn without_syn_or_well_known_port_the_higher_port_is_the_client() {
        let mut agg = ConnectionAggregator::new();
        let a = ("10.0.0.1", 40000u16);
        let b = ("10.0.0.2", 35000u16);
        agg.add_line(&line(3, 1.0, b, a, false, true, "", 0, "", ""));

        let conn = &agg.finish()[0];
        assert_eq!(conn.client_port, 40000);
        assert_eq!(conn.server_port, 35000);
    }

    #[test]
    fn ipids_come_from_the_client_side_only() {
        let mut agg = ConnectionAggregator::new();
        agg.add_line(&line(4, 1.0, CLIENT, SERVER, true, false, "0x0010", 0, "", ""));
        agg.add_line(&line(4, 1.1, CLIENT, SERVER, false, true, "0x0011", 0, "", ""));
        agg.add_line(&line(4, 1.2, SERVER, CLIENT, false, true, "0x9999", 0, "", ""));

        let conn = &agg.finish()[0];
        assert_eq!(conn.ipid_set.len(), 2);
        assert!(conn.ipid_set.contains(&0x0010));
        assert!(!conn.ipid_set.contains(&0x9999));
    }

    #[test]
    fn payload_hash_is_empty_without_payload_and_stable_with_it() {
        let mut agg = ConnectionAggregator::new();
        agg.add_line(&line(5, 1.0, CLIENT, SERVER, true, false, "", 0, "", ""));
        let empty = &agg.finish()[0];
        assert!(empty.payload_hash.is_empty());

        let run = |payload: &str| {
            let mut agg = ConnectionAggregator::new();
            agg.add_line(&line(6, 1.0, CLIENT, SERVER, false, true, "", 4, "", payload));
            agg.finish().remove(0).payload_hash
        };
        let first = run("cafebabe");
        assert_eq!(first.len(), 64);
        assert_eq!(first, run("ca:fe:ba:be"));
        assert_ne!(first, run("deadbeef"));
    }

    #[test]
    fn timestamps_and_gaps_aggregate_per_stream() {
        let mut agg = ConnectionAggregator::new();
        agg.add_line(&line(7, 100.0, CLIENT, SERVER, true, false, "", 0, "", ""));
        agg.add_line(&line(7, 100.2, SERVER, CLIENT, true, true, "", 0, "", ""));
        agg.add_line(&line(7, 100.6, CLIENT, SERVER, false, true, "", 0, "", ""));

        let conn = &agg.finish()[0];
        assert_eq!(conn.first_ts, 100.0);
        assert_eq!(conn.last_ts, 100.6);
        assert!(conn.first_ts <= conn.last_ts);
        assert!((conn.duration() - 0.6).abs() < 1e-9);
        assert!((conn.iat_mean - 0.3).abs() < 1e-9);
        assert_eq!(conn.total_packets, 3);
    }

    #[test]
    fn malformed_lines_are_skipped_and_counted() {
        let mut agg = ConnectionAggregator::new();
        agg.add_line("too\tfew\tfields");
        agg.add_line(&line(8, 1.0, CLIENT, SERVER, true, false, "", 0, "", ""));
        assert_eq!(agg.skipped, 1);
        assert_eq!(agg.finish().len(), 1);
    }

    #[test]
    fn connections_are_ordered_by_stream_id() {
        let mut agg = ConnectionAggregator::new();
        agg.add_line(&line(9, 1.0, CLIENT, SERVER, true, false, "", 0, "", ""));
        agg.add_line(&line(2, 1.0, CLIENT, SERVER, true, false, "", 0, "", ""));
        let ids: Vec<u64> = agg.finish().iter().map(|c| c.stream_id).collect();
        assert_eq!(ids, vec![2, 9]);
    }
}
