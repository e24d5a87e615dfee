//! Derived report bodies: match listings, per-packet and per-stream
//! difference tables, endpoint topology, and comparative analysis.
//!
//! All functions here are pure formatters over matcher/extractor output;
//! the report writer handles file placement, markdown wrapping, and meta
//! sidecars.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::analyze::ModuleOutcome;
use crate::connections::TcpConnection;
use crate::matching::MatchResult;

/// Matched-connection listing plus the run summary.
pub fn matched_connections_table(result: &MatchResult) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Matched connections: {}", result.pairs.len());
    let _ = writeln!(out);

    for (index, pair) in result.pairs.iter().enumerate() {
        let _ = writeln!(
            out,
            "[{}] A: stream {:<6} {}",
            index + 1,
            pair.a.stream_id,
            pair.a.endpoints()
        );
        let _ = writeln!(
            out,
            "    B: stream {:<6} {}",
            pair.b.stream_id,
            pair.b.endpoints()
        );
        let evidence: Vec<&str> = pair.evidence.keys().copied().collect();
        let _ = writeln!(
            out,
            "    score={:.3} confidence={} evidence: {}",
            pair.score,
            pair.confidence,
            if evidence.is_empty() {
                "(none)".to_string()
            } else {
                evidence.join(", ")
            }
        );
    }

    let stats = &result.stats;
    let _ = writeln!(out);
    let _ = writeln!(out, "Summary");
    let _ = writeln!(out, "  Total A: {}  Total B: {}", stats.total_a, stats.total_b);
    let _ = writeln!(
        out,
        "  Matched: A {} ({:.1}%), B {} ({:.1}%)",
        stats.matched_a,
        stats.match_rate_a * 100.0,
        stats.matched_b,
        stats.match_rate_b * 100.0
    );
    let _ = writeln!(
        out,
        "  Unmatched: A {}, B {}",
        stats.unmatched_a, stats.unmatched_b
    );
    let _ = writeln!(out, "  Average score: {:.3}", stats.average_score);
    out
}

/// Per-packet difference summary across the matched pairs of two captures.
pub fn packet_difference_table(result: &MatchResult) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<10} {:<10} {:>10} {:>10} {:>8} {:>12} {:>12} {:>10} {:>7}",
        "Stream A",
        "Stream B",
        "Pkts A",
        "Pkts B",
        "dPkts",
        "Bytes A",
        "Bytes B",
        "dBytes",
        "Score"
    );
    let _ = writeln!(out, "{}", "-".repeat(96));

    for pair in &result.pairs {
        let _ = writeln!(
            out,
            "{:<10} {:<10} {:>10} {:>10} {:>8} {:>12} {:>12} {:>10} {:>7.3}",
            pair.a.stream_id,
            pair.b.stream_id,
            pair.a.total_packets,
            pair.b.total_packets,
            signed_delta(pair.a.total_packets, pair.b.total_packets),
            pair.a.total_bytes,
            pair.b.total_bytes,
            signed_delta(pair.a.total_bytes, pair.b.total_bytes),
            pair.score
        );
    }

    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "Pairs: {}  (A: {} connections, B: {} connections)",
        result.pairs.len(),
        result.stats.total_a,
        result.stats.total_b
    );
    out
}

/// Per-stream, per-direction difference report for matched pairs.
pub fn stream_difference_table(result: &MatchResult) -> String {
    let mut out = String::new();
    for (index, pair) in result.pairs.iter().enumerate() {
        let _ = writeln!(
            out,
            "[{}] streams {} <-> {} score={:.3}",
            index + 1,
            pair.a.stream_id,
            pair.b.stream_id,
            pair.score
        );
        let _ = writeln!(
            out,
            "    client->server: packets {} / {} ({}), bytes {} / {} ({})",
            pair.a.client_packets,
            pair.b.client_packets,
            signed_delta(pair.a.client_packets, pair.b.client_packets),
            pair.a.client_bytes,
            pair.b.client_bytes,
            signed_delta(pair.a.client_bytes, pair.b.client_bytes)
        );
        let _ = writeln!(
            out,
            "    server->client: packets {} / {} ({}), bytes {} / {} ({})",
            pair.a.server_packets,
            pair.b.server_packets,
            signed_delta(pair.a.server_packets, pair.b.server_packets),
            pair.a.server_bytes,
            pair.b.server_bytes,
            signed_delta(pair.a.server_bytes, pair.b.server_bytes)
        );
        let _ = writeln!(
            out,
            "    first_ts offset: {:+.6}s, last_ts offset: {:+.6}s",
            pair.b.first_ts - pair.a.first_ts,
            pair.b.last_ts - pair.a.last_ts
        );
    }

    if result.pairs.is_empty() {
        let _ = writeln!(out, "No matched stream pairs.");
    }
    out
}

#[derive(Debug, Default)]
struct EdgeStats {
    connections: u64,
    packets: u64,
    bytes: u64,
    captures: BTreeMap<String, u64>,
}

/// Client-to-server endpoint graph aggregated across captures.
///
/// `captures` pairs a display label with the connections extracted from
/// that capture. Edges are keyed by client IP, server IP, and server port.
pub fn topology_table(captures: &[(String, Vec<TcpConnection>)]) -> String {
    let mut edges: BTreeMap<(String, String, u16), EdgeStats> = BTreeMap::new();
    for (label, connections) in captures {
        for conn in connections {
            let key = (
                conn.client_ip.clone(),
                conn.server_ip.clone(),
                conn.server_port,
            );
            let edge = edges.entry(key).or_default();
            edge.connections += 1;
            edge.packets += conn.total_packets;
            edge.bytes += conn.total_bytes;
            *edge.captures.entry(label.clone()).or_insert(0) += 1;
        }
    }

    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<18} {:<18} {:>6} {:>12} {:>12} {:>12}  Captures",
        "Client", "Server", "Port", "Connections", "Packets", "Bytes"
    );
    let _ = writeln!(out, "{}", "-".repeat(92));
    for ((client, server, port), stats) in &edges {
        let capture_list: Vec<String> = stats.captures.keys().cloned().collect();
        let _ = writeln!(
            out,
            "{:<18} {:<18} {:>6} {:>12} {:>12} {:>12}  {}",
            client,
            server,
            port,
            stats.connections,
            stats.packets,
            stats.bytes,
            capture_list.join(", ")
        );
    }

    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "Edges: {}  Captures: {}",
        edges.len(),
        captures.len()
    );
    out
}

/// Module-by-module comparison of two analysis dispatch runs.
pub fn comparative_table(
    label_a: &str,
    outcomes_a: &[ModuleOutcome],
    label_b: &str,
    outcomes_b: &[ModuleOutcome],
) -> String {
    let describe = |outcome: Option<&ModuleOutcome>| -> String {
        match outcome {
            None => "not run".to_string(),
            Some(outcome) => match (&outcome.output, &outcome.error) {
                (Some(path), _) => {
                    let lines = std::fs::read_to_string(path)
                        .map(|content| content.lines().count())
                        .unwrap_or(0);
                    format!("ok ({lines} lines)")
                }
                (None, Some(error)) => format!("failed: {error}"),
                (None, None) => "skipped".to_string(),
            },
        }
    };

    let mut names: Vec<&'static str> = Vec::new();
    for outcome in outcomes_a.iter().chain(outcomes_b) {
        if !names.contains(&outcome.module) {
            names.push(outcome.module);
        }
    }

    let mut out = String::new();
    let _ = writeln!(out, "{:<24} {:<32} {:<32}", "Module", label_a, label_b);
    let _ = writeln!(out, "{}", "-".repeat(90));
    for name in names {
        let a = outcomes_a.iter().find(|o| o.module == name);
        let b = outcomes_b.iter().find(|o| o.module == name);
        let _ = writeln!(
            out,
            "{:<24} {:<32} {:<32}",
            name,
            describe(a),
            describe(b)
        );
    }
    out
}

fn signed_delta(a: u64, b: u64) -> String {
    let delta = a as i64 - b as i64;
    format!("{delta:+}")
}
