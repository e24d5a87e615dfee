//! Cross-capture TCP connection matching.
//!
//! Candidates are generated within buckets to avoid the full `|A| x |B|`
//! product, scored by a weighted feature profile, gated by a threshold, and
//! finally assigned either one-to-one (greedy by score) or one-to-many.
//! Distinct buckets score in parallel; assignment runs single-threaded
//! after all scoring completes, and result ordering is deterministic for
//! identical inputs.

mod score;

pub use score::Evidence;

use std::collections::{BTreeMap, HashSet};
use std::str::FromStr;

use log::debug;
use rayon::prelude::*;

use crate::connections::TcpConnection;
use crate::error::{Error, Result};

use score::score_pair;

/// Feature profile used for scoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchProfile {
    /// Header-feature profile: server port, IPIDs, SYN options, payload.
    #[default]
    Auto,
    /// Traffic-shape profile: duration, inter-packet timing, byte ratios.
    Behavioral,
}

impl MatchProfile {
    pub fn name(self) -> &'static str {
        match self {
            MatchProfile::Auto => "auto",
            MatchProfile::Behavioral => "behavioral",
        }
    }
}

impl FromStr for MatchProfile {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "auto" => Ok(MatchProfile::Auto),
            "behavioral" => Ok(MatchProfile::Behavioral),
            other => Err(Error::Config {
                reason: format!("unknown match profile '{other}' (expected auto or behavioral)"),
            }),
        }
    }
}

/// How matched pairs are assigned after scoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AssignmentMode {
    /// Greedy by descending score; each connection is used at most once.
    #[default]
    OneToOne,
    /// Every candidate at or above the threshold is kept.
    OneToMany,
}

/// Candidate bucketing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BucketKey {
    /// Bucket by server port (stable across hops for request-response
    /// traffic).
    #[default]
    ServerPort,
    /// Bucket by the (client port, server port) pair.
    PortPair,
    /// Bucket by server port modulo a fixed bucket count.
    HashBucket(u32),
}

impl BucketKey {
    fn key_for(self, conn: &TcpConnection) -> u64 {
        match self {
            BucketKey::ServerPort => u64::from(conn.server_port),
            BucketKey::PortPair => {
                (u64::from(conn.client_port) << 16) | u64::from(conn.server_port)
            }
            BucketKey::HashBucket(buckets) => {
                u64::from(conn.server_port) % u64::from(buckets.max(1))
            }
        }
    }
}

/// Matcher configuration.
#[derive(Debug, Clone)]
pub struct MatchConfig {
    pub profile: MatchProfile,
    /// Minimum score for a pair to be reported.
    pub threshold: f64,
    pub mode: AssignmentMode,
    pub bucket: BucketKey,
    pub workers: usize,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            profile: MatchProfile::Auto,
            threshold: 0.50,
            mode: AssignmentMode::OneToOne,
            bucket: BucketKey::ServerPort,
            workers: 4,
        }
    }
}

/// Confidence band derived from the score.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confidence {
    High,
    Medium,
    Low,
}

impl Confidence {
    fn from_score(score: f64) -> Self {
        if score >= 0.80 {
            Confidence::High
        } else if score >= 0.65 {
            Confidence::Medium
        } else {
            Confidence::Low
        }
    }
}

impl std::fmt::Display for Confidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Confidence::High => write!(f, "high"),
            Confidence::Medium => write!(f, "medium"),
            Confidence::Low => write!(f, "low"),
        }
    }
}

/// One reported pair.
#[derive(Debug, Clone)]
pub struct MatchedPair {
    pub a: TcpConnection,
    pub b: TcpConnection,
    pub score: f64,
    pub confidence: Confidence,
    pub evidence: Evidence,
}

/// Aggregate counters for a match run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchStats {
    pub total_a: usize,
    pub total_b: usize,
    pub matched_a: usize,
    pub matched_b: usize,
    pub unmatched_a: usize,
    pub unmatched_b: usize,
    pub match_rate_a: f64,
    pub match_rate_b: f64,
    pub average_score: f64,
}

/// Ordered matched pairs plus run counters.
#[derive(Debug, Clone)]
pub struct MatchResult {
    pub pairs: Vec<MatchedPair>,
    pub stats: MatchStats,
}

#[derive(Debug, Clone)]
struct Candidate {
    a_index: usize,
    b_index: usize,
    score: f64,
    evidence: Evidence,
}

/// Match connection set `a` against connection set `b`.
pub fn match_connections(
    a: &[TcpConnection],
    b: &[TcpConnection],
    config: &MatchConfig,
) -> Result<MatchResult> {
    let buckets = build_buckets(a, b, config.bucket);
    debug!(
        "matching {} x {} connections across {} buckets",
        a.len(),
        b.len(),
        buckets.len()
    );

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.workers.max(1).min(buckets.len().max(1)))
        .thread_name(|i| format!("capsift-match-{i}"))
        .build()
        .map_err(|err| Error::Config {
            reason: format!("failed to build worker pool: {err}"),
        })?;

    let bucket_list: Vec<(Vec<usize>, Vec<usize>)> = buckets.into_values().collect();
    let mut candidates: Vec<Candidate> = pool.install(|| {
        bucket_list
            .par_iter()
            .flat_map_iter(|(a_indices, b_indices)| {
                score_bucket(a, b, a_indices, b_indices, config)
            })
            .collect()
    });

    sort_candidates(a, b, &mut candidates);
    let pairs = assign(a, b, &candidates, config.mode);
    let stats = compute_stats(a.len(), b.len(), &pairs);
    Ok(MatchResult { pairs, stats })
}

fn build_buckets(
    a: &[TcpConnection],
    b: &[TcpConnection],
    key: BucketKey,
) -> BTreeMap<u64, (Vec<usize>, Vec<usize>)> {
    let mut buckets: BTreeMap<u64, (Vec<usize>, Vec<usize>)> = BTreeMap::new();
    for (index, conn) in a.iter().enumerate() {
        buckets.entry(key.key_for(conn)).or_default().0.push(index);
    }
    for (index, conn) in b.iter().enumerate() {
        buckets.entry(key.key_for(conn)).or_default().1.push(index);
    }
    buckets.retain(|_, (a_side, b_side)| !a_side.is_empty() && !b_side.is_empty());
    buckets
}

fn score_bucket(
    a: &[TcpConnection],
    b: &[TcpConnection],
    a_indices: &[usize],
    b_indices: &[usize],
    config: &MatchConfig,
) -> Vec<Candidate> {
    let mut out = Vec::new();
    for &a_index in a_indices {
        for &b_index in b_indices {
            let (score, evidence) = score_pair(&a[a_index], &b[b_index], config.profile);
            if score >= config.threshold {
                out.push(Candidate {
                    a_index,
                    b_index,
                    score,
                    evidence,
                });
            }
        }
    }
    out
}

/// Order candidates by descending score; ties by lower combined stream id,
/// then by the stream-id pair itself. The key is symmetric in A/B, so
/// swapping the input sets yields the same ordering.
fn sort_candidates(a: &[TcpConnection], b: &[TcpConnection], candidates: &mut [Candidate]) {
    candidates.sort_by(|x, y| {
        y.score
            .partial_cmp(&x.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                let x_streams = (a[x.a_index].stream_id, b[x.b_index].stream_id);
                let y_streams = (a[y.a_index].stream_id, b[y.b_index].stream_id);
                let combined = (x_streams.0 + x_streams.1).cmp(&(y_streams.0 + y_streams.1));
                combined
                    .then_with(|| {
                        x_streams
                            .0
                            .min(x_streams.1)
                            .cmp(&y_streams.0.min(y_streams.1))
                    })
                    .then_with(|| {
                        x_streams
                            .0
                            .max(x_streams.1)
                            .cmp(&y_streams.0.max(y_streams.1))
                    })
            })
    });
}

fn assign(
    a: &[TcpConnection],
    b: &[TcpConnection],
    candidates: &[Candidate],
    mode: AssignmentMode,
) -> Vec<MatchedPair> {
    let mut pairs = Vec::new();
    match mode {
        AssignmentMode::OneToOne => {
            let mut used_a: HashSet<usize> = HashSet::new();
            let mut used_b: HashSet<usize> = HashSet::new();
            for candidate in candidates {
                if used_a.contains(&candidate.a_index) || used_b.contains(&candidate.b_index) {
                    continue;
                }
                used_a.insert(candidate.a_index);
                used_b.insert(candidate.b_index);
                pairs.push(to_pair(a, b, candidate));
            }
        }
        AssignmentMode::OneToMany => {
            for candidate in candidates {
                pairs.push(to_pair(a, b, candidate));
            }
        }
    }
    pairs
}

fn to_pair(a: &[TcpConnection], b: &[TcpConnection], candidate: &Candidate) -> MatchedPair {
    MatchedPair {
        a: a[candidate.a_index].clone(),
        b: b[candidate.b_index].clone(),
        score: candidate.score,
        confidence: Confidence::from_score(candidate.score),
        evidence: candidate.evidence.clone(),
    }
}

fn compute_stats(total_a: usize, total_b: usize, pairs: &[MatchedPair]) -> MatchStats {
    let matched_a = pairs
        .iter()
        .map(|p| p.a.stream_id)
        .collect::<HashSet<_>>()
        .len();
    let matched_b = pairs
        .iter()
        .map(|p| p.b.stream_id)
        .collect::<HashSet<_>>()
        .len();
    let average_score = if pairs.is_empty() {
        0.0
    } else {
        pairs.iter().map(|p| p.score).sum::<f64>() / pairs.len() as f64
    };
    let rate = |matched: usize, total: usize| {
        if total == 0 {
            0.0
        } else {
            matched as f64 / total as f64
        }
    };

    MatchStats {
        total_a,
        total_b,
        matched_a,
        matched_b,
        unmatched_a: total_a - matched_a,
        unmatched_b: total_b - matched_b,
        match_rate_a: rate(matched_a, total_a),
        match_rate_b: rate(matched_b, total_b),
        average_score,
    }
}

#[cfg(test)]
mod tests {
    use super::{
        AssignmentMode, BucketKey, Confidence, MatchConfig, MatchProfile, match_connections,
    };
    use crate::connections::{PortClass, TcpConnection};
    use std::collections::BTreeSet;

    fn connection(stream_id: u64, server_port: u16) -> TcpConnection {
        TcpConnection {
            stream_id,
            client_ip: "10.0.0.4".to_string(),
            server_ip: "10.116.133.7".to_string(),
            client_port: 35101,
            server_port,
            first_ts: 100.0,
            last_ts: 160.0,
            total_packets: 40,
            total_bytes: 9_000,
            client_packets: 22,
            server_packets: 18,
            client_bytes: 5_000,
            server_bytes: 4_000,
            ipid_set: BTreeSet::new(),
            syn_options: String::new(),
            payload_hash: String::new(),
            port_class: PortClass::classify(server_port),
            iat_mean: 1.5,
        }
    }

    fn correlated(stream_id: u64, server_port: u16) -> TcpConnection {
        let mut conn = connection(stream_id, server_port);
        conn.ipid_set = [100u16, 101, 102, 103].into_iter().collect();
        conn.syn_options = "020405b40402080a".to_string();
        conn.payload_hash = "ab".repeat(32);
        conn
    }

    #[test]
    fn nat_rewritten_session_is_matched_across_hops() {
        // Same session at two hops: 4-tuple changed, IPIDs and SYN options
        // survive.
        let mut a_conn = correlated(3, 10007);
        a_conn.client_ip = "10.0.0.104".to_string();
        let mut b_conn = correlated(55, 10007);
        b_conn.client_ip = "172.16.9.2".to_string();
        b_conn.client_port = 41000;

        let result = match_connections(&[a_conn], &[b_conn], &MatchConfig::default())
            .expect("match");
        assert_eq!(result.pairs.len(), 1);
        let pair = &result.pairs[0];
        assert!(pair.score >= 0.7);
        assert_eq!(pair.confidence, Confidence::High);
        assert!(pair.evidence.contains_key("syn_options"));
        assert!(pair.evidence.contains_key("ipid_overlap"));
    }

    #[test]
    fn pairs_below_the_threshold_are_not_reported() {
        // Same server port only: score 0.20 against the 0.50 default.
        let result = match_connections(
            &[connection(1, 443)],
            &[connection(2, 443)],
            &MatchConfig::default(),
        )
        .expect("match");
        assert!(result.pairs.is_empty());
        assert_eq!(result.stats.unmatched_a, 1);
        assert_eq!(result.stats.unmatched_b, 1);
        assert_eq!(result.stats.average_score, 0.0);
    }

    #[test]
    fn different_server_ports_fall_into_different_buckets() {
        let a_conn = correlated(1, 443);
        let b_conn = correlated(2, 8443);
        let result =
            match_connections(&[a_conn], &[b_conn], &MatchConfig::default()).expect("match");
        assert!(result.pairs.is_empty());
    }

    #[test]
    fn one_to_one_uses_each_connection_at_most_once() {
        let a = vec![correlated(1, 443), correlated(2, 443)];
        let b = vec![correlated(10, 443)];
        let result = match_connections(&a, &b, &MatchConfig::default()).expect("match");

        assert_eq!(result.pairs.len(), 1);
        assert_eq!(result.stats.matched_b, 1);
        assert_eq!(result.stats.unmatched_a, 1);
        // Equal scores: the lower combined stream id wins.
        assert_eq!(result.pairs[0].a.stream_id, 1);
    }

    #[test]
    fn one_to_many_keeps_every_qualifying_candidate() {
        let a = vec![correlated(1, 443), correlated(2, 443)];
        let b = vec![correlated(10, 443)];
        let config = MatchConfig {
            mode: AssignmentMode::OneToMany,
            ..MatchConfig::default()
        };
        let result = match_connections(&a, &b, &config).expect("match");
        assert_eq!(result.pairs.len(), 2);
        assert_eq!(result.stats.matched_b, 1);
        assert_eq!(result.stats.matched_a, 2);
    }

    #[test]
    fn scores_are_non_increasing_in_the_result() {
        let strong_a = correlated(1, 443);
        let strong_b = correlated(11, 443);
        // Weaker pair: shared SYN options plus partial IPID overlap.
        let mut weak_a = connection(2, 443);
        weak_a.syn_options = "0204ffff".to_string();
        weak_a.ipid_set = [7u16, 8].into_iter().collect();
        let mut weak_b = connection(12, 443);
        weak_b.syn_options = "0204ffff".to_string();
        weak_b.ipid_set = [8u16, 9].into_iter().collect();

        let result = match_connections(
            &[strong_a, weak_a],
            &[strong_b, weak_b],
            &MatchConfig::default(),
        )
        .expect("match");
        assert_eq!(result.pairs.len(), 2);
        assert!(result.pairs[0].score >= result.pairs[1].score);
    }

    #[test]
    fn matching_is_commutative_modulo_orientation() {
        let a = vec![correlated(1, 443), correlated(4, 443)];
        let b = vec![correlated(7, 443), correlated(2, 443)];

        let forward = match_connections(&a, &b, &MatchConfig::default()).expect("match");
        let reverse = match_connections(&b, &a, &MatchConfig::default()).expect("match");

        let forward_ids: Vec<(u64, u64)> = forward
            .pairs
            .iter()
            .map(|p| (p.a.stream_id, p.b.stream_id))
            .collect();
        let reverse_ids: Vec<(u64, u64)> = reverse
            .pairs
            .iter()
            .map(|p| (p.b.stream_id, p.a.stream_id))
            .collect();
        assert_eq!(forward_ids, reverse_ids);
    }

    #[test]
    fn behavioral_profile_matches_without_shared_headers() {
        let config = MatchConfig {
            profile: MatchProfile::Behavioral,
            bucket: BucketKey::HashBucket(1),
            ..MatchConfig::default()
        };
        // No IPIDs, options or payload in common; identical shape.
        let a_conn = connection(1, 443);
        let mut b_conn = connection(2, 9090);
        b_conn.client_ip = "192.168.7.7".to_string();

        let result = match_connections(&[a_conn], &[b_conn], &config).expect("match");
        assert_eq!(result.pairs.len(), 1);
        assert!(result.pairs[0].evidence.contains_key("duration_ratio"));
    }

    #[test]
    fn stats_account_for_both_sides() {
        let a = vec![correlated(1, 443), connection(2, 80)];
        let b = vec![correlated(9, 443)];
        let result = match_connections(&a, &b, &MatchConfig::default()).expect("match");

        let stats = result.stats;
        assert_eq!(stats.total_a, 2);
        assert_eq!(stats.total_b, 1);
        assert_eq!(stats.matched_a, 1);
        assert_eq!(stats.unmatched_a, 1);
        assert!((stats.match_rate_a - 0.5).abs() < 1e-9);
        assert!((stats.match_rate_b - 1.0).abs() < 1e-9);
        assert!(stats.average_score >= 0.5);
    }

    #[test]
    fn profile_parsing_accepts_known_names_only() {
        assert_eq!(
            "behavioral".parse::<MatchProfile>().expect("behavioral"),
            MatchProfile::Behavioral
        );
        assert!("fuzzy".parse::<MatchProfile>().is_err());
    }
}
