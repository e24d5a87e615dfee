//! Candidate scoring profiles.
//!
//! Scores are weighted sums of feature signals normalised to `[0, 1]`.
//! The weight constants are tuning parameters, not part of the matching
//! contract; callers should assert threshold behaviour, not exact scores.

use std::collections::BTreeMap;

use crate::connections::TcpConnection;

use super::MatchProfile;

/// Evidence map: feature name to score contribution.
pub type Evidence = BTreeMap<&'static str, f64>;

// "auto" profile weights.
const AUTO_SERVER_PORT: f64 = 0.20;
const AUTO_IPID: f64 = 0.30;
const AUTO_SYN_OPTIONS: f64 = 0.20;
const AUTO_PAYLOAD: f64 = 0.30;

/// IPID overlap granting the full IPID weight.
const IPID_FULL_OVERLAP: usize = 3;

// "behavioral" profile weights.
const BEHAVIORAL_DURATION: f64 = 0.40;
const BEHAVIORAL_IAT: f64 = 0.30;
const BEHAVIORAL_BYTE_RATIO: f64 = 0.30;

/// Score one A/B candidate pair. Symmetric in its arguments.
pub(crate) fn score_pair(
    a: &TcpConnection,
    b: &TcpConnection,
    profile: MatchProfile,
) -> (f64, Evidence) {
    match profile {
        MatchProfile::Auto => score_auto(a, b),
        MatchProfile::Behavioral => score_behavioral(a, b),
    }
}

fn score_auto(a: &TcpConnection, b: &TcpConnection) -> (f64, Evidence) {
    let mut evidence = Evidence::new();
    let mut score = 0.0;

    if a.server_port == b.server_port {
        score += AUTO_SERVER_PORT;
        evidence.insert("server_port", AUTO_SERVER_PORT);
    }

    let overlap = a.ipid_set.intersection(&b.ipid_set).count();
    let smaller = a.ipid_set.len().min(b.ipid_set.len());
    if overlap >= IPID_FULL_OVERLAP {
        score += AUTO_IPID;
        evidence.insert("ipid_overlap", AUTO_IPID);
    } else if overlap > 0 && smaller > 0 {
        let partial = AUTO_IPID * overlap as f64 / smaller as f64;
        score += partial;
        evidence.insert("ipid_overlap", partial);
    }

    if !a.syn_options.is_empty() && a.syn_options == b.syn_options {
        score += AUTO_SYN_OPTIONS;
        evidence.insert("syn_options", AUTO_SYN_OPTIONS);
    }

    if !a.payload_hash.is_empty() && a.payload_hash == b.payload_hash {
        score += AUTO_PAYLOAD;
        evidence.insert("payload_hash", AUTO_PAYLOAD);
    }

    (score, evidence)
}

/// Behavioral profile: shape of the traffic rather than header features.
/// Time-window overlap is deliberately not required.
fn score_behavioral(a: &TcpConnection, b: &TcpConnection) -> (f64, Evidence) {
    let mut evidence = Evidence::new();
    let mut score = 0.0;

    let duration = BEHAVIORAL_DURATION * ratio_closeness(a.duration(), b.duration());
    if duration > 0.0 {
        evidence.insert("duration_ratio", duration);
    }
    score += duration;

    let iat = BEHAVIORAL_IAT * ratio_closeness(a.iat_mean, b.iat_mean);
    if iat > 0.0 {
        evidence.insert("iat_distance", iat);
    }
    score += iat;

    let bytes = BEHAVIORAL_BYTE_RATIO
        * ratio_closeness(direction_ratio(a), direction_ratio(b));
    if bytes > 0.0 {
        evidence.insert("byte_ratio", bytes);
    }
    score += bytes;

    (score, evidence)
}

/// Client-to-server byte ratio, add-one smoothed against empty directions.
fn direction_ratio(conn: &TcpConnection) -> f64 {
    (conn.client_bytes as f64 + 1.0) / (conn.server_bytes as f64 + 1.0)
}

/// Closeness of two non-negative magnitudes as `min/max` in `[0, 1]`.
///
/// Two zeros are identical (1.0); a zero against a non-zero is maximally
/// distant (0.0).
fn ratio_closeness(x: f64, y: f64) -> f64 {
    const EPS: f64 = 1e-9;
    let (small, large) = if x <= y { (x, y) } else { (y, x) };
    if large <= EPS {
        return 1.0;
    }
    if small <= EPS {
        return 0.0;
    }
    small / large
}

#[cfg(test)]
mod tests {
    use super::{ratio_closeness, score_pair};
    use crate::connections::{PortClass, TcpConnection};
    use crate::matching::MatchProfile;
    use std::collections::BTreeSet;

    fn connection(stream_id: u64, server_port: u16) -> TcpConnection {
        TcpConnection {
            stream_id,
            client_ip: "10.0.0.1".to_string(),
            server_ip: "10.1.0.1".to_string(),
            client_port: 50000,
            server_port,
            first_ts: 100.0,
            last_ts: 110.0,
            total_packets: 10,
            total_bytes: 2_000,
            client_packets: 6,
            server_packets: 4,
            client_bytes: 1_200,
            server_bytes: 800,
            ipid_set: BTreeSet::new(),
            syn_options: String::new(),
            payload_hash: String::new(),
            port_class: PortClass::classify(server_port),
            iat_mean: 0.5,
        }
    }

    #[test]
    fn identical_features_score_full_marks() {
        let mut a = connection(1, 443);
        a.ipid_set = [1u16, 2, 3, 4].into_iter().collect();
        a.syn_options = "020405b4".to_string();
        a.payload_hash = "ff".repeat(32);
        let mut b = connection(9, 443);
        b.ipid_set = a.ipid_set.clone();
        b.syn_options = a.syn_options.clone();
        b.payload_hash = a.payload_hash.clone();

        let (score, evidence) = score_pair(&a, &b, MatchProfile::Auto);
        assert!((score - 1.0).abs() < 1e-9);
        assert!(evidence.contains_key("server_port"));
        assert!(evidence.contains_key("ipid_overlap"));
        assert!(evidence.contains_key("syn_options"));
        assert!(evidence.contains_key("payload_hash"));
    }

    #[test]
    fn partial_ipid_overlap_scales_by_smaller_set() {
        let mut a = connection(1, 443);
        a.ipid_set = [1u16, 2].into_iter().collect();
        let mut b = connection(2, 443);
        b.ipid_set = [2u16, 3].into_iter().collect();

        let (_, evidence) = score_pair(&a, &b, MatchProfile::Auto);
        let ipid = evidence.get("ipid_overlap").copied().expect("ipid evidence");
        // 1 of 2 overlapping: half the weight.
        assert!((ipid - 0.15).abs() < 1e-9);
    }

    #[test]
    fn empty_features_never_match_each_other() {
        let a = connection(1, 443);
        let b = connection(2, 443);
        let (score, evidence) = score_pair(&a, &b, MatchProfile::Auto);
        // Only the port signal fires; empty SYN options and payload hashes
        // are absence of evidence, not agreement.
        assert!((score - 0.20).abs() < 1e-9);
        assert!(!evidence.contains_key("syn_options"));
        assert!(!evidence.contains_key("payload_hash"));
    }

    #[test]
    fn scoring_is_symmetric() {
        let mut a = connection(1, 8080);
        a.ipid_set = [5u16, 6, 7].into_iter().collect();
        let mut b = connection(2, 8080);
        b.ipid_set = [6u16, 7].into_iter().collect();

        let (ab, _) = score_pair(&a, &b, MatchProfile::Auto);
        let (ba, _) = score_pair(&b, &a, MatchProfile::Auto);
        assert_eq!(ab, ba);
    }

    #[test]
    fn behavioral_profile_rewards_similar_shapes() {
        let a = connection(1, 443);
        let b = connection(2, 9443);
        let (similar, _) = score_pair(&a, &b, MatchProfile::Behavioral);
        assert!(similar > 0.9);

        let mut c = connection(3, 9443);
        c.last_ts = a.first_ts + 1000.0;
        c.iat_mean = 30.0;
        c.client_bytes = 10;
        c.server_bytes = 100_000;
        let (different, _) = score_pair(&a, &c, MatchProfile::Behavioral);
        assert!(different < 0.2);
    }

    #[test]
    fn ratio_closeness_handles_zeroes() {
        assert_eq!(ratio_closeness(0.0, 0.0), 1.0);
        assert_eq!(ratio_closeness(0.0, 5.0), 0.0);
        assert!((ratio_closeness(2.0, 4.0) - 0.5).abs() < 1e-9);
    }
}
