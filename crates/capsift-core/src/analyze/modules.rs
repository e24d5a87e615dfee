//! Built-in analysis module catalogue.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;

use crate::report::ReportFormat;

use super::registry::{AnalysisModule, ModuleRegistry};

pub(crate) fn register_builtin_modules(registry: &mut ModuleRegistry) {
    registry.register(Box::new(StatsModule {
        name: "protocol_hierarchy",
        suffix: "protocol-hierarchy",
        required: &[],
        args: &["-q", "-z", "io,phs"],
    }));
    registry.register(Box::new(StatsModule {
        name: "ipv4_conversations",
        suffix: "ipv4-conversations",
        required: &["ip"],
        args: &["-q", "-z", "conv,ip"],
    }));
    registry.register(Box::new(StatsModule {
        name: "ipv4_hosts",
        suffix: "ipv4-hosts",
        required: &["ip"],
        args: &["-q", "-z", "endpoints,ip"],
    }));
    registry.register(Box::new(StatsModule {
        name: "ipv4_destinations",
        suffix: "ipv4-destinations-and-ports",
        required: &["ip"],
        args: &["-q", "-z", "dests,tree"],
    }));
    registry.register(Box::new(StatsModule {
        name: "ipv4_source_ttls",
        suffix: "ipv4-source-ttls",
        required: &["ip"],
        args: &["-q", "-z", "ip_ttl,tree"],
    }));
    registry.register(Box::new(StatsModule {
        name: "tcp_conversations",
        suffix: "tcp-conversations",
        required: &["tcp"],
        args: &["-q", "-z", "conv,tcp"],
    }));
    registry.register(Box::new(StatsModule {
        name: "udp_conversations",
        suffix: "udp-conversations",
        required: &["udp"],
        args: &["-q", "-z", "conv,udp"],
    }));
    registry.register(Box::new(StatsModule {
        name: "dns_stats",
        suffix: "dns-stats",
        required: &["dns"],
        args: &["-q", "-z", "dns,tree"],
    }));
    registry.register(Box::new(StatsModule {
        name: "dns_qr_stats",
        suffix: "dns-query-response",
        required: &["dns"],
        args: &["-q", "-z", "dns_qr,tree"],
    }));
    registry.register(Box::new(HttpResponseModule));
    registry.register(Box::new(IcmpStatsModule));
    registry.register(Box::new(TcpZeroWindowModule));
}

/// Module whose statistics come entirely from one extractor `-z` pass.
struct StatsModule {
    name: &'static str,
    suffix: &'static str,
    required: &'static [&'static str],
    args: &'static [&'static str],
}

impl AnalysisModule for StatsModule {
    fn name(&self) -> &'static str {
        self.name
    }

    fn suffix(&self) -> &'static str {
        self.suffix
    }

    fn required_protocols(&self) -> &'static [&'static str] {
        self.required
    }

    fn build_args(&self, _capture: &Path) -> Vec<String> {
        self.args.iter().map(|a| (*a).to_string()).collect()
    }
}

/// HTTP response codes grouped by status.
struct HttpResponseModule;

impl AnalysisModule for HttpResponseModule {
    fn name(&self) -> &'static str {
        "http_response"
    }

    fn suffix(&self) -> &'static str {
        "http-response-code"
    }

    fn required_protocols(&self) -> &'static [&'static str] {
        &["http"]
    }

    fn build_args(&self, _capture: &Path) -> Vec<String> {
        [
            "-Y",
            "http.response",
            "-T",
            "fields",
            "-e",
            "ip.src",
            "-e",
            "tcp.srcport",
            "-e",
            "ip.dst",
            "-e",
            "tcp.dstport",
            "-e",
            "http.response.code",
        ]
        .iter()
        .map(|a| (*a).to_string())
        .collect()
    }

    fn post_process(&self, raw: &str, _format: ReportFormat) -> String {
        // status code -> connections, codes ordered numerically.
        let mut responses: BTreeMap<u32, Vec<String>> = BTreeMap::new();
        for line in raw.lines() {
            let parts: Vec<&str> = line.split('\t').collect();
            if parts.len() < 5 {
                continue;
            }
            let code = parts[4].trim().parse::<u32>().unwrap_or(999);
            let connection = format!(
                "{}:{} -> {}:{}",
                parts[0], parts[1], parts[2], parts[3]
            );
            responses.entry(code).or_default().push(connection);
        }

        let mut out = String::new();
        for (code, connections) in responses {
            let _ = writeln!(out, "Status {code}:");
            for connection in connections {
                let _ = writeln!(out, "{connection}");
            }
            let _ = writeln!(out);
        }
        out
    }
}

/// ICMP messages decoded into type/code descriptions, with embedded
/// protocol 5-tuples for error messages.
struct IcmpStatsModule;

/// ICMP types that embed the triggering packet's headers.
const ICMP_TYPES_WITH_EMBED: [&str; 5] = ["3", "4", "5", "11", "12"];

fn icmp_description(type_code: &str) -> Option<&'static str> {
    Some(match type_code {
        "0:0" => "Echo Reply",
        "3:0" => "Net Unreachable",
        "3:1" => "Host Unreachable",
        "3:2" => "Protocol Unreachable",
        "3:3" => "Port Unreachable",
        "3:4" => "Fragmentation Needed",
        "3:13" => "Communication Prohibited",
        "4:0" => "Source Quench",
        "5:0" => "Redirect Network",
        "5:1" => "Redirect Host",
        "8:0" => "Echo Request",
        "11:0" => "TTL Exceeded",
        "11:1" => "Fragment Reassembly Timeout",
        "12:0" => "IP Header Error",
        "13:0" => "Timestamp Request",
        "14:0" => "Timestamp Reply",
        _ => return None,
    })
}

fn icmp_label(type_code: &str) -> String {
    let (icmp_type, icmp_code) = type_code.split_once(':').unwrap_or((type_code, "?"));
    match icmp_description(type_code) {
        Some(desc) => format!("[{icmp_type}/{icmp_code}] {desc}"),
        None => format!("[{icmp_type}/{icmp_code}] Type {icmp_type} Code {icmp_code}"),
    }
}

fn proto_name(number: &str) -> String {
    match number {
        "1" => "ICMP".to_string(),
        "6" => "TCP".to_string(),
        "17" => "UDP".to_string(),
        other => format!("Proto{other}"),
    }
}

impl AnalysisModule for IcmpStatsModule {
    fn name(&self) -> &'static str {
        "icmp_stats"
    }

    fn suffix(&self) -> &'static str {
        "icmp-messages"
    }

    fn required_protocols(&self) -> &'static [&'static str] {
        &["icmp"]
    }

    fn build_args(&self, _capture: &Path) -> Vec<String> {
        [
            "-Y",
            "icmp",
            "-T",
            "fields",
            "-e",
            "icmp.type",
            "-e",
            "icmp.code",
            "-e",
            "ip.proto",
            "-e",
            "ip.src",
            "-e",
            "tcp.srcport",
            "-e",
            "udp.srcport",
            "-e",
            "ip.dst",
            "-e",
            "tcp.dstport",
            "-e",
            "udp.dstport",
            "-E",
            "occurrence=l",
            "-E",
            "separator=,",
        ]
        .iter()
        .map(|a| (*a).to_string())
        .collect()
    }

    fn post_process(&self, raw: &str, _format: ReportFormat) -> String {
        type ErrorKey = (String, String, String, String);
        let mut error_msgs: BTreeMap<ErrorKey, u64> = BTreeMap::new();
        let mut info_msgs: BTreeMap<String, u64> = BTreeMap::new();

        for line in raw.lines() {
            let parts: Vec<&str> = line.split(',').collect();
            if parts.len() < 9 {
                continue;
            }
            let icmp_type = parts[0].trim();
            if icmp_type.is_empty() {
                continue;
            }
            let tc_key = format!("{}:{}", icmp_type, parts[1].trim());

            if ICMP_TYPES_WITH_EMBED.contains(&icmp_type) {
                let sport = if parts[4].is_empty() { parts[5] } else { parts[4] };
                let dport = if parts[7].is_empty() { parts[8] } else { parts[7] };
                if sport.is_empty() || dport.is_empty() {
                    continue;
                }
                let key = (
                    tc_key,
                    proto_name(parts[2].trim()),
                    format!("{}:{}", parts[3], sport),
                    format!("{}:{}", parts[6], dport),
                );
                *error_msgs.entry(key).or_insert(0) += 1;
            } else {
                *info_msgs.entry(tc_key).or_insert(0) += 1;
            }
        }

        let mut out = String::new();
        if !error_msgs.is_empty() {
            let _ = writeln!(out, "ICMP error messages with embedded protocol info:\n");
            let _ = writeln!(
                out,
                "{:<30} {:<8} {:<40} Count",
                "ICMP Type/Code", "Protocol", "Embedded 5-tuple"
            );
            let _ = writeln!(out, "{}", "-".repeat(92));
            for ((tc_key, proto, src, dst), count) in &error_msgs {
                let _ = writeln!(
                    out,
                    "{:<30} {:<8} {:<40} {}",
                    icmp_label(tc_key),
                    proto,
                    format!("{src} -> {dst}"),
                    count
                );
            }
        }
        if !info_msgs.is_empty() {
            if !error_msgs.is_empty() {
                let _ = writeln!(out);
            }
            let _ = writeln!(out, "ICMP informational messages:\n");
            let _ = writeln!(out, "{:<30} Count", "ICMP Type/Code");
            let _ = writeln!(out, "{}", "-".repeat(43));
            for (tc_key, count) in &info_msgs {
                let _ = writeln!(out, "{:<30} {}", icmp_label(tc_key), count);
            }
        }
        out
    }
}

/// TCP zero-window events counted per connection 4-tuple.
struct TcpZeroWindowModule;

fn zero_window_severity(count: u64) -> &'static str {
    if count >= 50 {
        "High"
    } else if count >= 10 {
        "Medium"
    } else {
        "Low"
    }
}

impl AnalysisModule for TcpZeroWindowModule {
    fn name(&self) -> &'static str {
        "tcp_zero_window"
    }

    fn suffix(&self) -> &'static str {
        "tcp-zero-window"
    }

    fn required_protocols(&self) -> &'static [&'static str] {
        &["tcp"]
    }

    fn build_args(&self, _capture: &Path) -> Vec<String> {
        [
            "-Y",
            "tcp.analysis.zero_window",
            "-T",
            "fields",
            "-e",
            "ip.src",
            "-e",
            "tcp.srcport",
            "-e",
            "ip.dst",
            "-e",
            "tcp.dstport",
        ]
        .iter()
        .map(|a| (*a).to_string())
        .collect()
    }

    fn post_process(&self, raw: &str, _format: ReportFormat) -> String {
        if raw.trim().is_empty() {
            return "Zero Window Overview\nMetric,Value\nTotal Events,0\n".to_string();
        }

        let mut counter: BTreeMap<String, u64> = BTreeMap::new();
        for line in raw.lines() {
            let tuple = line.trim();
            if !tuple.is_empty() {
                *counter.entry(tuple.to_string()).or_insert(0) += 1;
            }
        }

        // Count descending, then tuple ascending.
        let mut sorted: Vec<(&String, &u64)> = counter.iter().collect();
        sorted.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        let total_events: u64 = counter.values().sum();

        let mut severity_events: BTreeMap<&'static str, u64> = BTreeMap::new();
        let mut severity_connections: BTreeMap<&'static str, u64> = BTreeMap::new();
        for (_, count) in &sorted {
            let severity = zero_window_severity(**count);
            *severity_events.entry(severity).or_insert(0) += **count;
            *severity_connections.entry(severity).or_insert(0) += 1;
        }

        let mut out = String::new();
        let _ = writeln!(out, "Zero Window Overview");
        let _ = writeln!(out, "Metric,Value");
        let _ = writeln!(out, "Total Events,{total_events}");
        let _ = writeln!(out, "Unique Connections,{}", sorted.len());
        let _ = writeln!(out);
        let _ = writeln!(out, "Severity Summary");
        let _ = writeln!(out, "Severity,Events,Connections");
        for severity in ["High", "Medium", "Low"] {
            let _ = writeln!(
                out,
                "{severity},{},{}",
                severity_events.get(severity).copied().unwrap_or(0),
                severity_connections.get(severity).copied().unwrap_or(0)
            );
        }

        let _ = writeln!(out);
        let _ = writeln!(out, "Highlighted Connections");
        let _ = writeln!(out, "Connection,Count,Severity");
        for (tuple, count) in sorted.iter().take(5) {
            let _ = writeln!(out, "{tuple},{count},{}", zero_window_severity(**count));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::{HttpResponseModule, IcmpStatsModule, TcpZeroWindowModule};
    use crate::analyze::registry::AnalysisModule;
    use crate::report::ReportFormat;
    use std::path::Path;

    #[test]
    fn http_responses_group_by_status_code_numerically() {
        let raw = "10.0.0.1\t80\t10.0.0.2\t50000\t404\n\
                   10.0.0.1\t80\t10.0.0.3\t50001\t200\n\
                   10.0.0.1\t80\t10.0.0.4\t50002\t200\n";
        let out = HttpResponseModule.post_process(raw, ReportFormat::Txt);
        let idx_200 = out.find("Status 200:").expect("200 group");
        let idx_404 = out.find("Status 404:").expect("404 group");
        assert!(idx_200 < idx_404);
        assert!(out.contains("10.0.0.1:80 -> 10.0.0.3:50001"));
    }

    #[test]
    fn http_short_lines_are_skipped() {
        let out = HttpResponseModule.post_process("garbage\n", ReportFormat::Txt);
        assert!(out.is_empty());
    }

    #[test]
    fn icmp_informational_and_error_messages_are_separated() {
        let raw = "8,0,,10.0.0.1,,,10.0.0.2,,\n\
                   0,0,,10.0.0.2,,,10.0.0.1,,\n\
                   3,3,17,10.0.0.5,,5353,10.0.0.6,,53\n";
        let out = IcmpStatsModule.post_process(raw, ReportFormat::Txt);
        assert!(out.contains("ICMP error messages with embedded protocol info:"));
        assert!(out.contains("[3/3] Port Unreachable"));
        assert!(out.contains("UDP"));
        assert!(out.contains("10.0.0.5:5353 -> 10.0.0.6:53"));
        assert!(out.contains("[8/0] Echo Request"));
        assert!(out.contains("[0/0] Echo Reply"));
    }

    #[test]
    fn zero_window_empty_input_reports_zero_events() {
        let out = TcpZeroWindowModule.post_process("  \n", ReportFormat::Txt);
        assert!(out.contains("Total Events,0"));
    }

    #[test]
    fn zero_window_counts_and_classifies_connections() {
        let mut raw = String::new();
        for _ in 0..12 {
            raw.push_str("10.0.0.1\t80\t10.0.0.2\t50000\n");
        }
        raw.push_str("10.0.0.3\t80\t10.0.0.4\t50001\n");
        let out = TcpZeroWindowModule.post_process(&raw, ReportFormat::Txt);
        assert!(out.contains("Total Events,13"));
        assert!(out.contains("Unique Connections,2"));
        assert!(out.contains("Medium,12,1"));
        assert!(out.contains("Low,1,1"));
        // Busiest connection listed first.
        let busy = out.find("10.0.0.1\t80\t10.0.0.2\t50000,12,Medium").expect("busy row");
        let quiet = out.find("10.0.0.3\t80\t10.0.0.4\t50001,1,Low").expect("quiet row");
        assert!(busy < quiet);
    }

    #[test]
    fn stats_modules_expose_their_tool_arguments() {
        let registry = crate::analyze::ModuleRegistry::builtin();
        let hierarchy = registry
            .iter()
            .find(|m| m.name() == "protocol_hierarchy")
            .expect("module");
        assert_eq!(
            hierarchy.build_args(Path::new("x.pcap")),
            vec!["-q", "-z", "io,phs"]
        );
        assert!(hierarchy.required_protocols().is_empty());
    }
}
