use assert_cmd::Command;
use predicates::prelude::PredicateBooleanExt;
use predicates::str::contains;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn cmd() -> Command {
    Command::new(assert_cmd::cargo::cargo_bin!("capsift"))
}

/// Write an executable stub script and return its path.
#[cfg(unix)]
fn write_stub(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}")).expect("write stub");
    let mut perms = std::fs::metadata(&path).expect("stub metadata").permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).expect("chmod stub");
    path
}

fn write_capture(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, content).expect("write capture");
    path
}

#[cfg(unix)]
fn read_meta(primary: &Path) -> Value {
    let sidecar = format!("{}.meta.json", primary.display());
    let content = std::fs::read_to_string(&sidecar).expect("read sidecar");
    serde_json::from_str(&content).expect("sidecar json")
}

/// Extractor stub emitting one identical TCP connection for any capture:
/// SYN with options, a payload frame, and an ACK, with three client IPIDs.
#[cfg(unix)]
const EXTRACTOR_STUB: &str = r#"case "$*" in
  *io,phs*) cat <<'EOF'
eth                                      frames:10 bytes:1000
  ip                                     frames:10 bytes:1000
    tcp                                  frames:8 bytes:800
    udp                                  frames:2 bytes:200
      dns                                frames:2 bytes:200
EOF
;;
  *frame.time_epoch*) printf '1\t100.0\t10.0.0.1\t50000\t10.1.0.1\t443\t1\t0\t0x0001\t0\t020405b4\t\n1\t100.1\t10.0.0.1\t50000\t10.1.0.1\t443\t0\t1\t0x0002\t4\t\tcafebabe\n1\t100.2\t10.1.0.1\t443\t10.0.0.1\t50000\t0\t1\t0x0003\t0\t\t\n';;
  *) echo "stats output";;
esac
"#;

#[test]
fn help_lists_all_subcommands() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(
            contains("analyze")
                .and(contains("preprocess"))
                .and(contains("match"))
                .and(contains("compare"))
                .and(contains("streamdiff"))
                .and(contains("topology"))
                .and(contains("comparative-analysis")),
        );
}

#[test]
fn version_includes_commit() {
    cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(contains("commit").and(contains("built")));
}

#[test]
fn missing_input_shows_error_and_suggestion() {
    cmd()
        .arg("match")
        .arg("--silent")
        .assert()
        .failure()
        .stderr(contains("Error: missing input").and(contains("Suggestion:")));
}

#[test]
fn match_rejects_mixing_input_with_dual_file_form() {
    let temp = TempDir::new().expect("tempdir");
    let a = write_capture(temp.path(), "a.pcap", b"x");
    let b = write_capture(temp.path(), "b.pcap", b"x");

    cmd()
        .arg("match")
        .arg("-i")
        .arg(format!("{},{}", a.display(), b.display()))
        .arg("--file1")
        .arg(&a)
        .arg("--file2")
        .arg(&b)
        .assert()
        .failure()
        .stderr(contains("cannot be used with"));
}

#[test]
fn file1_requires_file2() {
    let temp = TempDir::new().expect("tempdir");
    let a = write_capture(temp.path(), "a.pcap", b"x");

    cmd()
        .arg("match")
        .arg("--file1")
        .arg(&a)
        .assert()
        .failure();
}

#[test]
fn preprocess_rejects_conflicting_flag_pairs() {
    let temp = TempDir::new().expect("tempdir");
    let a = write_capture(temp.path(), "a.pcap", b"x");

    cmd()
        .arg("preprocess")
        .arg("-i")
        .arg(&a)
        .arg("--enable-dedup")
        .arg("--disable-dedup")
        .assert()
        .failure()
        .stderr(contains("Error: cannot use both --enable-dedup and --disable-dedup"));
}

#[test]
fn preprocess_rejects_steps_mixed_with_toggles() {
    let temp = TempDir::new().expect("tempdir");
    let a = write_capture(temp.path(), "a.pcap", b"x");

    cmd()
        .arg("preprocess")
        .arg("-i")
        .arg(&a)
        .arg("--step")
        .arg("dedup")
        .arg("--enable-oneway")
        .assert()
        .failure()
        .stderr(contains("cannot mix --step with enable/disable flags"));
}

#[test]
fn preprocess_rejects_unknown_step_names() {
    let temp = TempDir::new().expect("tempdir");
    let a = write_capture(temp.path(), "a.pcap", b"x");

    cmd()
        .arg("preprocess")
        .arg("-i")
        .arg(&a)
        .arg("--step")
        .arg("time-warp")
        .assert()
        .failure()
        .stderr(contains("unknown preprocess step 'time-warp'"));
}

#[test]
fn unreadable_input_reports_not_found() {
    cmd()
        .arg("topology")
        .arg("-i")
        .arg("/nonexistent/trace.pcap")
        .arg("--silent")
        .assert()
        .failure()
        .stderr(contains("Error: File not found").and(contains("Suggestion:")));
}

#[cfg(unix)]
#[test]
fn missing_tools_surface_install_hint() {
    let temp = TempDir::new().expect("tempdir");
    let a = write_capture(temp.path(), "a.pcap", b"x");
    let b = write_capture(temp.path(), "b.pcap", b"x");

    cmd()
        .arg("preprocess")
        .arg("-i")
        .arg(format!("{},{}", a.display(), b.display()))
        .arg("--silent")
        .env("PATH", "")
        .env_remove("TSHARK_PATH")
        .env_remove("EDITCAP_PATH")
        .env_remove("CAPINFOS_PATH")
        .assert()
        .failure()
        .stderr(contains("command not found").and(contains("Suggestion:")));
}

#[cfg(unix)]
#[test]
fn match_writes_report_with_meta_sidecar() {
    let temp = TempDir::new().expect("tempdir");
    let tshark = write_stub(temp.path(), "tshark", EXTRACTOR_STUB);
    let a = write_capture(temp.path(), "hop1.pcap", b"x");
    let b = write_capture(temp.path(), "hop2.pcap", b"x");
    let output = temp.path().join("matches.txt");

    cmd()
        .arg("match")
        .arg("--file1")
        .arg(&a)
        .arg("--file2")
        .arg(&b)
        .arg("-o")
        .arg(&output)
        .arg("--silent")
        .env("TSHARK_PATH", &tshark)
        .assert()
        .success();

    let report = std::fs::read_to_string(&output).expect("read report");
    assert!(report.contains("Matched connections: 1"));
    assert!(report.contains("score="));

    let meta = read_meta(&output);
    assert_eq!(meta["id"], "matched_connections");
    assert_eq!(meta["source"], "basic");
}

#[cfg(unix)]
#[test]
fn match_markdown_output_starts_with_heading() {
    let temp = TempDir::new().expect("tempdir");
    let tshark = write_stub(temp.path(), "tshark", EXTRACTOR_STUB);
    let a = write_capture(temp.path(), "hop1.pcap", b"x");
    let b = write_capture(temp.path(), "hop2.pcap", b"x");
    let output = temp.path().join("matches.md");

    cmd()
        .arg("match")
        .arg("--file1")
        .arg(&a)
        .arg("--file2")
        .arg(&b)
        .arg("-o")
        .arg(&output)
        .arg("--format")
        .arg("md")
        .arg("--silent")
        .env("TSHARK_PATH", &tshark)
        .assert()
        .success();

    let report = std::fs::read_to_string(&output).expect("read report");
    assert!(report.starts_with("## Matched connections\n"));
    assert!(report.contains("```"));
}

#[cfg(unix)]
#[test]
fn streamdiff_to_stdout_has_no_sidecar() {
    let temp = TempDir::new().expect("tempdir");
    let tshark = write_stub(temp.path(), "tshark", EXTRACTOR_STUB);
    let a = write_capture(temp.path(), "hop1.pcap", b"x");
    let b = write_capture(temp.path(), "hop2.pcap", b"x");

    let assert = cmd()
        .arg("streamdiff")
        .arg("--file1")
        .arg(&a)
        .arg("--file2")
        .arg(&b)
        .arg("--silent")
        .env("TSHARK_PATH", &tshark)
        .assert()
        .success();

    let stdout = String::from_utf8(assert.get_output().stdout.clone()).expect("utf8");
    assert!(stdout.contains("client->server:"));
    assert!(!temp.path().join(".meta.json").exists());
}

#[cfg(unix)]
#[test]
fn compare_reports_packet_differences() {
    let temp = TempDir::new().expect("tempdir");
    let tshark = write_stub(temp.path(), "tshark", EXTRACTOR_STUB);
    let a = write_capture(temp.path(), "hop1.pcap", b"x");
    let b = write_capture(temp.path(), "hop2.pcap", b"x");
    let output = temp.path().join("diff.txt");

    cmd()
        .arg("compare")
        .arg("--file1")
        .arg(&a)
        .arg("--file2")
        .arg(&b)
        .arg("-o")
        .arg(&output)
        .arg("--silent")
        .env("TSHARK_PATH", &tshark)
        .assert()
        .success();

    assert_eq!(read_meta(&output)["id"], "packet_differences");
    let report = std::fs::read_to_string(&output).expect("read report");
    assert!(report.contains("Pairs: 1"));
}

#[cfg(unix)]
#[test]
fn topology_lists_endpoint_edges() {
    let temp = TempDir::new().expect("tempdir");
    let tshark = write_stub(temp.path(), "tshark", EXTRACTOR_STUB);
    let a = write_capture(temp.path(), "hop1.pcap", b"x");

    let assert = cmd()
        .arg("topology")
        .arg("-i")
        .arg(&a)
        .arg("--silent")
        .env("TSHARK_PATH", &tshark)
        .assert()
        .success();

    let stdout = String::from_utf8(assert.get_output().stdout.clone()).expect("utf8");
    assert!(stdout.contains("Client"));
    assert!(stdout.contains("10.0.0.1"));
    assert!(stdout.contains("Edges: 1"));
}

#[cfg(unix)]
#[test]
fn analyze_skips_modules_for_absent_protocols() {
    let temp = TempDir::new().expect("tempdir");
    let tshark = write_stub(temp.path(), "tshark", EXTRACTOR_STUB);
    let a = write_capture(temp.path(), "capture.pcap", b"x");
    let out_dir = temp.path().join("analysis");

    cmd()
        .arg("analyze")
        .arg("-i")
        .arg(&a)
        .arg("-o")
        .arg(&out_dir)
        .arg("--silent")
        .env("TSHARK_PATH", &tshark)
        .assert()
        .success();

    // The hierarchy stub advertises ip/tcp/udp/dns only.
    let hierarchy = out_dir.join("capture-protocol-hierarchy.txt");
    let dns = out_dir.join("capture-dns-stats.txt");
    assert!(hierarchy.exists());
    assert!(dns.exists());
    assert!(!out_dir.join("capture-http-response-code.txt").exists());
    assert!(!out_dir.join("capture-icmp-messages.txt").exists());

    assert_eq!(read_meta(&hierarchy)["id"], "protocol_hierarchy");
    assert_eq!(read_meta(&dns)["id"], "dns_stats");

    // Atomic writes leave no temp files behind.
    let leftovers: Vec<_> = std::fs::read_dir(&out_dir)
        .expect("read out dir")
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().map(|x| x == "tmp").unwrap_or(false))
        .collect();
    assert!(leftovers.is_empty());
}

#[cfg(unix)]
fn preprocess_stubs(dir: &Path, range_a: (f64, f64), range_b: (f64, f64)) -> (PathBuf, PathBuf, PathBuf) {
    let capinfos = write_stub(
        dir,
        "capinfos",
        &format!(
            r#"case "$*" in
  *-c*) echo "Number of packets: 2";;
  *a.pcap*) echo '"a","pcap","e","0","1","2","3","4","5","6","7","{}","{}","x"';;
  *) echo '"b","pcap","e","0","1","2","3","4","5","6","7","{}","{}","x"';;
esac
"#,
            range_a.0, range_a.1, range_b.0, range_b.1
        ),
    );
    // Copies input (second-to-last arg) to output (last arg).
    let editcap = write_stub(
        dir,
        "editcap",
        "prev=\"\"; prevprev=\"\"\nfor a in \"$@\"; do prevprev=\"$prev\"; prev=\"$a\"; done\ncp \"$prevprev\" \"$prev\"\n",
    );
    // Balanced two-direction stream: nothing is one-way.
    let tshark = write_stub(
        dir,
        "tshark",
        "printf '1\\t10.0.0.1\\t50000\\t10.0.0.2\\t443\\t100\\t10\\n1\\t10.0.0.2\\t443\\t10.0.0.1\\t50000\\t200\\t10\\n'\n",
    );
    (capinfos, editcap, tshark)
}

#[cfg(unix)]
#[test]
fn preprocess_produces_aligned_ready_outputs_and_report() {
    let temp = TempDir::new().expect("tempdir");
    let (capinfos, editcap, tshark) = preprocess_stubs(temp.path(), (100.0, 200.0), (150.0, 250.0));
    let a = write_capture(temp.path(), "a.pcap", b"capture-a");
    let b = write_capture(temp.path(), "b.pcap", b"capture-b");
    let out_dir = temp.path().join("preprocessed");

    cmd()
        .arg("preprocess")
        .arg("-i")
        .arg(format!("{},{}", a.display(), b.display()))
        .arg("-o")
        .arg(&out_dir)
        .arg("--silent")
        .env("CAPINFOS_PATH", &capinfos)
        .env("EDITCAP_PATH", &editcap)
        .env("TSHARK_PATH", &tshark)
        .assert()
        .success();

    // One output per input, stems preserved.
    assert!(out_dir.join("a.ready.pcap").exists());
    assert!(out_dir.join("b.ready.pcap").exists());

    let report = std::fs::read_to_string(out_dir.join("preprocess_report.md"))
        .expect("read report");
    assert!(report.contains("# CapSift preprocess report"));
    assert!(report.contains("Steps executed: time-align+dedup -> oneway"));
    assert!(report.contains("| Original path | Final path |"));
    assert!(report.contains("a.ready.pcap"));
}

#[cfg(unix)]
#[test]
fn preprocess_without_overlap_passes_inputs_through() {
    let temp = TempDir::new().expect("tempdir");
    let (capinfos, editcap, tshark) = preprocess_stubs(temp.path(), (0.0, 10.0), (20.0, 30.0));
    let a = write_capture(temp.path(), "a.pcap", b"capture-a");
    let b = write_capture(temp.path(), "b.pcap", b"capture-b");
    let out_dir = temp.path().join("preprocessed");

    cmd()
        .arg("preprocess")
        .arg("-i")
        .arg(format!("{},{}", a.display(), b.display()))
        .arg("-o")
        .arg(&out_dir)
        .arg("--silent")
        .env("CAPINFOS_PATH", &capinfos)
        .env("EDITCAP_PATH", &editcap)
        .env("TSHARK_PATH", &tshark)
        .assert()
        .success();

    // No overlap and empty outputs disallowed: content passes through.
    assert_eq!(
        std::fs::read(out_dir.join("a.ready.pcap")).expect("read a"),
        b"capture-a"
    );
    assert_eq!(
        std::fs::read(out_dir.join("b.ready.pcap")).expect("read b"),
        b"capture-b"
    );
}

#[cfg(unix)]
#[test]
fn preprocess_without_overlap_fails_under_strict() {
    let temp = TempDir::new().expect("tempdir");
    let (capinfos, editcap, tshark) = preprocess_stubs(temp.path(), (0.0, 10.0), (20.0, 30.0));
    let a = write_capture(temp.path(), "a.pcap", b"capture-a");
    let b = write_capture(temp.path(), "b.pcap", b"capture-b");

    cmd()
        .arg("preprocess")
        .arg("-i")
        .arg(format!("{},{}", a.display(), b.display()))
        .arg("-o")
        .arg(temp.path().join("preprocessed"))
        .arg("--strict")
        .arg("--silent")
        .env("CAPINFOS_PATH", &capinfos)
        .env("EDITCAP_PATH", &editcap)
        .env("TSHARK_PATH", &tshark)
        .assert()
        .failure()
        .stderr(contains("Strict mode violation"));
}

#[cfg(unix)]
#[test]
fn preprocess_archives_originals_when_enabled() {
    let temp = TempDir::new().expect("tempdir");
    let (capinfos, editcap, tshark) = preprocess_stubs(temp.path(), (100.0, 200.0), (150.0, 250.0));
    let a = write_capture(temp.path(), "a.pcap", b"capture-a");
    let b = write_capture(temp.path(), "b.pcap", b"capture-b");
    let out_dir = temp.path().join("preprocessed");

    cmd()
        .arg("preprocess")
        .arg("-i")
        .arg(format!("{},{}", a.display(), b.display()))
        .arg("-o")
        .arg(&out_dir)
        .arg("--enable-archive-original")
        .arg("--silent")
        .env("CAPINFOS_PATH", &capinfos)
        .env("EDITCAP_PATH", &editcap)
        .env("TSHARK_PATH", &tshark)
        .assert()
        .success();

    assert!(out_dir.join("archive.tar.gz").exists());
    // Archival never removes the originals.
    assert!(a.exists());
    assert!(b.exists());
}

#[cfg(unix)]
#[test]
fn comparative_analysis_writes_comparison_table() {
    let temp = TempDir::new().expect("tempdir");
    let tshark = write_stub(temp.path(), "tshark", EXTRACTOR_STUB);
    let a = write_capture(temp.path(), "hop1.pcap", b"x");
    let b = write_capture(temp.path(), "hop2.pcap", b"x");
    let out_dir = temp.path().join("comparative");

    cmd()
        .arg("comparative-analysis")
        .arg("--file1")
        .arg(&a)
        .arg("--file2")
        .arg(&b)
        .arg("-o")
        .arg(&out_dir)
        .arg("--silent")
        .env("TSHARK_PATH", &tshark)
        .assert()
        .success();

    let primary = out_dir.join("comparative-analysis.txt");
    let table = std::fs::read_to_string(&primary).expect("read table");
    assert!(table.contains("protocol_hierarchy"));
    assert!(table.contains("ok ("));
    assert_eq!(read_meta(&primary)["id"], "comparative_analysis");
    assert!(out_dir.join("a").join("hop1-protocol-hierarchy.txt").exists());
    assert!(out_dir.join("b").join("hop2-protocol-hierarchy.txt").exists());
}
