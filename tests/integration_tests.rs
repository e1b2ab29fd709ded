//! Integration suite for the content-inspection core
//!
//! Exercises the subsystems end to end:
//! - SecurityTap against a scripted mock signature engine
//! - Quarantine lifecycle, orphan recovery, and hostile restores
//! - PolicyGraph matching, caching, and threat history
//! - The full Core pipeline from download to verdict

use std::io::{BufRead, BufReader, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;

use netsentry::core::{Core, CoreConfig};
use netsentry::policy::{NewPolicy, PolicyAction, ThreatDecision};
use netsentry::quarantine::{is_valid_id, QuarantineFileInfo, QuarantineStore};
use netsentry::runtime::EventLoop;
use netsentry::scanner::{DownloadMetadata, ScanSizeConfig, SecurityTap};

const CLEAN: &str = r#"{"status":"success","result":"clean"}"#;
const THREAT: &str = r#"{"status":"success","result":"{\"rule\":\"X\"}"}"#;

/// One step of scripted engine behaviour.
#[derive(Clone)]
enum EngineStep {
    /// Read one request line, send this response line.
    Respond(&'static str),
    /// Drop the current connection without reading.
    CloseConnection,
}

struct MockEngine {
    socket_path: PathBuf,
    handle: JoinHandle<Vec<String>>,
    _dir: tempfile::TempDir,
}

impl MockEngine {
    /// Runs the scripted behaviour on a fresh socket, then exits. Joining
    /// returns every request line the engine saw.
    fn spawn(script: Vec<EngineStep>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("engine.sock");
        let listener = UnixListener::bind(&socket_path).unwrap();
        let handle = std::thread::spawn(move || {
            let mut seen = Vec::new();
            let mut steps = script.into_iter().peekable();
            while steps.peek().is_some() {
                let Ok((stream, _)) = listener.accept() else {
                    break;
                };
                let mut reader = BufReader::new(stream.try_clone().unwrap());
                let mut stream = stream;
                loop {
                    match steps.peek() {
                        Some(EngineStep::CloseConnection) => {
                            steps.next();
                            break;
                        }
                        Some(EngineStep::Respond(_)) => {
                            let mut line = String::new();
                            if reader.read_line(&mut line).unwrap_or(0) == 0 {
                                break;
                            }
                            seen.push(line);
                            if let Some(EngineStep::Respond(response)) = steps.next() {
                                let _ = stream.write_all(response.as_bytes());
                                let _ = stream.write_all(b"\n");
                            }
                        }
                        None => break,
                    }
                }
            }
            seen
        });
        Self {
            socket_path,
            handle,
            _dir: dir,
        }
    }

    fn requests_seen(self) -> Vec<String> {
        self.handle.join().unwrap()
    }
}

fn download_meta(url: &str, filename: &str, size: u64) -> DownloadMetadata {
    DownloadMetadata {
        url: url.to_string(),
        filename: filename.to_string(),
        mime_type: "application/octet-stream".to_string(),
        sha256: "0".repeat(64),
        size,
    }
}

fn file_mode(path: &Path) -> u32 {
    std::fs::metadata(path).unwrap().permissions().mode() & 0o777
}

mod scanner_tests {
    use super::*;

    fn tap(socket: &Path, config: ScanSizeConfig) -> SecurityTap {
        let (_event_loop, remote) = EventLoop::new();
        SecurityTap::new(socket.to_path_buf(), config, 1, remote).unwrap()
    }

    /// Small tier config that keeps payloads tiny.
    fn tiny_tiers() -> ScanSizeConfig {
        ScanSizeConfig {
            small_file_threshold: 4096,
            medium_file_threshold: 64 * 1024,
            max_scan_size: 128 * 1024,
            chunk_size: 16 * 1024,
            chunk_overlap: 1024,
            large_scan_bytes: 8 * 1024,
        }
    }

    #[test]
    fn clean_small_file_scans_in_one_request() {
        let engine = MockEngine::spawn(vec![EngineStep::Respond(CLEAN)]);
        let mut tap = tap(&engine.socket_path, ScanSizeConfig::default());
        let meta = download_meta("http://example.com/a.txt", "a.txt", 1024);

        let result = tap.inspect(&meta, &[0u8; 1024]).unwrap();
        assert!(!result.is_threat);
        assert!(result.alert.is_none());

        let telemetry = tap.telemetry();
        assert_eq!(telemetry.scans_small, 1);
        assert_eq!(telemetry.total_scans, 1);
        assert_eq!(telemetry.threats_detected, 0);

        tap.stop();
        let requests = engine.requests_seen();
        assert_eq!(requests.len(), 1);
        let frame: serde_json::Value = serde_json::from_str(&requests[0]).unwrap();
        assert_eq!(frame["action"], "scan_content");
    }

    #[test]
    fn threat_in_medium_stream_short_circuits() {
        // Five clean chunks, then an alert; no further chunks may be sent.
        let mut script = vec![EngineStep::Respond(CLEAN); 5];
        script.push(EngineStep::Respond(THREAT));
        let engine = MockEngine::spawn(script);
        let mut tap = tap(&engine.socket_path, ScanSizeConfig::default());

        let size = 50 * 1024 * 1024;
        let meta = download_meta("http://example.com/big.bin", "big.bin", size as u64);
        let result = tap.inspect(&meta, &vec![0u8; size]).unwrap();
        assert!(result.is_threat);
        assert_eq!(result.alert.as_deref(), Some(r#"{"rule":"X"}"#));

        let telemetry = tap.telemetry();
        assert_eq!(telemetry.scans_medium, 1);
        assert_eq!(telemetry.threats_detected, 1);
        assert_eq!(telemetry.engine_failures, 0);

        tap.stop();
        assert_eq!(engine.requests_seen().len(), 6);
    }

    #[test]
    fn engine_socket_drop_fails_open_then_reconnects() {
        let engine = MockEngine::spawn(vec![
            EngineStep::CloseConnection,
            EngineStep::Respond(CLEAN),
        ]);
        let mut tap = tap(&engine.socket_path, ScanSizeConfig::default());
        let meta = download_meta("http://example.com/a.txt", "a.txt", 16);

        // First scan: the engine hangs up; the result fails open.
        let first = tap.inspect(&meta, &[0u8; 16]).unwrap();
        assert!(!first.is_threat);
        assert_eq!(tap.telemetry().engine_failures, 1);

        // Second scan re-establishes the connection.
        let second = tap.inspect(&meta, &[0u8; 16]).unwrap();
        assert!(!second.is_threat);
        let telemetry = tap.telemetry();
        assert_eq!(telemetry.total_scans, 2);
        assert_eq!(telemetry.engine_failures, 1);

        tap.stop();
    }

    #[test]
    fn threshold_boundary_selects_small_then_medium_path() {
        let config = tiny_tiers();
        // At the threshold: one whole-payload request.
        let engine = MockEngine::spawn(vec![EngineStep::Respond(CLEAN)]);
        let mut tap_small = tap(&engine.socket_path, config);
        let meta = download_meta("http://example.com/a", "a", 4096);
        tap_small.inspect(&meta, &[0u8; 4096]).unwrap();
        assert_eq!(tap_small.telemetry().scans_small, 1);
        tap_small.stop();
        assert_eq!(engine.requests_seen().len(), 1);

        // One byte past the threshold: the chunked path.
        let engine = MockEngine::spawn(vec![EngineStep::Respond(CLEAN)]);
        let mut tap_medium = tap(&engine.socket_path, config);
        let meta = download_meta("http://example.com/b", "b", 4097);
        tap_medium.inspect(&meta, &[0u8; 4097]).unwrap();
        let telemetry = tap_medium.telemetry();
        assert_eq!(telemetry.scans_small, 0);
        assert_eq!(telemetry.scans_medium, 1);
        tap_medium.stop();
    }

    #[test]
    fn large_tier_scans_head_and_tail_only() {
        let config = tiny_tiers();
        let engine = MockEngine::spawn(vec![EngineStep::Respond(CLEAN); 2]);
        let mut tap = tap(&engine.socket_path, config);
        let size = 100 * 1024; // between medium and max
        let meta = download_meta("http://example.com/large", "large", size as u64);
        tap.inspect(&meta, &vec![0u8; size]).unwrap();
        assert_eq!(tap.telemetry().scans_large, 1);
        tap.stop();
        // Exactly two requests: the head window and the tail window.
        assert_eq!(engine.requests_seen().len(), 2);
    }

    #[test]
    fn oversized_content_is_skipped_without_engine_contact() {
        let config = tiny_tiers();
        let mut tap = tap(Path::new("/nonexistent/engine.sock"), config);
        let size = 256 * 1024; // past max_scan_size
        let meta = download_meta("http://example.com/huge", "huge", size as u64);
        let result = tap.inspect(&meta, &vec![0u8; size]).unwrap();
        assert!(!result.is_threat);
        let telemetry = tap.telemetry();
        assert_eq!(telemetry.scans_oversized_skipped, 1);
        assert_eq!(telemetry.total_scans, 0);
        assert_eq!(telemetry.engine_failures, 0);
        tap.stop();
    }

    #[test]
    fn async_inspection_completes_on_the_event_loop() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;
        use std::time::{Duration, Instant};

        let engine = MockEngine::spawn(vec![EngineStep::Respond(CLEAN); 3]);
        let (mut event_loop, remote) = EventLoop::new();
        let mut tap =
            SecurityTap::new(engine.socket_path.clone(), ScanSizeConfig::default(), 2, remote)
                .unwrap();

        let completed = Arc::new(AtomicUsize::new(0));
        for i in 0..3 {
            let completed = Arc::clone(&completed);
            let meta = download_meta("http://example.com/x", "x", 64);
            tap.inspect_async(
                meta,
                vec![0u8; 64 + i],
                Box::new(move |result| {
                    assert!(!result.unwrap().is_threat);
                    completed.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
        }

        let deadline = Instant::now() + Duration::from_secs(10);
        while completed.load(Ordering::SeqCst) < 3 {
            event_loop.run_until_idle();
            assert!(Instant::now() < deadline, "async scans did not complete");
            std::thread::sleep(Duration::from_millis(5));
        }
        tap.stop();
    }

    #[test]
    fn invalid_metadata_is_a_caller_error_not_fail_open() {
        let mut tap = tap(Path::new("/nonexistent/engine.sock"), ScanSizeConfig::default());
        let mut meta = download_meta("http://example.com/a", "a", 16);
        meta.sha256 = "short".to_string();
        assert!(tap.inspect(&meta, &[0u8; 16]).is_err());
        tap.stop();
    }
}

mod quarantine_tests {
    use super::*;

    fn store() -> (tempfile::TempDir, QuarantineStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = QuarantineStore::new(dir.path().join("Quarantine"));
        store.initialize().unwrap();
        (dir, store)
    }

    fn payload(dir: &Path, name: &str, contents: &[u8]) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn info(filename: &str) -> QuarantineFileInfo {
        QuarantineFileInfo {
            original_url: "https://evil.example/payload".to_string(),
            filename: filename.to_string(),
            sha256: "ab".repeat(32),
            file_size: 11,
            rule_names: vec!["Win.Trojan.Generic".to_string()],
        }
    }

    #[test]
    fn quarantine_produces_hardened_entry() {
        let (dir, store) = store();
        let source = payload(dir.path(), "incoming.bin", b"evil bytes!");

        let id = store.quarantine_file(&source, &info("payload.exe")).unwrap();
        assert!(is_valid_id(&id));
        assert!(!source.exists(), "source must have been moved");

        let bin = store.root().join(format!("{id}.bin"));
        let json = store.root().join(format!("{id}.json"));
        assert_eq!(file_mode(&bin), 0o400);
        assert_eq!(file_mode(&json), 0o400);
        assert_eq!(file_mode(store.root()), 0o700);

        let entry = store.read_metadata(&id).unwrap();
        assert_eq!(entry.quarantine_id, id);
        assert_eq!(entry.filename, "payload.exe");
        assert_eq!(entry.rule_names, vec!["Win.Trojan.Generic".to_string()]);

        let listed = store.list_entries().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0], entry);
    }

    #[test]
    fn delete_is_idempotent() {
        let (dir, store) = store();
        let source = payload(dir.path(), "incoming.bin", b"evil bytes!");
        let id = store.quarantine_file(&source, &info("a.bin")).unwrap();

        store.delete_file(&id).unwrap();
        assert!(!store.root().join(format!("{id}.bin")).exists());
        assert!(!store.root().join(format!("{id}.json")).exists());
        // Double delete on the same id succeeds.
        store.delete_file(&id).unwrap();
    }

    #[test]
    fn restore_then_delete_leaves_no_trace() {
        let (dir, store) = store();
        let source = payload(dir.path(), "incoming.bin", b"evil bytes!");
        let id = store.quarantine_file(&source, &info("report.pdf")).unwrap();

        let dest = tempfile::tempdir().unwrap();
        let restored = store.restore_file(&id, dest.path()).unwrap();
        assert_eq!(restored, dest.path().canonicalize().unwrap().join("report.pdf"));
        assert_eq!(file_mode(&restored), 0o600);
        assert_eq!(std::fs::read(&restored).unwrap(), b"evil bytes!");

        store.delete_file(&id).unwrap();
        assert!(!store.root().join(format!("{id}.bin")).exists());
        assert!(!store.root().join(format!("{id}.json")).exists());
    }

    #[test]
    fn restore_strips_path_traversal_to_basename() {
        let (dir, store) = store();
        let source = payload(dir.path(), "incoming.bin", b"evil bytes!");
        let id = store
            .quarantine_file(&source, &info("../../../etc/passwd"))
            .unwrap();

        let dest = tempfile::tempdir().unwrap();
        let restored = store.restore_file(&id, dest.path()).unwrap();
        assert_eq!(
            restored,
            dest.path().canonicalize().unwrap().join("passwd"),
            "only the basename may survive"
        );
        assert_eq!(file_mode(&restored), 0o600);
    }

    #[test]
    fn restore_renames_on_collision() {
        let (dir, store) = store();
        let dest = tempfile::tempdir().unwrap();
        std::fs::write(dest.path().join("dup.txt"), b"already here").unwrap();

        let source = payload(dir.path(), "incoming.bin", b"evil bytes!");
        let id = store.quarantine_file(&source, &info("dup.txt")).unwrap();
        let restored = store.restore_file(&id, dest.path()).unwrap();
        assert_eq!(
            restored.file_name().and_then(|n| n.to_str()),
            Some("dup_(1).txt")
        );
    }

    #[test]
    fn restore_to_missing_destination_is_refused() {
        let (dir, store) = store();
        let source = payload(dir.path(), "incoming.bin", b"evil bytes!");
        let id = store.quarantine_file(&source, &info("a.bin")).unwrap();
        let result = store.restore_file(&id, Path::new("/nonexistent/destination"));
        assert!(result.is_err());
        // The payload stays quarantined on failure.
        assert!(store.root().join(format!("{id}.bin")).exists());
    }

    #[test]
    fn malformed_ids_are_rejected_at_every_entry_point() {
        let (_dir, store) = store();
        let dest = tempfile::tempdir().unwrap();
        for bad in ["", "../../etc", "20250115-093042_a1b2c3", "20250115_093042_A1B2C3"] {
            assert!(store.delete_file(bad).is_err());
            assert!(store.read_metadata(bad).is_err());
            assert!(store.restore_file(bad, dest.path()).is_err());
        }
    }

    #[test]
    fn initialize_sweeps_orphan_markers() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("Quarantine");
        std::fs::create_dir_all(&root).unwrap();
        let id = "20250115_093042_a1b2c3";
        std::fs::write(root.join(format!("{id}.bin")), b"stale payload").unwrap();
        std::fs::write(root.join(format!("{id}.orphaned")), b"2025-01-15T09:30:42Z").unwrap();

        let store = QuarantineStore::new(root.clone());
        store.initialize().unwrap();

        assert!(!root.join(format!("{id}.bin")).exists());
        assert!(!root.join(format!("{id}.orphaned")).exists());
    }

    #[test]
    fn initialize_is_repeatable() {
        let (_dir, store) = store();
        store.initialize().unwrap();
        store.initialize().unwrap();
    }

    #[test]
    fn invalid_file_info_is_refused() {
        let (dir, store) = store();
        let source = payload(dir.path(), "incoming.bin", b"evil bytes!");

        let mut zero_size = info("a.bin");
        zero_size.file_size = 0;
        assert!(store.quarantine_file(&source, &zero_size).is_err());

        let mut bad_hash = info("a.bin");
        bad_hash.sha256 = "xyz".to_string();
        assert!(store.quarantine_file(&source, &bad_hash).is_err());

        let mut bad_name = info("a.bin");
        bad_name.filename = String::new();
        assert!(store.quarantine_file(&source, &bad_name).is_err());

        // The payload was never moved.
        assert!(source.exists());
    }
}

mod core_tests {
    use super::*;

    fn core_with_engine(engine_socket: &Path) -> (tempfile::TempDir, EventLoop, Core) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = CoreConfig::new(dir.path().to_path_buf());
        config.engine_socket = engine_socket.to_path_buf();
        config.scan_workers = 1;
        let (event_loop, remote) = EventLoop::new();
        let core = Core::new(config, remote).unwrap();
        (dir, event_loop, core)
    }

    #[test]
    fn clean_download_is_allowed() {
        let engine = MockEngine::spawn(vec![EngineStep::Respond(CLEAN)]);
        let (_dir, _event_loop, mut core) = core_with_engine(&engine.socket_path);
        let meta = download_meta("https://example.com/notes.txt", "notes.txt", 64);

        let verdict = core.handle_download(&meta, &[0u8; 64], None).unwrap();
        assert_eq!(verdict.decision, ThreatDecision::Allowed);
        assert!(verdict.quarantine_id.is_none());
        assert!(!verdict.scan.unwrap().is_threat);
        core.shutdown();
    }

    #[test]
    fn detected_threat_is_quarantined_and_recorded() {
        let engine = MockEngine::spawn(vec![EngineStep::Respond(THREAT)]);
        let (dir, _event_loop, mut core) = core_with_engine(&engine.socket_path);

        let payload_path = dir.path().join("download.tmp");
        std::fs::write(&payload_path, b"malicious payload").unwrap();
        let meta = download_meta("https://evil.example/mal.exe", "mal.exe", 17);

        let verdict = core
            .handle_download(&meta, b"malicious payload", Some(&payload_path))
            .unwrap();
        assert_eq!(verdict.decision, ThreatDecision::Quarantined);
        let id = verdict.quarantine_id.expect("payload should be quarantined");
        assert!(is_valid_id(&id));
        assert!(!payload_path.exists());
        assert_eq!(core.quarantine().list_entries().unwrap().len(), 1);

        let history = core.policy_mut().recent_threats(10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].decision, "quarantined");
        assert_eq!(history[0].rule_name, "X");
        core.shutdown();
    }

    #[test]
    fn block_policy_preempts_scanning() {
        // No engine at all: a policy block must not contact it.
        let (_dir, _event_loop, mut core) =
            core_with_engine(Path::new("/nonexistent/engine.sock"));
        core.policy_mut()
            .add_policy(&NewPolicy {
                rule_name: "block-octet-stream".to_string(),
                url_pattern: None,
                file_hash: None,
                mime_type: Some("application/octet-stream".to_string()),
                action: PolicyAction::Block,
                created_by: "admin".to_string(),
                expires_at: None,
            })
            .unwrap();

        let meta = download_meta("https://example.com/tool.bin", "tool.bin", 64);
        let verdict = core.handle_download(&meta, &[0u8; 64], None).unwrap();
        assert_eq!(verdict.decision, ThreatDecision::Blocked);
        assert!(verdict.scan.is_none(), "blocked downloads are not scanned");
        assert_eq!(core.scanner().telemetry().total_scans, 0);

        let history = core.policy_mut().recent_threats(10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].decision, "blocked");
        core.shutdown();
    }

    #[test]
    fn allow_policy_skips_the_scanner() {
        let (_dir, _event_loop, mut core) =
            core_with_engine(Path::new("/nonexistent/engine.sock"));
        core.policy_mut()
            .add_policy(&NewPolicy {
                rule_name: "trusted-updates".to_string(),
                url_pattern: Some("https://updates.example/%".to_string()),
                file_hash: None,
                mime_type: None,
                action: PolicyAction::Allow,
                created_by: "admin".to_string(),
                expires_at: None,
            })
            .unwrap();

        let meta = download_meta("https://updates.example/app.pkg", "app.pkg", 64);
        let verdict = core.handle_download(&meta, &[0u8; 64], None).unwrap();
        assert_eq!(verdict.decision, ThreatDecision::Allowed);
        assert!(verdict.matched_policy.is_some());
        assert_eq!(core.scanner().telemetry().total_scans, 0);
        core.shutdown();
    }

    #[test]
    fn warn_policy_floors_a_clean_scan_at_warn() {
        let engine = MockEngine::spawn(vec![EngineStep::Respond(CLEAN)]);
        let (_dir, _event_loop, mut core) = core_with_engine(&engine.socket_path);
        core.policy_mut()
            .add_policy(&NewPolicy {
                rule_name: "warn-octet-stream".to_string(),
                url_pattern: None,
                file_hash: None,
                mime_type: Some("application/octet-stream".to_string()),
                action: PolicyAction::WarnUser,
                created_by: "admin".to_string(),
                expires_at: None,
            })
            .unwrap();

        let meta = download_meta("https://example.com/odd.bin", "odd.bin", 64);
        let verdict = core.handle_download(&meta, &[0u8; 64], None).unwrap();
        assert_eq!(verdict.decision, ThreatDecision::Warned);
        assert!(!verdict.scan.unwrap().is_threat);
        core.shutdown();
    }

    #[test]
    fn traffic_observation_flows_into_the_monitor() {
        let (_dir, _event_loop, mut core) =
            core_with_engine(Path::new("/nonexistent/engine.sock"));
        for _ in 0..3 {
            assert!(core
                .observe_request("www.example.com", 512, 4096)
                .unwrap()
                .is_none());
        }
        let pattern = core.traffic().pattern("www.example.com").unwrap();
        assert_eq!(pattern.request_count, 3);
        assert_eq!(pattern.bytes_sent, 3 * 512);
        assert!(core.observe_request("", 1, 1).is_err());
        core.shutdown();
    }
}
