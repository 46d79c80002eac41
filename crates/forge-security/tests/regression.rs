#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Regression tests for forge-security: AuditLog, scanner classification,
//! Sanitizer and OutputRedactor.

use forge_core::AgentRole;
use forge_security::*;
use uuid::Uuid;

// --- AuditLog ---

#[tokio::test]
async fn test_audit_log_writes_entries() {
    let tmp = tempfile::tempdir().unwrap();
    let log_dir = tmp.path().join("audit");
    let audit = AuditLog::new(log_dir.clone());

    let run_id = Uuid::new_v4();
    audit.log_action(
        run_id,
        "turn_completed",
        Some(AgentRole::CodeGenerator),
        serde_json::json!({"status": "success"}),
        AuditOutcome::Success,
    );

    // Give the background task time to write
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    let contents = tokio::fs::read_to_string(log_dir.join("audit.jsonl"))
        .await
        .unwrap();
    assert!(contents.contains("turn_completed"));
    assert!(contents.contains("CodeGenerator"));
    assert!(contents.contains(&run_id.to_string()));
}

#[tokio::test]
async fn test_audit_log_preserves_order() {
    let tmp = tempfile::tempdir().unwrap();
    let log_dir = tmp.path().join("audit");
    let audit = AuditLog::new(log_dir.clone());
    let run_id = Uuid::new_v4();

    for i in 0..5 {
        audit.log_action(
            run_id,
            format!("event_{i}"),
            None,
            serde_json::json!({}),
            if i == 4 {
                AuditOutcome::Error
            } else {
                AuditOutcome::Success
            },
        );
    }

    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    let contents = tokio::fs::read_to_string(log_dir.join("audit.jsonl"))
        .await
        .unwrap();
    let entries: Vec<AuditEntry> = contents
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(entries.len(), 5);
    for (i, e) in entries.iter().enumerate() {
        assert_eq!(e.action, format!("event_{i}"));
    }
    assert_eq!(entries[4].outcome, AuditOutcome::Error);
}

// --- Scanner ---

#[test]
fn test_eval_snippet_not_safe() {
    let scanner = CodeSecurityScanner::new().unwrap();
    let r = scanner.scan("result = eval('2 + 2')\nprint(result)\n");
    assert!(!r.safe);
    assert!(r.risk_level >= RiskLevel::Medium);
}

#[test]
fn test_clean_snippet_safe() {
    let scanner = CodeSecurityScanner::new().unwrap();
    let r = scanner.scan("def add(a, b):\n    return a + b\n\nprint(add(2, 3))\n");
    assert!(r.safe);
    assert_eq!(r.risk_level, RiskLevel::Low);
}

#[test]
fn test_subclass_walk_to_importer_blocked() {
    let scanner = CodeSecurityScanner::new().unwrap();
    let code = "for c in ().__class__.__base__.__subclasses__():\n    if c.__name__ == 'BuiltinImporter':\n        m = c.load_module('posix')\n        print(m.listdir('/')[:3])\n";
    let r = scanner.scan(code);
    assert!(!r.safe);
    assert_eq!(r.risk_level, RiskLevel::High);
}

#[test]
fn test_class_with_private_fields_safe() {
    let scanner = CodeSecurityScanner::new().unwrap();
    let code = "class Account:\n    def __init__(self):\n        self._balance = 0\n\n    def deposit(self, n):\n        self._balance += n\n        return self._balance\n\nprint(Account().deposit(5))\n";
    let r = scanner.scan(code);
    assert!(r.safe, "{:?}", r.violations);
}

#[test]
fn test_scan_result_serializes() {
    let scanner = CodeSecurityScanner::new().unwrap();
    let r = scanner.scan("import subprocess\n");
    let json = serde_json::to_value(&r).unwrap();
    assert_eq!(json["risk_level"], "high");
    assert_eq!(json["safe"], false);
    assert!(json["scan_time"].is_u64());
}

// --- Sanitizer / OutputRedactor ---

#[test]
fn test_sanitizer_then_parse() {
    let raw = "{\"agent\":\"QualityGate\",\"action\":\"approve\",\"status\":\"success\",\
               \"result\":{},\"next_agent\":null}\x07";
    let cleaned = Sanitizer::default().sanitize(raw).into_string().unwrap();
    let parsed = forge_core::parse_structured_result(&cleaned).unwrap();
    assert_eq!(parsed.agent, AgentRole::QualityGate);
}

#[test]
fn test_redactor_keeps_arithmetic() {
    let r = OutputRedactor::new().unwrap();
    assert_eq!(r.redact("result: 10/2"), "result: 10/2");
    assert_eq!(r.redact("open /etc/passwd failed"), "open [PATH] failed");
}

#[test]
fn test_redactor_long_output() {
    let r = OutputRedactor::new().unwrap();
    let out = r.redact(&"x".repeat(20_000));
    assert!(out.ends_with("... (output truncated)"));
    assert_eq!(out.chars().count(), 10_000 + "\n... (output truncated)".len());
}
