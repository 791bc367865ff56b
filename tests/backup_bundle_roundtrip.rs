use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_notasd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn notasd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    actor: serde_json::Value,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
        "actor": actor,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    actor: serde_json::Value,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, actor, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn admin() -> serde_json::Value {
    json!({ "id": "admin-0", "role": "admin" })
}

#[test]
fn export_then_import_restores_the_workspace() {
    let workspace = temp_dir("notasd-backup");
    let bundle_path = temp_dir("notasd-backup-out").join("workspace.zip");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!(null),
        json!({ "path": workspace.to_string_lossy() }),
    );
    let user = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "users.create",
        admin(),
        json!({ "name": "Diana Prado", "email": "diana@school.test", "role": "teacher" }),
    );
    let teacher_id = user["user"]["id"].as_str().expect("teacher id").to_string();

    let exported = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "backup.export",
        admin(),
        json!({ "outPath": bundle_path.to_string_lossy() }),
    );
    assert_eq!(
        exported["bundleFormat"].as_str(),
        Some("notas-workspace-v1")
    );
    assert!(exported["dbSha256"].as_str().map(|s| s.len()) == Some(64));
    assert!(bundle_path.is_file());

    // Mutate the workspace after the export, then restore the bundle.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "users.create",
        admin(),
        json!({ "name": "Mario Lenis", "email": "mario@school.test", "role": "teacher" }),
    );
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "users.list",
        admin(),
        json!({}),
    );
    assert_eq!(listed["users"].as_array().expect("users").len(), 2);

    let imported = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "backup.import",
        admin(),
        json!({ "inPath": bundle_path.to_string_lossy() }),
    );
    assert_eq!(
        imported["bundleFormat"].as_str(),
        Some("notas-workspace-v1")
    );

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "users.list",
        admin(),
        json!({}),
    );
    let users = listed["users"].as_array().expect("users");
    assert_eq!(users.len(), 1);
    assert_eq!(users[0]["id"].as_str(), Some(teacher_id.as_str()));
}

#[test]
fn tampered_bundles_fail_digest_verification() {
    let workspace = temp_dir("notasd-backup-tamper");
    let out_dir = temp_dir("notasd-backup-tamper-out");
    let bundle_path = out_dir.join("workspace.zip");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!(null),
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "users.create",
        admin(),
        json!({ "name": "Diana Prado", "email": "diana@school.test", "role": "teacher" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "backup.export",
        admin(),
        json!({ "outPath": bundle_path.to_string_lossy() }),
    );

    // Flip bytes near the end of the archive to corrupt the db entry.
    let mut bytes = std::fs::read(&bundle_path).expect("read bundle");
    let mid = bytes.len() / 2;
    bytes[mid] ^= 0xFF;
    bytes[mid + 1] ^= 0xFF;
    let tampered_path = out_dir.join("tampered.zip");
    std::fs::write(&tampered_path, &bytes).expect("write tampered bundle");

    let resp = request(
        &mut stdin,
        &mut reader,
        "4",
        "backup.import",
        admin(),
        json!({ "inPath": tampered_path.to_string_lossy() }),
    );
    assert_eq!(resp["ok"].as_bool(), Some(false));
    assert_eq!(resp["error"]["code"].as_str(), Some("backup_failed"));

    // The live workspace keeps answering with its original data.
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "users.list",
        admin(),
        json!({}),
    );
    assert_eq!(listed["users"].as_array().expect("users").len(), 1);
}
