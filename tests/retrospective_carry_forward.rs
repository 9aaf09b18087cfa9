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
    let exe = env!("CARGO_BIN_EXE_assessd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn assessd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
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
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn str_field(value: &serde_json::Value, key: &str) -> String {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_else(|| panic!("missing {} in {}", key, value))
        .to_string()
}

struct Seeded {
    user_id: String,
    enrollment_id: String,
}

fn seed_program(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>) -> Seeded {
    let user_id = str_field(
        &request_ok(
            stdin,
            reader,
            "seed-1",
            "users.create",
            json!({ "displayName": "Pat Lee", "role": "educator" }),
        ),
        "userId",
    );
    let classroom_id = str_field(
        &request_ok(
            stdin,
            reader,
            "seed-2",
            "classrooms.create",
            json!({ "name": "Toddler Room A" }),
        ),
        "classroomId",
    );
    let enrollment_id = str_field(
        &request_ok(
            stdin,
            reader,
            "seed-3",
            "enrollments.create",
            json!({ "classroomId": classroom_id, "ownerUserId": user_id }),
        ),
        "enrollmentId",
    );
    request_ok(
        stdin,
        reader,
        "seed-4",
        "instruments.define",
        json!({
            "name": "Educator Reflection",
            "category": "educator",
            "schema": {
                "sections": [
                    {"key": "practice", "title": "Teaching Practice", "retrospective": true, "items": [
                        {"key": "i1", "prompt": "I scaffold peer play", "required": true},
                        {"key": "i2", "prompt": "I document learning"},
                    ]},
                    {"key": "confidence", "title": "Confidence", "type": "scale", "items": [
                        {"key": "j1", "prompt": "Overall confidence", "required": true},
                    ]},
                ],
            },
        }),
    );
    request_ok(
        stdin,
        reader,
        "seed-5",
        "activities.define",
        json!({ "ref": "act-self-pre", "kind": "educator", "phase": "pre" }),
    );
    request_ok(
        stdin,
        reader,
        "seed-6",
        "activities.define",
        json!({ "ref": "act-self-post", "kind": "educator", "phase": "post" }),
    );
    Seeded {
        user_id,
        enrollment_id,
    }
}

#[test]
fn post_phase_shows_pre_values_read_only_and_stores_only_now() {
    let workspace = temp_dir("assess-retro");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "0",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let seeded = seed_program(&mut stdin, &mut reader);

    // Pre phase renders plain controls, stepped by section.
    let pre_open = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "selfAssessment.open",
        json!({
            "userId": seeded.user_id,
            "enrollmentId": seeded.enrollment_id,
            "activityRef": "act-self-pre",
        }),
    );
    let pre_instance = str_field(&pre_open, "instanceId");
    assert_eq!(str_field(&pre_open, "phase"), "pre");
    let markup = str_field(&pre_open, "markup");
    assert!(markup.contains("assess-step-indicator"));
    assert!(markup.contains("resp[practice][i1]"));
    assert!(!markup.contains("resp[practice][i1][now]"));
    assert!(!markup.contains("Before"));

    let submitted = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "selfAssessment.save",
        json!({
            "userId": seeded.user_id,
            "instanceId": pre_instance,
            "action": "submit",
            "resp": {
                "practice": { "i1": "3" },
                "confidence": { "j1": "7" },
            },
        }),
    );
    assert_eq!(submitted.get("submitted").and_then(|v| v.as_bool()), Some(true));

    // Post phase: the pre answer appears as a disabled "before" control and
    // the live control posts under [now].
    let post_open = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "selfAssessment.open",
        json!({
            "userId": seeded.user_id,
            "enrollmentId": seeded.enrollment_id,
            "activityRef": "act-self-post",
        }),
    );
    let post_instance = str_field(&post_open, "instanceId");
    assert_ne!(post_instance, pre_instance);
    let markup = str_field(&post_open, "markup");
    assert!(markup.contains("assess-phase-tag"));
    assert!(markup.contains("value=\"3\" checked disabled"));
    assert!(markup.contains("resp[practice][i1][now]"));
    // Non-retrospective sections keep plain names even in post.
    assert!(markup.contains("resp[confidence][j1]"));
    assert!(!markup.contains("resp[confidence][j1][now]"));

    // Missing the required scale item blocks the submit and points at its
    // section.
    let refused = request(
        &mut stdin,
        &mut reader,
        "4",
        "selfAssessment.save",
        json!({
            "userId": seeded.user_id,
            "instanceId": post_instance,
            "action": "submit",
            "resp": {
                "practice": { "i1": { "now": "4" } },
            },
        }),
    );
    let error = refused.get("error").expect("error");
    assert_eq!(
        error.get("code").and_then(|v| v.as_str()),
        Some("validation_incomplete")
    );
    assert_eq!(
        error
            .get("details")
            .and_then(|d| d.get("firstIncompleteSection"))
            .and_then(|v| v.as_str()),
        Some("confidence")
    );

    let submitted = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "selfAssessment.save",
        json!({
            "userId": seeded.user_id,
            "instanceId": post_instance,
            "action": "submit",
            "resp": {
                "practice": { "i1": { "now": "4" }, "i2": { "now": "2" } },
                "confidence": { "j1": "8" },
            },
        }),
    );
    assert_eq!(submitted.get("submitted").and_then(|v| v.as_bool()), Some(true));

    // Only the "now" half is stored; the pre instance keeps its own rows.
    let rows = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "selfAssessment.rows",
        json!({ "userId": seeded.user_id, "instanceId": post_instance }),
    );
    let list = rows.get("rows").and_then(|v| v.as_array()).expect("rows");
    let find = |section: &str, item: &str| {
        list.iter()
            .find(|r| {
                r.get("sectionKey").and_then(|v| v.as_str()) == Some(section)
                    && r.get("itemKey").and_then(|v| v.as_str()) == Some(item)
            })
            .and_then(|r| r.get("value"))
            .and_then(|v| v.as_str())
            .map(str::to_string)
    };
    assert_eq!(find("practice", "i1").as_deref(), Some("4"));
    assert_eq!(find("practice", "i2").as_deref(), Some("2"));
    assert_eq!(find("confidence", "j1").as_deref(), Some("8"));

    let pre_rows = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "selfAssessment.rows",
        json!({ "userId": seeded.user_id, "instanceId": pre_instance }),
    );
    let pre_list = pre_rows.get("rows").and_then(|v| v.as_array()).expect("rows");
    assert!(pre_list.iter().any(|r| {
        r.get("itemKey").and_then(|v| v.as_str()) == Some("i1")
            && r.get("value").and_then(|v| v.as_str()) == Some("3")
    }));

    // The post summary shows the before/now pair.
    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "selfAssessment.open",
        json!({
            "userId": seeded.user_id,
            "enrollmentId": seeded.enrollment_id,
            "activityRef": "act-self-post",
        }),
    );
    assert_eq!(str_field(&summary, "mode"), "summary");
    let markup = str_field(&summary, "markup");
    assert!(markup.contains("Before"));
    assert!(markup.contains("Now"));

    let _ = child.kill();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn draft_without_pre_submission_still_renders_post_form() {
    let workspace = temp_dir("assess-retro-nopre");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "0",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let seeded = seed_program(&mut stdin, &mut reader);

    // No pre instance exists; the before column is simply empty.
    let post_open = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "selfAssessment.open",
        json!({
            "userId": seeded.user_id,
            "enrollmentId": seeded.enrollment_id,
            "activityRef": "act-self-post",
        }),
    );
    assert_eq!(str_field(&post_open, "mode"), "form");
    let markup = str_field(&post_open, "markup");
    assert!(markup.contains("resp[practice][i1][now]"));
    assert!(!markup.contains("checked disabled"));

    let _ = child.kill();
    let _ = std::fs::remove_dir_all(workspace);
}
