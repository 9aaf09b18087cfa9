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
    child_a: String,
    child_b: String,
}

fn seed_program(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>) -> Seeded {
    let user = request_ok(
        stdin,
        reader,
        "seed-1",
        "users.create",
        json!({ "displayName": "Pat Lee", "role": "educator" }),
    );
    let user_id = str_field(&user, "userId");

    let classroom = request_ok(
        stdin,
        reader,
        "seed-2",
        "classrooms.create",
        json!({ "name": "Toddler Room A" }),
    );
    let classroom_id = str_field(&classroom, "classroomId");

    let child_a = str_field(
        &request_ok(
            stdin,
            reader,
            "seed-3",
            "roster.addChild",
            json!({
                "classroomId": classroom_id,
                "lastName": "Alba",
                "firstName": "Ana",
                "ageBand": "toddler",
            }),
        ),
        "childId",
    );
    let child_b = str_field(
        &request_ok(
            stdin,
            reader,
            "seed-4",
            "roster.addChild",
            json!({
                "classroomId": classroom_id,
                "lastName": "Berg",
                "firstName": "Bo",
                "ageBand": "toddler",
            }),
        ),
        "childId",
    );

    let enrollment = request_ok(
        stdin,
        reader,
        "seed-5",
        "enrollments.create",
        json!({ "classroomId": classroom_id, "ownerUserId": user_id }),
    );
    let enrollment_id = str_field(&enrollment, "enrollmentId");

    request_ok(
        stdin,
        reader,
        "seed-6",
        "instruments.define",
        json!({
            "name": "Toddler Social Check",
            "category": "children",
            "ageBand": "toddler",
            "schema": {
                "instructions": "Rate each child as observed this week.",
                "questions": [
                    {"key": "q1", "prompt": "Engages with peers", "required": true, "type": "likert"},
                    {"key": "q2", "prompt": "Notes", "type": "text"},
                ],
            },
        }),
    );

    request_ok(
        stdin,
        reader,
        "seed-7",
        "activities.define",
        json!({ "ref": "act-pre", "kind": "children", "phase": "pre" }),
    );

    Seeded {
        user_id,
        enrollment_id,
        child_a,
        child_b,
    }
}

#[test]
fn draft_then_submit_walks_the_status_machine() {
    let workspace = temp_dir("assess-lifecycle");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "0",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let seeded = seed_program(&mut stdin, &mut reader);

    // First open creates the instance lazily.
    let open = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "assessment.open",
        json!({
            "userId": seeded.user_id,
            "enrollmentId": seeded.enrollment_id,
            "activityRef": "act-pre",
        }),
    );
    let instance_id = str_field(&open, "instanceId");
    assert_eq!(str_field(&open, "status"), "not_started");
    assert_eq!(str_field(&open, "mode"), "form");
    let markup = str_field(&open, "markup");
    assert!(markup.contains(&format!("answers[{}][q1]", seeded.child_a)));
    assert!(markup.contains("data-required=\"1\""));
    assert!(markup.contains("Rate each child as observed this week."));
    let contract = open.get("contract").expect("contract");
    assert_eq!(
        contract
            .get("draftBypassesValidation")
            .and_then(|v| v.as_bool()),
        Some(true)
    );

    // Draft with a single answer: no validation, status moves to in_progress.
    let mut payload = serde_json::Map::new();
    payload.insert(seeded.child_a.clone(), json!({ "q1": "2" }));
    let draft = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "assessment.save",
        json!({
            "userId": seeded.user_id,
            "instanceId": instance_id,
            "action": "draft",
            "answers": serde_json::Value::Object(payload),
        }),
    );
    assert_eq!(str_field(&draft, "status"), "in_progress");
    assert_eq!(draft.get("submitted").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(str_field(&draft, "mode"), "form");

    // Reopening pre-fills the entered value.
    let reopened = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "assessment.open",
        json!({
            "userId": seeded.user_id,
            "enrollmentId": seeded.enrollment_id,
            "activityRef": "act-pre",
        }),
    );
    assert_eq!(str_field(&reopened, "instanceId"), instance_id);
    assert_eq!(str_field(&reopened, "status"), "in_progress");
    assert!(str_field(&reopened, "markup").contains("value=\"2\" checked"));

    // Submit with the second child unanswered is refused, but the refusal
    // still leaves the entered data behind.
    let mut payload = serde_json::Map::new();
    payload.insert(seeded.child_a.clone(), json!({ "q1": "2" }));
    payload.insert(seeded.child_b.clone(), json!({ "q2": "absent this week" }));
    let refused = request(
        &mut stdin,
        &mut reader,
        "4",
        "assessment.save",
        json!({
            "userId": seeded.user_id,
            "instanceId": instance_id,
            "action": "submit",
            "answers": serde_json::Value::Object(payload),
        }),
    );
    assert_eq!(refused.get("ok").and_then(|v| v.as_bool()), Some(false));
    let error = refused.get("error").expect("error");
    assert_eq!(
        error.get("code").and_then(|v| v.as_str()),
        Some("validation_incomplete")
    );
    let incomplete = error
        .get("details")
        .and_then(|d| d.get("incomplete"))
        .and_then(|v| v.as_array())
        .expect("incomplete list");
    assert!(incomplete.iter().any(|item| {
        item.get("childId").and_then(|v| v.as_str()) == Some(seeded.child_b.as_str())
            && item.get("questionKey").and_then(|v| v.as_str()) == Some("q1")
    }));

    let rows = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "assessment.rows",
        json!({ "userId": seeded.user_id, "instanceId": instance_id }),
    );
    assert_eq!(str_field(&rows, "status"), "in_progress");
    let rows_list = rows.get("rows").and_then(|v| v.as_array()).expect("rows");
    let row_b = rows_list
        .iter()
        .find(|r| r.get("childId").and_then(|v| v.as_str()) == Some(seeded.child_b.as_str()))
        .expect("row for second child survives the refused submit");
    assert_eq!(
        row_b
            .get("answers")
            .and_then(|a| a.get("q2"))
            .and_then(|v| v.as_str()),
        Some("absent this week")
    );

    // Complete submit flips the instance and renders the summary.
    let mut payload = serde_json::Map::new();
    payload.insert(seeded.child_a.clone(), json!({ "q1": "2" }));
    payload.insert(
        seeded.child_b.clone(),
        json!({ "q1": "0", "q2": "absent this week" }),
    );
    let submitted = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "assessment.save",
        json!({
            "userId": seeded.user_id,
            "instanceId": instance_id,
            "action": "submit",
            "answers": serde_json::Value::Object(payload),
        }),
    );
    assert_eq!(str_field(&submitted, "status"), "submitted");
    assert_eq!(
        submitted.get("submitted").and_then(|v| v.as_bool()),
        Some(true)
    );
    assert_eq!(str_field(&submitted, "mode"), "summary");
    assert!(str_field(&submitted, "markup").contains("assess-summary"));

    // Submitted instances refuse further writes.
    let mut payload = serde_json::Map::new();
    payload.insert(seeded.child_a.clone(), json!({ "q1": "4" }));
    let locked = request(
        &mut stdin,
        &mut reader,
        "7",
        "assessment.save",
        json!({
            "userId": seeded.user_id,
            "instanceId": instance_id,
            "action": "draft",
            "answers": serde_json::Value::Object(payload),
        }),
    );
    assert_eq!(
        locked
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|c| c.as_str()),
        Some("already_submitted")
    );

    // Reopen lands on the read-only summary, not the form.
    let reopened = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "assessment.open",
        json!({
            "userId": seeded.user_id,
            "enrollmentId": seeded.enrollment_id,
            "activityRef": "act-pre",
        }),
    );
    assert_eq!(str_field(&reopened, "mode"), "summary");
    assert!(!str_field(&reopened, "markup").contains("<form"));

    let _ = child.kill();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn open_is_idempotent_per_enrollment_and_activity() {
    let workspace = temp_dir("assess-lifecycle-idem");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "0",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let seeded = seed_program(&mut stdin, &mut reader);

    let first = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "assessment.open",
        json!({
            "userId": seeded.user_id,
            "enrollmentId": seeded.enrollment_id,
            "activityRef": "act-pre",
        }),
    );
    let second = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "assessment.open",
        json!({
            "userId": seeded.user_id,
            "enrollmentId": seeded.enrollment_id,
            "activityRef": "act-pre",
        }),
    );
    assert_eq!(str_field(&first, "instanceId"), str_field(&second, "instanceId"));

    let _ = child.kill();
    let _ = std::fs::remove_dir_all(workspace);
}
