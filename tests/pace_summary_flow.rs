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
    let exe = env!("CARGO_BIN_EXE_pacetrackd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn pacetrackd");
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
    let payload = json!({ "id": id, "method": method, "params": params });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    serde_json::from_str(line.trim()).expect("parse response json")
}

fn result_of(value: &serde_json::Value) -> &serde_json::Value {
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(true),
        "expected ok response, got {}",
        value
    );
    value.get("result").expect("result")
}

fn seed_term(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>, workspace: &PathBuf) {
    let _ = request(
        stdin,
        reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request(
        stdin,
        reader,
        "term",
        "terms.upsert",
        json!({
            "term": "SP21",
            "startDate": "2021-01-19",
            "endDate": "2021-05-14",
            "active": true
        }),
    );
}

fn register(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    student: &str,
    course: &str,
    params: serde_json::Value,
) {
    let mut body = json!({
        "studentId": student,
        "courseId": course,
        "sect": "001",
        "term": "SP21"
    });
    for (k, v) in params.as_object().expect("params object") {
        body[k] = v.clone();
    }
    let resp = request(stdin, reader, id, "registrations.upsert", body);
    let _ = result_of(&resp);
}

#[test]
fn three_course_schedule_resolves_pace_and_order() {
    let workspace = temp_dir("pacetrack-pace-valid");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    seed_term(&mut stdin, &mut reader, &workspace);

    // Published out of order; the response comes back in pace order.
    register(
        &mut stdin,
        &mut reader,
        "r1",
        "stu1",
        "MATH 124",
        json!({ "paceOrder": 3 }),
    );
    register(
        &mut stdin,
        &mut reader,
        "r2",
        "stu1",
        "MATH 117",
        json!({ "paceOrder": 1, "openStatus": "N", "completed": true }),
    );
    register(
        &mut stdin,
        &mut reader,
        "r3",
        "stu1",
        "MATH 118",
        json!({ "paceOrder": 2, "openStatus": "Y" }),
    );

    let summary = request(
        &mut stdin,
        &mut reader,
        "s",
        "pace.summary",
        json!({ "studentId": "stu1", "term": "SP21" }),
    );
    let result = result_of(&summary);
    assert_eq!(result.get("status").and_then(|v| v.as_str()), Some("ok"));
    assert_eq!(result.get("pace").and_then(|v| v.as_i64()), Some(3));
    assert_eq!(result.get("paceTrack").and_then(|v| v.as_str()), Some("A"));

    let regs = result
        .get("registrations")
        .and_then(|v| v.as_array())
        .expect("registrations");
    let courses: Vec<&str> = regs
        .iter()
        .map(|r| r.get("courseId").and_then(|v| v.as_str()).expect("courseId"))
        .collect();
    assert_eq!(courses, vec!["MATH 117", "MATH 118", "MATH 124"]);
    assert_eq!(
        regs[0].get("phase").and_then(|v| v.as_str()),
        Some("completed")
    );
    assert_eq!(regs[1].get("phase").and_then(|v| v.as_str()), Some("open"));
    assert_eq!(
        regs[2].get("phase").and_then(|v| v.as_str()),
        Some("unopened")
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn duplicate_pace_order_reports_indeterminate() {
    let workspace = temp_dir("pacetrack-pace-dup");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    seed_term(&mut stdin, &mut reader, &workspace);

    register(
        &mut stdin,
        &mut reader,
        "r1",
        "stu1",
        "MATH 117",
        json!({ "paceOrder": 1, "openStatus": "Y" }),
    );
    register(
        &mut stdin,
        &mut reader,
        "r2",
        "stu1",
        "MATH 118",
        json!({ "paceOrder": 1 }),
    );

    let summary = request(
        &mut stdin,
        &mut reader,
        "s",
        "pace.summary",
        json!({ "studentId": "stu1", "term": "SP21" }),
    );
    assert_eq!(
        result_of(&summary).get("status").and_then(|v| v.as_str()),
        Some("indeterminate")
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn dropped_registrations_leave_student_unregistered() {
    let workspace = temp_dir("pacetrack-pace-dropped");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    seed_term(&mut stdin, &mut reader, &workspace);

    register(
        &mut stdin,
        &mut reader,
        "r1",
        "stu1",
        "MATH 117",
        json!({ "openStatus": "D" }),
    );
    register(
        &mut stdin,
        &mut reader,
        "r2",
        "stu1",
        "MATH 118",
        json!({ "openStatus": "G" }),
    );

    let summary = request(
        &mut stdin,
        &mut reader,
        "s",
        "pace.summary",
        json!({ "studentId": "stu1", "term": "SP21" }),
    );
    let result = result_of(&summary);
    assert_eq!(
        result.get("status").and_then(|v| v.as_str()),
        Some("notRegistered")
    );
    assert_eq!(result.get("pace").and_then(|v| v.as_i64()), Some(0));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn published_rules_select_track_with_first_match() {
    let workspace = temp_dir("pacetrack-pace-rules");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    seed_term(&mut stdin, &mut reader, &workspace);

    let _ = request(
        &mut stdin,
        &mut reader,
        "rules",
        "paceTrackRules.publish",
        json!({
            "term": "SP21",
            "rules": [
                { "pace": 2, "paceTrack": "B", "criteria": "MATH 125" },
                { "pace": 2, "paceTrack": "C", "criteria": "" }
            ]
        }),
    );

    register(
        &mut stdin,
        &mut reader,
        "r1",
        "stu1",
        "MATH 125",
        json!({ "paceOrder": 1, "openStatus": "Y" }),
    );
    register(
        &mut stdin,
        &mut reader,
        "r2",
        "stu1",
        "MATH 126",
        json!({ "paceOrder": 2 }),
    );

    let summary = request(
        &mut stdin,
        &mut reader,
        "s1",
        "pace.summary",
        json!({ "studentId": "stu1", "term": "SP21" }),
    );
    assert_eq!(
        result_of(&summary).get("paceTrack").and_then(|v| v.as_str()),
        Some("B")
    );

    // A second student at the same pace without the required course falls
    // through to the catch-all rule.
    register(
        &mut stdin,
        &mut reader,
        "r3",
        "stu2",
        "MATH 117",
        json!({ "paceOrder": 1, "openStatus": "Y" }),
    );
    register(
        &mut stdin,
        &mut reader,
        "r4",
        "stu2",
        "MATH 118",
        json!({ "paceOrder": 2 }),
    );
    let other = request(
        &mut stdin,
        &mut reader,
        "s2",
        "pace.summary",
        json!({ "studentId": "stu2", "term": "SP21" }),
    );
    assert_eq!(
        result_of(&other).get("paceTrack").and_then(|v| v.as_str()),
        Some("C")
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
