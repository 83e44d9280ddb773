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

fn day<'a>(weeks: &'a [serde_json::Value], date: &str) -> &'a serde_json::Value {
    weeks
        .iter()
        .flat_map(|w| w.get("days").and_then(|d| d.as_array()).expect("days"))
        .find(|d| d.get("date").and_then(|v| v.as_str()) == Some(date))
        .unwrap_or_else(|| panic!("no day cell for {}", date))
}

#[test]
fn course_calendar_expands_weeks_and_skips_f1() {
    let workspace = temp_dir("pacetrack-calendar");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "term",
        "terms.upsert",
        json!({
            "term": "SP21",
            "startDate": "2021-01-19",
            "endDate": "2021-05-14",
            "active": true
        }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "hol",
        "holidays.set",
        json!({
            "term": "SP21",
            "holidays": [
                { "date": "2021-03-02", "description": "Holiday" },
                { "date": "2021-03-04", "description": "Commencement" }
            ]
        }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "reg",
        "registrations.upsert",
        json!({
            "studentId": "stu1",
            "courseId": "MATH 117",
            "sect": "001",
            "term": "SP21",
            "paceOrder": 1,
            "openStatus": "Y"
        }),
    );
    // Tue Mar 2 through Thu Mar 11, plus an F1 marker far outside the span.
    let _ = request(
        &mut stdin,
        &mut reader,
        "ms",
        "milestones.publish",
        json!({
            "term": "SP21",
            "pace": 1,
            "paceTrack": "A",
            "milestones": [
                { "paceOrder": 1, "unit": 1, "type": "RE", "date": "2021-03-02" },
                { "paceOrder": 1, "unit": 1, "type": "UE", "date": "2021-03-04" },
                { "paceOrder": 1, "unit": 2, "type": "H1", "date": "2021-03-11" },
                { "paceOrder": 1, "unit": 5, "type": "F1", "date": "2021-05-17" }
            ]
        }),
    );

    let cal = request(
        &mut stdin,
        &mut reader,
        "cal",
        "calendar.course",
        json!({ "term": "SP21", "studentId": "stu1", "courseId": "MATH 117" }),
    );
    let result = result_of(&cal);
    assert_eq!(result.get("status").and_then(|v| v.as_str()), Some("ok"));
    let weeks = result
        .get("weeks")
        .and_then(|v| v.as_array())
        .expect("weeks array")
        .clone();

    // Two display weeks, Sunday Feb 28 through Saturday Mar 13; the May F1
    // marker does not stretch the grid.
    assert_eq!(weeks.len(), 2);
    let first_days = weeks[0].get("days").and_then(|d| d.as_array()).expect("days");
    assert_eq!(first_days.len(), 7);
    assert_eq!(
        first_days[0].get("date").and_then(|v| v.as_str()),
        Some("2021-02-28")
    );

    // The holiday cell is flagged and its task suppressed.
    let tuesday = day(&weeks, "2021-03-02");
    assert_eq!(tuesday.get("holiday").and_then(|v| v.as_bool()), Some(true));
    assert_eq!(
        tuesday
            .get("tasks")
            .and_then(|v| v.as_array())
            .map(|t| t.len()),
        Some(0)
    );

    // A calendar note that is not tagged "Holiday" does not suppress the
    // day's tasks or render as a holiday.
    let thursday = day(&weeks, "2021-03-04");
    assert_eq!(
        thursday.get("holiday").and_then(|v| v.as_bool()),
        Some(false)
    );
    let tasks: Vec<&str> = thursday
        .get("tasks")
        .and_then(|v| v.as_array())
        .expect("tasks")
        .iter()
        .map(|t| t.as_str().expect("task label"))
        .collect();
    assert_eq!(tasks, vec!["Unit 1 Exam"]);

    let objective_day = day(&weeks, "2021-03-11");
    let obj_tasks: Vec<&str> = objective_day
        .get("tasks")
        .and_then(|v| v.as_array())
        .expect("tasks")
        .iter()
        .map(|t| t.as_str().expect("task label"))
        .collect();
    assert_eq!(obj_tasks, vec!["Objective 2.1"]);

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn calendar_reflects_override_dates() {
    let workspace = temp_dir("pacetrack-calendar-override");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "term",
        "terms.upsert",
        json!({
            "term": "SP21",
            "startDate": "2021-01-19",
            "endDate": "2021-05-14",
            "freeExtensionDays": 4,
            "active": true
        }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "reg",
        "registrations.upsert",
        json!({
            "studentId": "stu1",
            "courseId": "MATH 117",
            "sect": "001",
            "term": "SP21",
            "paceOrder": 1,
            "openStatus": "Y"
        }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "ms",
        "milestones.publish",
        json!({
            "term": "SP21",
            "pace": 1,
            "paceTrack": "A",
            "milestones": [
                { "paceOrder": 1, "unit": 1, "type": "RE", "date": "2021-03-02" },
                { "paceOrder": 1, "unit": 1, "type": "UE", "date": "2021-03-04" }
            ]
        }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "ext",
        "extensions.apply",
        json!({
            "sessionStudentId": "stu1",
            "stu": "stu1",
            "term": "SP21",
            "pace": 1,
            "paceTrack": "A",
            "paceOrder": 1,
            "unit": 1,
            "type": "UE",
            "pool": "FREE",
            "today": "2021-03-03"
        }),
    );

    let cal = request(
        &mut stdin,
        &mut reader,
        "cal",
        "calendar.course",
        json!({ "term": "SP21", "studentId": "stu1", "courseId": "MATH 117" }),
    );
    let weeks = result_of(&cal)
        .get("weeks")
        .and_then(|v| v.as_array())
        .expect("weeks array")
        .clone();

    // The exam task moved from Mar 4 to Mar 8 with the free extension.
    let old_day = day(&weeks, "2021-03-04");
    assert_eq!(
        old_day
            .get("tasks")
            .and_then(|v| v.as_array())
            .map(|t| t.len()),
        Some(0)
    );
    let new_day = day(&weeks, "2021-03-08");
    let tasks: Vec<&str> = new_day
        .get("tasks")
        .and_then(|v| v.as_array())
        .expect("tasks")
        .iter()
        .map(|t| t.as_str().expect("task label"))
        .collect();
    assert_eq!(tasks, vec!["Unit 1 Exam"]);

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
