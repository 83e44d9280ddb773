use crate::{calendar, db, extensions, mastery, milestones, pace};
use chrono::NaiveDate;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::path::PathBuf;
use uuid::Uuid;

use extensions::{ApplyOutcome, ExtensionAvailability, ExtensionPool};
use milestones::{MilestoneKey, MilestoneType};
use pace::Classification;

#[derive(Debug, Deserialize)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct OkResp {
    id: String,
    ok: bool,
    result: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct ErrObj {
    code: String,
    message: String,
}

#[derive(Debug, Serialize)]
struct ErrResp {
    id: String,
    ok: bool,
    error: ErrObj,
}

pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
}

/// A routed method's failure: wire error code plus message. Database errors
/// fold in via `From` so handlers can use `?` throughout.
struct Failure {
    code: &'static str,
    message: String,
}

impl Failure {
    fn bad_params(message: impl Into<String>) -> Failure {
        Failure {
            code: "bad_params",
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Failure {
        Failure {
            code: "not_found",
            message: message.into(),
        }
    }
}

impl From<rusqlite::Error> for Failure {
    fn from(e: rusqlite::Error) -> Failure {
        Failure {
            code: "db_query_failed",
            message: e.to_string(),
        }
    }
}

impl From<anyhow::Error> for Failure {
    fn from(e: anyhow::Error) -> Failure {
        Failure {
            code: "db_query_failed",
            message: format!("{e:?}"),
        }
    }
}

type RouteResult = Result<serde_json::Value, Failure>;

pub fn handle_request(state: &mut AppState, req: Request) -> serde_json::Value {
    let id = req.id;
    match route(state, &req.method, &req.params) {
        Ok(result) => json!(OkResp {
            id,
            ok: true,
            result
        }),
        Err(f) => json!(ErrResp {
            id,
            ok: false,
            error: ErrObj {
                code: f.code.into(),
                message: f.message
            }
        }),
    }
}

fn route(state: &mut AppState, method: &str, params: &Value) -> RouteResult {
    match method {
        "health" => Ok(json!({
            "version": env!("CARGO_PKG_VERSION"),
            "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string())
        })),
        "workspace.select" => workspace_select(state, params),
        "terms.upsert" => terms_upsert(need_db(state)?, params),
        "holidays.set" => holidays_set(need_db(state)?, params),
        "courses.upsert" => courses_upsert(need_db(state)?, params),
        "registrations.upsert" => registrations_upsert(need_db(state)?, params),
        "registrations.list" => registrations_list(need_db(state)?, params),
        "paceTrackRules.publish" => pace_track_rules_publish(need_db(state)?, params),
        "milestones.publish" => milestones_publish(need_db(state)?, params),
        "standardMilestones.publish" => standard_milestones_publish(need_db(state)?, params),
        "standardMilestones.resolve" => standard_milestones_resolve(need_db(state)?, params),
        "milestones.override" => milestones_override(need_db(state)?, params),
        "standardMilestones.override" => standard_milestones_override(need_db(state)?, params),
        "accommodations.set" => accommodations_set(need_db(state)?, params),
        "masteryExams.publish" => mastery_exams_publish(need_db(state)?, params),
        "attempts.recordHomework" => record_attempt(need_db(state)?, params, "homework_attempts"),
        "attempts.recordMastery" => record_attempt(need_db(state)?, params, "mastery_attempts"),
        "pace.summary" => pace_summary(need_db(state)?, params),
        "milestones.resolve" => milestones_resolve(need_db(state)?, params),
        "milestones.effectiveDate" => milestones_effective_date(need_db(state)?, params),
        "milestones.standardGrid" => milestones_standard_grid(need_db(state)?, params),
        "extensions.daysAvailable" => extensions_days_available(need_db(state)?, params),
        "extensions.apply" => extensions_apply(need_db(state)?, params),
        "mastery.status" => mastery_status(need_db(state)?, params),
        "calendar.course" => calendar_course(need_db(state)?, params),
        _ => Err(Failure {
            code: "not_implemented",
            message: format!("unknown method: {}", method),
        }),
    }
}

fn need_db(state: &AppState) -> Result<&Connection, Failure> {
    state.db.as_ref().ok_or(Failure {
        code: "no_workspace",
        message: "no workspace selected".into(),
    })
}

// ---- parameter extraction ----

fn p_str(params: &Value, key: &str) -> Result<String, Failure> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| Failure::bad_params(format!("missing params.{}", key)))
}

fn p_opt_str(params: &Value, key: &str) -> Option<String> {
    params.get(key).and_then(|v| v.as_str()).map(str::to_string)
}

fn p_i64(params: &Value, key: &str) -> Result<i64, Failure> {
    match params.get(key) {
        Some(v) => v.as_i64().ok_or_else(|| {
            tracing::warn!(key, value = %v, "non-integer parameter");
            Failure::bad_params(format!("params.{} must be an integer", key))
        }),
        None => Err(Failure::bad_params(format!("missing params.{}", key))),
    }
}

fn p_opt_i64(params: &Value, key: &str) -> Result<Option<i64>, Failure> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v.as_i64().map(Some).ok_or_else(|| {
            tracing::warn!(key, value = %v, "non-integer parameter");
            Failure::bad_params(format!("params.{} must be an integer", key))
        }),
    }
}

fn p_bool_or(params: &Value, key: &str, default: bool) -> bool {
    params
        .get(key)
        .and_then(|v| v.as_bool())
        .unwrap_or(default)
}

fn p_date(params: &Value, key: &str) -> Result<NaiveDate, Failure> {
    let raw = p_str(params, key)?;
    parse_wire_date(&raw, key)
}

fn p_opt_date(params: &Value, key: &str) -> Result<Option<NaiveDate>, Failure> {
    match p_opt_str(params, key) {
        None => Ok(None),
        Some(raw) => parse_wire_date(&raw, key).map(Some),
    }
}

fn parse_wire_date(raw: &str, key: &str) -> Result<NaiveDate, Failure> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| {
        tracing::warn!(key, raw, "unparseable date parameter");
        Failure::bad_params(format!("params.{} must be a YYYY-MM-DD date", key))
    })
}

fn p_array<'a>(params: &'a Value, key: &str) -> Result<&'a Vec<Value>, Failure> {
    params
        .get(key)
        .and_then(|v| v.as_array())
        .ok_or_else(|| Failure::bad_params(format!("missing params.{}", key)))
}

fn p_ms_type(params: &Value, key: &str) -> Result<MilestoneType, Failure> {
    let code = p_str(params, key)?;
    MilestoneType::from_code(&code)
        .ok_or_else(|| Failure::bad_params(format!("unknown milestone type '{}'", code)))
}

fn p_pool(params: &Value) -> Result<ExtensionPool, Failure> {
    let code = p_str(params, "pool")?;
    ExtensionPool::from_code(&code)
        .ok_or_else(|| Failure::bad_params(format!("unknown extension pool '{}'", code)))
}

fn p_today(params: &Value) -> Result<NaiveDate, Failure> {
    Ok(p_opt_date(params, "today")?.unwrap_or_else(|| chrono::Local::now().date_naive()))
}

fn date_str(d: NaiveDate) -> String {
    d.format("%Y-%m-%d").to_string()
}

// ---- workspace + seeding ----

fn workspace_select(state: &mut AppState, params: &Value) -> RouteResult {
    let path = PathBuf::from(p_str(params, "path")?);
    let conn = db::open_db(&path).map_err(|e| Failure {
        code: "db_query_failed",
        message: format!("{e:?}"),
    })?;
    state.workspace = Some(path.clone());
    state.db = Some(conn);
    Ok(json!({ "workspacePath": path.to_string_lossy() }))
}

fn terms_upsert(conn: &Connection, params: &Value) -> RouteResult {
    let term = p_str(params, "term")?;
    let start = p_date(params, "startDate")?;
    let end = p_date(params, "endDate")?;
    let free_days = p_opt_i64(params, "freeExtensionDays")?.unwrap_or(2);
    let active = p_bool_or(params, "active", false);

    conn.execute(
        "INSERT INTO terms(term, start_date, end_date, free_extension_days, active)
         VALUES (?, ?, ?, ?, ?)
         ON CONFLICT(term) DO UPDATE SET
           start_date = excluded.start_date,
           end_date = excluded.end_date,
           free_extension_days = excluded.free_extension_days,
           active = excluded.active",
        (
            &term,
            date_str(start),
            date_str(end),
            free_days,
            active as i64,
        ),
    )?;
    Ok(json!({ "term": term }))
}

fn holidays_set(conn: &Connection, params: &Value) -> RouteResult {
    let term = p_str(params, "term")?;
    let entries = p_array(params, "holidays")?;

    let tx = conn.unchecked_transaction()?;
    tx.execute("DELETE FROM holidays WHERE term = ?", [&term])?;
    for entry in entries {
        let date = p_date(entry, "date")?;
        let description = p_opt_str(entry, "description").unwrap_or_else(|| "Holiday".into());
        tx.execute(
            "INSERT INTO holidays(term, date, description) VALUES (?, ?, ?)",
            (&term, date_str(date), description),
        )?;
    }
    tx.commit()?;
    Ok(json!({ "term": term, "count": entries.len() }))
}

fn courses_upsert(conn: &Connection, params: &Value) -> RouteResult {
    let course_id = p_str(params, "courseId")?;
    let label = p_str(params, "label")?;
    let standards_based = p_bool_or(params, "standardsBased", false);

    conn.execute(
        "INSERT INTO courses(course_id, label, standards_based)
         VALUES (?, ?, ?)
         ON CONFLICT(course_id) DO UPDATE SET
           label = excluded.label,
           standards_based = excluded.standards_based",
        (&course_id, label, standards_based as i64),
    )?;
    Ok(json!({ "courseId": course_id }))
}

fn registrations_upsert(conn: &Connection, params: &Value) -> RouteResult {
    let student_id = p_str(params, "studentId")?;
    let course_id = p_str(params, "courseId")?;
    let sect = p_str(params, "sect")?;
    let term = p_str(params, "term")?;
    let pace_order = p_opt_i64(params, "paceOrder")?;
    let open_status = p_opt_str(params, "openStatus");
    let completed = p_bool_or(params, "completed", false);
    let inc_in_progress = p_bool_or(params, "incInProgress", false);
    let inc_term = p_opt_str(params, "incTerm");
    let inc_counted = p_bool_or(params, "incCounted", false);
    let inc_deadline = p_opt_date(params, "incDeadline")?;

    conn.execute(
        "INSERT INTO registrations(
             id, student_id, course_id, sect, term, pace_order, open_status,
             completed, inc_in_progress, inc_term, inc_counted, inc_deadline)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(student_id, course_id, term) DO UPDATE SET
           sect = excluded.sect,
           pace_order = excluded.pace_order,
           open_status = excluded.open_status,
           completed = excluded.completed,
           inc_in_progress = excluded.inc_in_progress,
           inc_term = excluded.inc_term,
           inc_counted = excluded.inc_counted,
           inc_deadline = excluded.inc_deadline",
        (
            Uuid::new_v4().to_string(),
            &student_id,
            &course_id,
            sect,
            &term,
            pace_order,
            open_status,
            completed as i64,
            inc_in_progress as i64,
            inc_term,
            inc_counted as i64,
            inc_deadline.map(date_str),
        ),
    )?;
    Ok(json!({ "studentId": student_id, "courseId": course_id, "term": term }))
}

fn registrations_list(conn: &Connection, params: &Value) -> RouteResult {
    let student_id = p_str(params, "studentId")?;
    let term = p_str(params, "term")?;
    let regs = load_registrations(conn, &student_id, &term)?;
    Ok(json!({ "registrations": regs }))
}

fn pace_track_rules_publish(conn: &Connection, params: &Value) -> RouteResult {
    let term = p_str(params, "term")?;
    let rules = p_array(params, "rules")?;

    let tx = conn.unchecked_transaction()?;
    tx.execute("DELETE FROM pace_track_rules WHERE term = ?", [&term])?;
    for (i, rule) in rules.iter().enumerate() {
        let pace = p_i64(rule, "pace")?;
        let pace_track = p_str(rule, "paceTrack")?;
        let subterm = p_opt_str(rule, "subterm");
        let criteria = p_opt_str(rule, "criteria").unwrap_or_default();
        tx.execute(
            "INSERT INTO pace_track_rules(id, term, subterm, pace, pace_track, criteria, sort_order)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            (
                Uuid::new_v4().to_string(),
                &term,
                subterm,
                pace,
                pace_track,
                criteria,
                i as i64,
            ),
        )?;
    }
    tx.commit()?;
    Ok(json!({ "term": term, "count": rules.len() }))
}

fn milestones_publish(conn: &Connection, params: &Value) -> RouteResult {
    let term = p_str(params, "term")?;
    let pace = p_i64(params, "pace")?;
    let track = p_str(params, "paceTrack")?;
    let entries = p_array(params, "milestones")?;

    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "DELETE FROM milestones WHERE term = ? AND pace = ? AND pace_track = ?",
        (&term, pace, &track),
    )?;
    for entry in entries {
        let pace_order = p_i64(entry, "paceOrder")?;
        let unit = p_i64(entry, "unit")?;
        let ms_type = p_ms_type(entry, "type")?;
        let date = p_date(entry, "date")?;
        tx.execute(
            "INSERT INTO milestones(term, pace, pace_track, pace_order, unit, ms_type, ms_date)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            (
                &term,
                pace,
                &track,
                pace_order,
                unit,
                ms_type.code(),
                date_str(date),
            ),
        )?;
    }
    tx.commit()?;
    Ok(json!({ "term": term, "pace": pace, "paceTrack": track, "count": entries.len() }))
}

fn standard_milestones_publish(conn: &Connection, params: &Value) -> RouteResult {
    let term = p_str(params, "term")?;
    let pace = p_i64(params, "pace")?;
    let track = p_str(params, "paceTrack")?;
    let entries = p_array(params, "milestones")?;

    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "DELETE FROM standard_milestones WHERE term = ? AND pace = ? AND pace_track = ?",
        (&term, pace, &track),
    )?;
    for entry in entries {
        let pace_order = p_i64(entry, "paceOrder")?;
        let unit = p_i64(entry, "unit")?;
        let objective = p_i64(entry, "objective")?;
        let date = p_date(entry, "date")?;
        tx.execute(
            "INSERT INTO standard_milestones(
                 term, pace, pace_track, pace_order, unit, objective, ms_date)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            (
                &term,
                pace,
                &track,
                pace_order,
                unit,
                objective,
                date_str(date),
            ),
        )?;
    }
    tx.commit()?;
    Ok(json!({ "term": term, "pace": pace, "paceTrack": track, "count": entries.len() }))
}

fn standard_milestones_resolve(conn: &Connection, params: &Value) -> RouteResult {
    let term = p_str(params, "term")?;
    let pace = p_i64(params, "pace")?;
    let track = p_str(params, "paceTrack")?;
    let pace_order = p_i64(params, "paceOrder")?;

    let resolved =
        milestones::resolve_standard_milestones(conn, &term, pace, &track, pace_order)?;
    let rows: Vec<Value> = resolved
        .iter()
        .map(|m| {
            json!({
                "paceOrder": m.pace_order,
                "unit": m.unit,
                "objective": m.objective,
                "date": date_str(m.date)
            })
        })
        .collect();
    Ok(json!({ "milestones": rows }))
}

/// Administrative override of one student's milestone date. Appends a row;
/// reads pick the most recently written one for the key.
fn milestones_override(conn: &Connection, params: &Value) -> RouteResult {
    let term = p_str(params, "term")?;
    let student_id = p_str(params, "studentId")?;
    let pace = p_i64(params, "pace")?;
    let track = p_str(params, "paceTrack")?;
    let key = milestone_key_params(params)?;
    let date = p_date(params, "date")?;
    let reason = p_opt_str(params, "reason").unwrap_or_else(|| "ADMIN".into());
    let attempts_allowed = p_opt_i64(params, "attemptsAllowed")?;

    let prior = milestones::effective_date(conn, &term, &student_id, pace, &track, key)?;
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO milestone_overrides(
             id, term, student_id, pace, pace_track, pace_order, unit, ms_type,
             ms_date, prior_date, reason, attempts_allowed, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            &id,
            &term,
            &student_id,
            pace,
            &track,
            key.pace_order,
            key.unit,
            key.ms_type.code(),
            date_str(date),
            prior.map(date_str),
            reason,
            attempts_allowed,
            chrono::Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(json!({ "id": id, "date": date_str(date), "priorDate": prior.map(date_str) }))
}

fn standard_milestones_override(conn: &Connection, params: &Value) -> RouteResult {
    let term = p_str(params, "term")?;
    let student_id = p_str(params, "studentId")?;
    let pace = p_i64(params, "pace")?;
    let track = p_str(params, "paceTrack")?;
    let pace_order = p_i64(params, "paceOrder")?;
    let unit = p_i64(params, "unit")?;
    let objective = p_i64(params, "objective")?;
    let date = p_date(params, "date")?;
    let reason = p_opt_str(params, "reason").unwrap_or_else(|| "ADMIN".into());

    let prior = milestones::effective_standard_date(
        conn, &term, &student_id, pace, &track, pace_order, unit, objective,
    )?;
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO standard_milestone_overrides(
             id, term, student_id, pace, pace_track, pace_order, unit, objective,
             ms_date, prior_date, reason, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            &id,
            &term,
            &student_id,
            pace,
            &track,
            pace_order,
            unit,
            objective,
            date_str(date),
            prior.map(date_str),
            reason,
            chrono::Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(json!({ "id": id, "date": date_str(date), "priorDate": prior.map(date_str) }))
}

fn accommodations_set(conn: &Connection, params: &Value) -> RouteResult {
    let student_id = p_str(params, "studentId")?;
    let extension_days = p_i64(params, "extensionDays")?;
    let start = p_opt_date(params, "startDate")?;
    let end = p_opt_date(params, "endDate")?;

    conn.execute(
        "INSERT OR REPLACE INTO accommodations(student_id, extension_days, start_date, end_date)
         VALUES (?, ?, ?, ?)",
        (
            &student_id,
            extension_days,
            start.map(date_str),
            end.map(date_str),
        ),
    )?;
    Ok(json!({ "studentId": student_id }))
}

fn mastery_exams_publish(conn: &Connection, params: &Value) -> RouteResult {
    let entries = p_array(params, "exams")?;

    let tx = conn.unchecked_transaction()?;
    for entry in entries {
        let course_id = p_str(entry, "courseId")?;
        let unit = p_i64(entry, "unit")?;
        let objective = p_i64(entry, "objective")?;
        let exam_id = p_str(entry, "examId")?;
        tx.execute(
            "INSERT OR REPLACE INTO mastery_exams(course_id, unit, objective, exam_id)
             VALUES (?, ?, ?, ?)",
            (course_id, unit, objective, exam_id),
        )?;
    }
    tx.commit()?;
    Ok(json!({ "count": entries.len() }))
}

fn record_attempt(conn: &Connection, params: &Value, table: &str) -> RouteResult {
    let student_id = p_str(params, "studentId")?;
    let course_id = p_str(params, "courseId")?;
    let unit = p_i64(params, "unit")?;
    let objective = p_i64(params, "objective")?;
    let passed = p_bool_or(params, "passed", false);
    let finished = p_str(params, "finished")?;
    if chrono::NaiveDateTime::parse_from_str(&finished, "%Y-%m-%dT%H:%M:%S").is_err() {
        tracing::warn!(finished, "unparseable attempt timestamp");
        return Err(Failure::bad_params(
            "params.finished must be a YYYY-MM-DDTHH:MM:SS timestamp",
        ));
    }

    let id = Uuid::new_v4().to_string();
    if table == "mastery_attempts" {
        let exam_id = p_opt_str(params, "examId");
        conn.execute(
            "INSERT INTO mastery_attempts(
                 id, student_id, course_id, unit, objective, exam_id, passed, finished)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            (
                &id,
                student_id,
                course_id,
                unit,
                objective,
                exam_id,
                passed as i64,
                finished,
            ),
        )?;
    } else {
        conn.execute(
            "INSERT INTO homework_attempts(
                 id, student_id, course_id, unit, objective, passed, finished)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            (
                &id,
                student_id,
                course_id,
                unit,
                objective,
                passed as i64,
                finished,
            ),
        )?;
    }
    Ok(json!({ "id": id }))
}

// ---- schedule resolution shared by the read methods ----

fn load_registrations(
    conn: &Connection,
    student_id: &str,
    term: &str,
) -> Result<Vec<pace::Registration>, Failure> {
    let mut stmt = conn.prepare(
        "SELECT student_id, course_id, sect, term, pace_order, open_status,
                completed, inc_in_progress, inc_term, inc_counted, inc_deadline
         FROM registrations
         WHERE student_id = ? AND term = ?
         ORDER BY course_id",
    )?;
    let rows = stmt
        .query_map((student_id, term), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, Option<i64>>(4)?,
                r.get::<_, Option<String>>(5)?,
                r.get::<_, i64>(6)?,
                r.get::<_, i64>(7)?,
                r.get::<_, Option<String>>(8)?,
                r.get::<_, i64>(9)?,
                r.get::<_, Option<String>>(10)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut out = Vec::with_capacity(rows.len());
    for (
        student_id,
        course_id,
        sect,
        term,
        pace_order,
        open_status,
        completed,
        inc_in_progress,
        inc_term,
        inc_counted,
        inc_deadline,
    ) in rows
    {
        out.push(pace::Registration {
            student_id,
            course_id,
            sect,
            term,
            pace_order,
            open_status,
            completed: completed != 0,
            inc_in_progress: inc_in_progress != 0,
            inc_term,
            inc_counted: inc_counted != 0,
            inc_deadline: inc_deadline
                .as_deref()
                .map(milestones::parse_date)
                .transpose()?,
        });
    }
    Ok(out)
}

fn load_rules(conn: &Connection, term: &str) -> Result<Vec<pace::PaceTrackRule>, Failure> {
    let mut stmt = conn.prepare(
        "SELECT subterm, pace, pace_track, criteria
         FROM pace_track_rules
         WHERE term = ?
         ORDER BY sort_order",
    )?;
    let rows = stmt
        .query_map([term], |r| {
            Ok(pace::PaceTrackRule {
                subterm: r.get(0)?,
                pace: r.get(1)?,
                pace_track: r.get(2)?,
                criteria: r.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

enum Schedule {
    NotRegistered,
    Indeterminate,
    Valid {
        pace: i64,
        track: String,
        ordered: pace::OrderedRegistrations,
    },
}

fn student_schedule(conn: &Connection, term: &str, student_id: &str) -> Result<Schedule, Failure> {
    let regs = load_registrations(conn, student_id, term)?;
    let pace_count = pace::determine_pace(&regs);
    match pace::classify(regs) {
        Classification::NotRegistered => Ok(Schedule::NotRegistered),
        Classification::Indeterminate => Ok(Schedule::Indeterminate),
        Classification::Valid(ordered) => {
            let rules = load_rules(conn, term)?;
            let track = pace::determine_pace_track(&rules, &ordered.regs, pace_count);
            Ok(Schedule::Valid {
                pace: pace_count,
                track,
                ordered,
            })
        }
    }
}

/// Finds the pace slot one course occupies in a valid schedule.
fn course_slot(ordered: &pace::OrderedRegistrations, course_id: &str) -> Option<i64> {
    ordered
        .regs
        .iter()
        .find(|r| r.course_id == course_id)
        .and_then(|r| r.pace_order)
}

// ---- core read methods ----

fn pace_summary(conn: &Connection, params: &Value) -> RouteResult {
    let student_id = p_str(params, "studentId")?;
    let term = p_str(params, "term")?;

    match student_schedule(conn, &term, &student_id)? {
        Schedule::NotRegistered => Ok(json!({ "status": "notRegistered", "pace": 0 })),
        Schedule::Indeterminate => Ok(json!({ "status": "indeterminate" })),
        Schedule::Valid {
            pace,
            track,
            ordered,
        } => {
            let courses: Vec<Value> = ordered
                .regs
                .iter()
                .zip(ordered.phases.iter())
                .map(|(r, phase)| {
                    json!({
                        "courseId": r.course_id,
                        "paceOrder": r.pace_order,
                        "phase": phase
                    })
                })
                .collect();
            Ok(json!({
                "status": "ok",
                "pace": pace,
                "paceTrack": track,
                "registrations": courses
            }))
        }
    }
}

fn milestones_resolve(conn: &Connection, params: &Value) -> RouteResult {
    let term = p_str(params, "term")?;
    let pace = p_i64(params, "pace")?;
    let track = p_str(params, "paceTrack")?;

    let resolved = milestones::resolve_milestones(conn, &term, pace, &track)?;
    let rows: Vec<Value> = resolved
        .iter()
        .map(|m| {
            json!({
                "paceOrder": m.key.pace_order,
                "unit": m.key.unit,
                "type": m.key.ms_type.code(),
                "date": date_str(m.date)
            })
        })
        .collect();
    Ok(json!({ "milestones": rows }))
}

fn milestone_key_params(params: &Value) -> Result<MilestoneKey, Failure> {
    Ok(MilestoneKey {
        pace_order: p_i64(params, "paceOrder")?,
        unit: p_i64(params, "unit")?,
        ms_type: p_ms_type(params, "type")?,
    })
}

fn milestones_effective_date(conn: &Connection, params: &Value) -> RouteResult {
    let term = p_str(params, "term")?;
    let student_id = p_str(params, "studentId")?;
    let pace = p_i64(params, "pace")?;
    let track = p_str(params, "paceTrack")?;
    let key = milestone_key_params(params)?;

    let ov = milestones::latest_override(conn, &term, &student_id, pace, &track, key)?;
    if let Some(ov) = ov {
        return Ok(json!({
            "date": date_str(ov.date),
            "overridden": true,
            "priorDate": ov.prior_date.map(date_str),
            "reason": ov.reason,
            "attemptsAllowed": ov.attempts_allowed
        }));
    }
    match milestones::template_date(conn, &term, pace, &track, key)? {
        Some(date) => Ok(json!({ "date": date_str(date), "overridden": false })),
        None => Err(Failure::not_found("no milestone published for that key")),
    }
}

fn milestones_standard_grid(conn: &Connection, params: &Value) -> RouteResult {
    let term = p_str(params, "term")?;
    let student_id = p_str(params, "studentId")?;
    let pace = p_i64(params, "pace")?;
    let track = p_str(params, "paceTrack")?;
    let pace_order = p_i64(params, "paceOrder")?;

    let grid = milestones::standard_grid(conn, &term, &student_id, pace, &track, pace_order)?;
    let rows: Vec<Vec<Option<String>>> = grid
        .into_iter()
        .map(|row| row.into_iter().map(|d| d.map(date_str)).collect())
        .collect();
    Ok(json!({ "grid": rows }))
}

fn extensions_days_available(conn: &Connection, params: &Value) -> RouteResult {
    let term = p_str(params, "term")?;
    let student_id = p_str(params, "studentId")?;
    let pace = p_i64(params, "pace")?;
    let track = p_str(params, "paceTrack")?;
    let key = milestone_key_params(params)?;
    let pool = p_pool(params)?;
    let today = p_today(params)?;

    let availability =
        extensions::days_available(conn, &term, &student_id, &track, pace, key, pool, today)?;
    Ok(availability_json(availability))
}

fn availability_json(availability: ExtensionAvailability) -> Value {
    match availability {
        ExtensionAvailability::AlreadyApplied => json!({ "status": "alreadyApplied" }),
        ExtensionAvailability::Ineligible(reason) => {
            json!({ "status": "ineligible", "reason": reason.code() })
        }
        ExtensionAvailability::Available(grant) => json!({
            "status": "available",
            "requestedDays": grant.requested_days,
            "grantedDays": grant.granted_days,
            "capped": grant.capped()
        }),
    }
}

fn extensions_apply(conn: &Connection, params: &Value) -> RouteResult {
    let session_student = p_str(params, "sessionStudentId")?;
    let student_id = p_str(params, "stu")?;
    if session_student != student_id {
        tracing::warn!(
            session = %session_student,
            target = %student_id,
            "extension apply refused for mismatched student"
        );
        return Err(Failure {
            code: "not_owner",
            message: "session student does not match target student".into(),
        });
    }

    let term = p_str(params, "term")?;
    let pace = p_i64(params, "pace")?;
    let track = p_str(params, "paceTrack")?;
    let key = milestone_key_params(params)?;
    let pool = p_pool(params)?;
    let today = p_today(params)?;

    let outcome =
        extensions::apply_extension(conn, &term, &student_id, &track, pace, key, pool, today)?;
    match outcome {
        ApplyOutcome::Applied {
            grant,
            prior_date,
            new_date,
        } => Ok(json!({
            "status": "applied",
            "requestedDays": grant.requested_days,
            "grantedDays": grant.granted_days,
            "capped": grant.capped(),
            "priorDate": date_str(prior_date),
            "newDate": date_str(new_date)
        })),
        ApplyOutcome::AlreadyApplied => Ok(json!({ "status": "alreadyApplied" })),
        ApplyOutcome::NotApplied(reason) => {
            Ok(json!({ "status": "ineligible", "reason": reason.code() }))
        }
        ApplyOutcome::NothingToGrant => Err(Failure {
            code: "cannot_apply",
            message: "no days can be granted before the end of the term".into(),
        }),
    }
}

fn mastery_status(conn: &Connection, params: &Value) -> RouteResult {
    let term = p_str(params, "term")?;
    let student_id = p_str(params, "studentId")?;
    let course_id = p_str(params, "courseId")?;

    let (pace, track, ordered) = match student_schedule(conn, &term, &student_id)? {
        Schedule::NotRegistered => return Ok(json!({ "status": "notRegistered" })),
        Schedule::Indeterminate => return Ok(json!({ "status": "indeterminate" })),
        Schedule::Valid {
            pace,
            track,
            ordered,
        } => (pace, track, ordered),
    };
    let Some(pace_order) = course_slot(&ordered, &course_id) else {
        return Err(Failure::not_found("student is not in that course's pace"));
    };

    let snapshot = mastery::compute_mastery_status(
        conn,
        &term,
        &student_id,
        &course_id,
        pace,
        &track,
        pace_order,
    )?;
    let standards: Vec<Value> = snapshot
        .standards
        .iter()
        .map(|s| {
            json!({
                "unit": s.unit,
                "objective": s.objective,
                "due": s.due.map(date_str),
                "homework": s.homework.code(),
                "mastery": s.mastery.code()
            })
        })
        .collect();
    Ok(json!({
        "status": "ok",
        "pace": pace,
        "paceTrack": track,
        "paceOrder": pace_order,
        "standards": standards,
        "nbrMasteredFirstHalf": snapshot.nbr_mastered_first_half,
        "nbrMasteredSecondHalf": snapshot.nbr_mastered_second_half,
        "nbrPendingFirstHalf": snapshot.nbr_pending_first_half,
        "nbrPendingSecondHalf": snapshot.nbr_pending_second_half,
        "score": snapshot.score
    }))
}

fn calendar_course(conn: &Connection, params: &Value) -> RouteResult {
    let term = p_str(params, "term")?;
    let student_id = p_str(params, "studentId")?;
    let course_id = p_str(params, "courseId")?;

    let (pace, track, ordered) = match student_schedule(conn, &term, &student_id)? {
        Schedule::NotRegistered => return Ok(json!({ "status": "notRegistered" })),
        Schedule::Indeterminate => return Ok(json!({ "status": "indeterminate" })),
        Schedule::Valid {
            pace,
            track,
            ordered,
        } => (pace, track, ordered),
    };
    let Some(pace_order) = course_slot(&ordered, &course_id) else {
        return Err(Failure::not_found("student is not in that course's pace"));
    };

    let all = milestones::resolve_milestones(conn, &term, pace, &track)?;
    let mut course_ms = milestones::milestones_for_course(&all, pace_order);
    // The calendar shows the student's own dates, overrides included.
    for m in &mut course_ms {
        if let Some(ov) =
            milestones::latest_override(conn, &term, &student_id, pace, &track, m.key)?
        {
            m.date = ov.date;
        }
    }

    let holidays = load_holidays(conn, &term)?;
    let weeks = calendar::course_calendar(&course_ms, &holidays);
    Ok(json!({
        "status": "ok",
        "pace": pace,
        "paceTrack": track,
        "paceOrder": pace_order,
        "weeks": weeks
    }))
}

/// Only entries tagged exactly "Holiday" suppress tasks; other calendar
/// notes (commencement, registration deadlines) render as ordinary days.
fn load_holidays(conn: &Connection, term: &str) -> Result<HashSet<NaiveDate>, Failure> {
    let mut stmt =
        conn.prepare("SELECT date FROM holidays WHERE term = ? AND description = 'Holiday'")?;
    let rows = stmt
        .query_map([term], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    let mut out = HashSet::with_capacity(rows.len());
    for raw in rows {
        out.insert(milestones::parse_date(&raw)?);
    }
    Ok(out)
}
