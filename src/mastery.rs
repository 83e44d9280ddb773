use anyhow::Result;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use rusqlite::Connection;

use crate::milestones::{self, OBJECTIVES_PER_UNIT, STANDARD_COUNT, UNIT_COUNT};

const ON_TIME_POINTS: i64 = 5;
const LATE_POINTS: i64 = 4;

/// Finishes within this window past midnight are attributed to the
/// previous calendar day.
const MIDNIGHT_GRACE_MINUTES: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HomeworkStatus {
    NotAttempted,
    Attempted,
    Passed,
}

/// Per-standard mastery state. Folding attempts only ever advances the
/// state; the final value is the maximum over all attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum StandardStatus {
    NotAttempted,
    Attempted,
    MasteredLate,
    MasteredOnTime,
}

impl StandardStatus {
    pub fn is_mastered(self) -> bool {
        matches!(
            self,
            StandardStatus::MasteredLate | StandardStatus::MasteredOnTime
        )
    }

    pub fn points(self) -> i64 {
        match self {
            StandardStatus::MasteredOnTime => ON_TIME_POINTS,
            StandardStatus::MasteredLate => LATE_POINTS,
            _ => 0,
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            StandardStatus::NotAttempted => "notAttempted",
            StandardStatus::Attempted => "attempted",
            StandardStatus::MasteredLate => "masteredLate",
            StandardStatus::MasteredOnTime => "masteredOnTime",
        }
    }
}

impl HomeworkStatus {
    pub fn code(self) -> &'static str {
        match self {
            HomeworkStatus::NotAttempted => "notAttempted",
            HomeworkStatus::Attempted => "attempted",
            HomeworkStatus::Passed => "passed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct StandardProgress {
    pub unit: i64,
    pub objective: i64,
    pub due: Option<NaiveDate>,
    pub homework: HomeworkStatus,
    pub mastery: StandardStatus,
}

#[derive(Debug, Clone)]
pub struct MasterySnapshot {
    pub standards: Vec<StandardProgress>,
    pub nbr_mastered_first_half: i64,
    pub nbr_mastered_second_half: i64,
    pub nbr_pending_first_half: i64,
    pub nbr_pending_second_half: i64,
    pub score: i64,
}

/// A finish timestamp just past midnight belongs to the prior day's work.
pub fn adjusted_finish_date(finished: NaiveDateTime) -> NaiveDate {
    let grace_end = NaiveTime::from_hms_opt(0, MIDNIGHT_GRACE_MINUTES, 0)
        .expect("grace window is a valid time");
    if finished.time() < grace_end {
        finished.date() - chrono::Duration::days(1)
    } else {
        finished.date()
    }
}

pub fn fold_homework(current: HomeworkStatus, passed: bool) -> HomeworkStatus {
    let attempt = if passed {
        HomeworkStatus::Passed
    } else {
        HomeworkStatus::Attempted
    };
    current.max(attempt)
}

pub fn fold_mastery(current: StandardStatus, passed: bool, on_time: bool) -> StandardStatus {
    let attempt = if !passed {
        StandardStatus::Attempted
    } else if on_time {
        StandardStatus::MasteredOnTime
    } else {
        StandardStatus::MasteredLate
    };
    current.max(attempt)
}

struct AttemptRow {
    unit: i64,
    objective: i64,
    passed: bool,
    finished: NaiveDateTime,
}

fn load_attempts(
    conn: &Connection,
    table: &str,
    student_id: &str,
    course_id: &str,
) -> Result<Vec<AttemptRow>> {
    let sql = format!(
        "SELECT unit, objective, passed, finished FROM {} WHERE student_id = ? AND course_id = ?",
        table
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map((student_id, course_id), |r| {
            Ok((
                r.get::<_, i64>(0)?,
                r.get::<_, i64>(1)?,
                r.get::<_, i64>(2)?,
                r.get::<_, String>(3)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut out = Vec::with_capacity(rows.len());
    for (unit, objective, passed, finished) in rows {
        let finished = NaiveDateTime::parse_from_str(&finished, "%Y-%m-%dT%H:%M:%S")
            .map_err(|e| anyhow::anyhow!("bad attempt timestamp '{}': {}", finished, e))?;
        out.push(AttemptRow {
            unit,
            objective,
            passed: passed != 0,
            finished,
        });
    }
    Ok(out)
}

/// Folds the student's homework and mastery attempt logs against the
/// effective standard-milestone dates into a full progress snapshot for one
/// standards-based registration.
///
/// A standard whose due date was never published cannot be late; a passing
/// attempt there counts as mastered on time.
pub fn compute_mastery_status(
    conn: &Connection,
    term: &str,
    student_id: &str,
    course_id: &str,
    pace: i64,
    track: &str,
    pace_order: i64,
) -> Result<MasterySnapshot> {
    let homework = load_attempts(conn, "homework_attempts", student_id, course_id)?;
    let mastery = load_attempts(conn, "mastery_attempts", student_id, course_id)?;

    let mut standards = Vec::with_capacity(STANDARD_COUNT);
    for unit in 1..=UNIT_COUNT as i64 {
        for objective in 1..=OBJECTIVES_PER_UNIT as i64 {
            let due = milestones::effective_standard_date(
                conn, term, student_id, pace, track, pace_order, unit, objective,
            )?;

            let mut hw_status = HomeworkStatus::NotAttempted;
            for attempt in homework
                .iter()
                .filter(|a| a.unit == unit && a.objective == objective)
            {
                hw_status = fold_homework(hw_status, attempt.passed);
            }

            let mut status = StandardStatus::NotAttempted;
            for attempt in mastery
                .iter()
                .filter(|a| a.unit == unit && a.objective == objective)
            {
                let finish_day = adjusted_finish_date(attempt.finished);
                let on_time = due.map(|d| finish_day <= d).unwrap_or(true);
                status = fold_mastery(status, attempt.passed, on_time);
            }

            standards.push(StandardProgress {
                unit,
                objective,
                due,
                homework: hw_status,
                mastery: status,
            });
        }
    }

    let half = STANDARD_COUNT / 2;
    let mut mastered = (0_i64, 0_i64);
    let mut pending = (0_i64, 0_i64);
    let mut score = 0_i64;
    for (i, standard) in standards.iter().enumerate() {
        let first_half = i < half;
        if standard.mastery.is_mastered() {
            if first_half {
                mastered.0 += 1;
            } else {
                mastered.1 += 1;
            }
        } else if standard.homework == HomeworkStatus::Passed {
            // Homework passed but the standard not yet mastered: eligible
            // to attempt the mastery exam.
            if first_half {
                pending.0 += 1;
            } else {
                pending.1 += 1;
            }
        }
        score += standard.mastery.points();
    }

    Ok(MasterySnapshot {
        standards,
        nbr_mastered_first_half: mastered.0,
        nbr_mastered_second_half: mastered.1,
        nbr_pending_first_half: pending.0,
        nbr_pending_second_half: pending.1,
        score,
    })
}
