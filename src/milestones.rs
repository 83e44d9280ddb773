use anyhow::Result;
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};

/// Shape of the standards-based deadline grid: 8 units of 3 learning
/// standards each.
pub const UNIT_COUNT: usize = 8;
pub const OBJECTIVES_PER_UNIT: usize = 3;
pub const STANDARD_COUNT: usize = UNIT_COUNT * OBJECTIVES_PER_UNIT;

/// The closed set of milestone types. The stored form is the two-character
/// code; all logic switches over the enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MilestoneType {
    SkillsReview,
    Homework1,
    Homework2,
    Homework3,
    Homework4,
    Homework5,
    UnitReview,
    UnitExam,
    FinalExam,
    FinalPlusOne,
    UsersExam,
}

impl MilestoneType {
    pub fn code(self) -> &'static str {
        match self {
            MilestoneType::SkillsReview => "SR",
            MilestoneType::Homework1 => "H1",
            MilestoneType::Homework2 => "H2",
            MilestoneType::Homework3 => "H3",
            MilestoneType::Homework4 => "H4",
            MilestoneType::Homework5 => "H5",
            MilestoneType::UnitReview => "RE",
            MilestoneType::UnitExam => "UE",
            MilestoneType::FinalExam => "FE",
            MilestoneType::FinalPlusOne => "F1",
            MilestoneType::UsersExam => "US",
        }
    }

    pub fn from_code(code: &str) -> Option<MilestoneType> {
        match code {
            "SR" => Some(MilestoneType::SkillsReview),
            "H1" => Some(MilestoneType::Homework1),
            "H2" => Some(MilestoneType::Homework2),
            "H3" => Some(MilestoneType::Homework3),
            "H4" => Some(MilestoneType::Homework4),
            "H5" => Some(MilestoneType::Homework5),
            "RE" => Some(MilestoneType::UnitReview),
            "UE" => Some(MilestoneType::UnitExam),
            "FE" => Some(MilestoneType::FinalExam),
            "F1" => Some(MilestoneType::FinalPlusOne),
            "US" => Some(MilestoneType::UsersExam),
            _ => None,
        }
    }

    /// F1 is a bookkeeping marker for the final-exam retry, not a deadline;
    /// it never participates in date ranges or calendar rendering.
    pub fn is_deadline(self) -> bool {
        self != MilestoneType::FinalPlusOne
    }

    fn rank(self) -> u8 {
        match self {
            MilestoneType::UsersExam => 0,
            MilestoneType::SkillsReview => 1,
            MilestoneType::Homework1 => 2,
            MilestoneType::Homework2 => 3,
            MilestoneType::Homework3 => 4,
            MilestoneType::Homework4 => 5,
            MilestoneType::Homework5 => 6,
            MilestoneType::UnitReview => 7,
            MilestoneType::UnitExam => 8,
            MilestoneType::FinalExam => 9,
            MilestoneType::FinalPlusOne => 10,
        }
    }
}

/// Identifies one milestone slot within a (pace, track) schedule.
/// Pace-order and unit are separate fields and are always matched
/// explicitly, never encoded into a combined number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MilestoneKey {
    pub pace_order: i64,
    pub unit: i64,
    pub ms_type: MilestoneType,
}

#[derive(Debug, Clone)]
pub struct Milestone {
    pub key: MilestoneKey,
    pub date: NaiveDate,
}

#[derive(Debug, Clone)]
pub struct OverrideRow {
    pub date: NaiveDate,
    pub prior_date: Option<NaiveDate>,
    pub reason: String,
    pub attempts_allowed: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct StandardMilestone {
    pub pace_order: i64,
    pub unit: i64,
    pub objective: i64,
    pub date: NaiveDate,
}

pub fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|e| anyhow::anyhow!("bad stored date '{}': {}", s, e))
}

/// Exact-match lookup of the term-wide milestone template for a (pace,
/// track). Returns the milestones ordered by pace slot, unit, and type. An
/// empty result is a lookup miss, not an error.
pub fn resolve_milestones(
    conn: &Connection,
    term: &str,
    pace: i64,
    track: &str,
) -> Result<Vec<Milestone>> {
    let mut stmt = conn.prepare(
        "SELECT pace_order, unit, ms_type, ms_date
         FROM milestones
         WHERE term = ? AND pace = ? AND pace_track = ?",
    )?;
    let rows = stmt
        .query_map((term, pace, track), |r| {
            Ok((
                r.get::<_, i64>(0)?,
                r.get::<_, i64>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut out = Vec::with_capacity(rows.len());
    for (pace_order, unit, type_code, date_str) in rows {
        let Some(ms_type) = MilestoneType::from_code(&type_code) else {
            tracing::warn!(type_code, "skipping milestone row with unknown type");
            continue;
        };
        out.push(Milestone {
            key: MilestoneKey {
                pace_order,
                unit,
                ms_type,
            },
            date: parse_date(&date_str)?,
        });
    }
    out.sort_by_key(|m| (m.key.pace_order, m.key.unit, m.key.ms_type.rank()));
    Ok(out)
}

/// The term-wide template date for one milestone key.
pub fn template_date(
    conn: &Connection,
    term: &str,
    pace: i64,
    track: &str,
    key: MilestoneKey,
) -> Result<Option<NaiveDate>> {
    let row: Option<String> = conn
        .query_row(
            "SELECT ms_date FROM milestones
             WHERE term = ? AND pace = ? AND pace_track = ?
               AND pace_order = ? AND unit = ? AND ms_type = ?",
            (term, pace, track, key.pace_order, key.unit, key.ms_type.code()),
            |r| r.get(0),
        )
        .optional()?;
    row.as_deref().map(parse_date).transpose()
}

/// The most recently written override for the exact key, if any. Overrides
/// are append-only; last write wins, with no blending across rows.
pub fn latest_override(
    conn: &Connection,
    term: &str,
    student_id: &str,
    pace: i64,
    track: &str,
    key: MilestoneKey,
) -> Result<Option<OverrideRow>> {
    let row: Option<(String, Option<String>, String, Option<i64>)> = conn
        .query_row(
            "SELECT ms_date, prior_date, reason, attempts_allowed
             FROM milestone_overrides
             WHERE term = ? AND student_id = ? AND pace = ? AND pace_track = ?
               AND pace_order = ? AND unit = ? AND ms_type = ?
             ORDER BY rowid DESC LIMIT 1",
            (
                term,
                student_id,
                pace,
                track,
                key.pace_order,
                key.unit,
                key.ms_type.code(),
            ),
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()?;

    match row {
        None => Ok(None),
        Some((date, prior, reason, attempts_allowed)) => Ok(Some(OverrideRow {
            date: parse_date(&date)?,
            prior_date: prior.as_deref().map(parse_date).transpose()?,
            reason,
            attempts_allowed,
        })),
    }
}

/// The date that actually applies to a student for one milestone key: the
/// latest override when one exists, else the term-wide template date. `None`
/// means the key has no published milestone at all.
pub fn effective_date(
    conn: &Connection,
    term: &str,
    student_id: &str,
    pace: i64,
    track: &str,
    key: MilestoneKey,
) -> Result<Option<NaiveDate>> {
    if let Some(ov) = latest_override(conn, term, student_id, pace, track, key)? {
        return Ok(Some(ov.date));
    }
    template_date(conn, term, pace, track, key)
}

/// Tests whether any override with the given reason code exists for the
/// key. The presence of such a row is what marks an extension pool consumed.
pub fn has_override_with_reason(
    conn: &Connection,
    term: &str,
    student_id: &str,
    pace: i64,
    track: &str,
    key: MilestoneKey,
    reason: &str,
) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM milestone_overrides
         WHERE term = ? AND student_id = ? AND pace = ? AND pace_track = ?
           AND pace_order = ? AND unit = ? AND ms_type = ? AND reason = ?",
        (
            term,
            student_id,
            pace,
            track,
            key.pace_order,
            key.unit,
            key.ms_type.code(),
            reason,
        ),
        |r| r.get(0),
    )?;
    Ok(count > 0)
}

/// Filters a resolved milestone set to the slot one registration occupies.
pub fn milestones_for_course(milestones: &[Milestone], pace_order: i64) -> Vec<Milestone> {
    milestones
        .iter()
        .filter(|m| m.key.pace_order == pace_order)
        .cloned()
        .collect()
}

/// The [earliest, latest] span of the deadline milestones in a set. F1
/// markers are excluded.
pub fn date_range(milestones: &[Milestone]) -> Option<(NaiveDate, NaiveDate)> {
    let mut earliest: Option<NaiveDate> = None;
    let mut latest: Option<NaiveDate> = None;
    for m in milestones {
        if !m.key.ms_type.is_deadline() {
            continue;
        }
        if earliest.map(|e| e > m.date).unwrap_or(true) {
            earliest = Some(m.date);
        }
        if latest.map(|l| l < m.date).unwrap_or(true) {
            latest = Some(m.date);
        }
    }
    earliest.zip(latest)
}

/// Standards-based analog of `resolve_milestones`, restricted to one pace
/// slot and ordered by (unit, objective).
pub fn resolve_standard_milestones(
    conn: &Connection,
    term: &str,
    pace: i64,
    track: &str,
    pace_order: i64,
) -> Result<Vec<StandardMilestone>> {
    let mut stmt = conn.prepare(
        "SELECT unit, objective, ms_date
         FROM standard_milestones
         WHERE term = ? AND pace = ? AND pace_track = ? AND pace_order = ?
         ORDER BY unit, objective",
    )?;
    let rows = stmt
        .query_map((term, pace, track, pace_order), |r| {
            Ok((
                r.get::<_, i64>(0)?,
                r.get::<_, i64>(1)?,
                r.get::<_, String>(2)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut out = Vec::with_capacity(rows.len());
    for (unit, objective, date_str) in rows {
        out.push(StandardMilestone {
            pace_order,
            unit,
            objective,
            date: parse_date(&date_str)?,
        });
    }
    Ok(out)
}

/// Effective mastery due date for one (unit, objective) standard: latest
/// per-student override, else the term-wide standard milestone.
pub fn effective_standard_date(
    conn: &Connection,
    term: &str,
    student_id: &str,
    pace: i64,
    track: &str,
    pace_order: i64,
    unit: i64,
    objective: i64,
) -> Result<Option<NaiveDate>> {
    let ov: Option<String> = conn
        .query_row(
            "SELECT ms_date FROM standard_milestone_overrides
             WHERE term = ? AND student_id = ? AND pace = ? AND pace_track = ?
               AND pace_order = ? AND unit = ? AND objective = ?
             ORDER BY rowid DESC LIMIT 1",
            (term, student_id, pace, track, pace_order, unit, objective),
            |r| r.get(0),
        )
        .optional()?;
    if let Some(date) = ov {
        return Ok(Some(parse_date(&date)?));
    }

    let row: Option<String> = conn
        .query_row(
            "SELECT ms_date FROM standard_milestones
             WHERE term = ? AND pace = ? AND pace_track = ?
               AND pace_order = ? AND unit = ? AND objective = ?",
            (term, pace, track, pace_order, unit, objective),
            |r| r.get(0),
        )
        .optional()?;
    row.as_deref().map(parse_date).transpose()
}

/// The full effective-date grid for one registration slot, `UNIT_COUNT`
/// rows of `OBJECTIVES_PER_UNIT` entries. Unpublished cells are `None`.
pub fn standard_grid(
    conn: &Connection,
    term: &str,
    student_id: &str,
    pace: i64,
    track: &str,
    pace_order: i64,
) -> Result<Vec<Vec<Option<NaiveDate>>>> {
    let mut grid = Vec::with_capacity(UNIT_COUNT);
    for unit in 1..=UNIT_COUNT as i64 {
        let mut row = Vec::with_capacity(OBJECTIVES_PER_UNIT);
        for objective in 1..=OBJECTIVES_PER_UNIT as i64 {
            row.push(effective_standard_date(
                conn, term, student_id, pace, track, pace_order, unit, objective,
            )?);
        }
        grid.push(row);
    }
    Ok(grid)
}
