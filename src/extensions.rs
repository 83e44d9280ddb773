use anyhow::Result;
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use uuid::Uuid;

use crate::milestones::{self, MilestoneKey};

/// The two independent extension pools. Each pool may be consumed at most
/// once per (student, milestone key); the override row's reason code is the
/// consumption marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtensionPool {
    Accommodation,
    Free,
}

impl ExtensionPool {
    pub fn reason(self) -> &'static str {
        match self {
            ExtensionPool::Accommodation => "ACC",
            ExtensionPool::Free => "FREE",
        }
    }

    pub fn from_code(code: &str) -> Option<ExtensionPool> {
        match code {
            "ACC" => Some(ExtensionPool::Accommodation),
            "FREE" => Some(ExtensionPool::Free),
            _ => None,
        }
    }
}

/// Requested vs. granted day counts. Both amounts travel together so a
/// capped grant can report what was asked for alongside what fit before
/// the end of the term.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtensionGrant {
    pub requested_days: i64,
    pub granted_days: i64,
}

impl ExtensionGrant {
    pub fn capped(self) -> bool {
        self.granted_days < self.requested_days
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IneligibleReason {
    NoTerm,
    NoMilestone,
    NoAccommodation,
}

impl IneligibleReason {
    pub fn code(self) -> &'static str {
        match self {
            IneligibleReason::NoTerm => "no_term",
            IneligibleReason::NoMilestone => "no_milestone",
            IneligibleReason::NoAccommodation => "no_accommodation",
        }
    }
}

/// Tri-state availability of one pool for one milestone key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtensionAvailability {
    AlreadyApplied,
    Ineligible(IneligibleReason),
    Available(ExtensionGrant),
}

#[derive(Debug, Clone)]
pub enum ApplyOutcome {
    Applied {
        grant: ExtensionGrant,
        prior_date: NaiveDate,
        new_date: NaiveDate,
    },
    AlreadyApplied,
    NotApplied(IneligibleReason),
    /// The grant capped to zero days (effective date already at or past
    /// term end); nothing was written.
    NothingToGrant,
}

struct TermRow {
    end_date: NaiveDate,
    free_extension_days: i64,
}

fn term_row(conn: &Connection, term: &str) -> Result<Option<TermRow>> {
    let row: Option<(String, i64)> = conn
        .query_row(
            "SELECT end_date, free_extension_days FROM terms WHERE term = ?",
            [term],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    match row {
        None => Ok(None),
        Some((end, free_days)) => Ok(Some(TermRow {
            end_date: milestones::parse_date(&end)?,
            free_extension_days: free_days,
        })),
    }
}

fn accommodation_days(conn: &Connection, student_id: &str, as_of: NaiveDate) -> Result<Option<i64>> {
    let row: Option<(i64, Option<String>, Option<String>)> = conn
        .query_row(
            "SELECT extension_days, start_date, end_date
             FROM accommodations WHERE student_id = ?",
            [student_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()?;

    let Some((days, start, end)) = row else {
        return Ok(None);
    };
    if let Some(start) = start {
        if milestones::parse_date(&start)? > as_of {
            return Ok(None);
        }
    }
    if let Some(end) = end {
        if milestones::parse_date(&end)? < as_of {
            return Ok(None);
        }
    }
    Ok(Some(days))
}

/// Evaluates one pool for one milestone key.
///
/// The grant is capped at the calendar days remaining between the current
/// effective date and the end of the term, so a student with more
/// accommodation days than term left sees both numbers.
pub fn days_available(
    conn: &Connection,
    term: &str,
    student_id: &str,
    track: &str,
    pace: i64,
    key: MilestoneKey,
    pool: ExtensionPool,
    today: NaiveDate,
) -> Result<ExtensionAvailability> {
    let Some(term_info) = term_row(conn, term)? else {
        return Ok(ExtensionAvailability::Ineligible(IneligibleReason::NoTerm));
    };

    let Some(baseline) = milestones::template_date(conn, term, pace, track, key)? else {
        return Ok(ExtensionAvailability::Ineligible(
            IneligibleReason::NoMilestone,
        ));
    };

    if milestones::has_override_with_reason(
        conn,
        term,
        student_id,
        pace,
        track,
        key,
        pool.reason(),
    )? {
        return Ok(ExtensionAvailability::AlreadyApplied);
    }

    let requested = match pool {
        ExtensionPool::Free => term_info.free_extension_days,
        ExtensionPool::Accommodation => {
            match accommodation_days(conn, student_id, today)? {
                Some(days) if days > 0 => days,
                _ => {
                    return Ok(ExtensionAvailability::Ineligible(
                        IneligibleReason::NoAccommodation,
                    ))
                }
            }
        }
    };

    // Extensions stack on the current effective date, which may already
    // reflect the other pool's override.
    let effective = milestones::effective_date(conn, term, student_id, pace, track, key)?
        .unwrap_or(baseline);

    let days_to_term_end = (term_info.end_date - effective).num_days().max(0);
    let granted = requested.min(days_to_term_end);

    Ok(ExtensionAvailability::Available(ExtensionGrant {
        requested_days: requested,
        granted_days: granted,
    }))
}

/// Applies an available extension by appending an override row moving the
/// effective date forward by the granted days. The availability re-check and
/// the write share one transaction, so a repeated apply in the same session
/// observes the reason code and reports `AlreadyApplied`. Two concurrent
/// daemons could still both read "available" in the gap; that narrow
/// double-grant window is inherited from the original design and left open.
pub fn apply_extension(
    conn: &Connection,
    term: &str,
    student_id: &str,
    track: &str,
    pace: i64,
    key: MilestoneKey,
    pool: ExtensionPool,
    today: NaiveDate,
) -> Result<ApplyOutcome> {
    let tx = conn.unchecked_transaction()?;

    let availability =
        days_available(&tx, term, student_id, track, pace, key, pool, today)?;

    let grant = match availability {
        ExtensionAvailability::AlreadyApplied => {
            return Ok(ApplyOutcome::AlreadyApplied);
        }
        ExtensionAvailability::Ineligible(reason) => {
            return Ok(ApplyOutcome::NotApplied(reason));
        }
        ExtensionAvailability::Available(grant) => grant,
    };
    if grant.granted_days <= 0 {
        return Ok(ApplyOutcome::NothingToGrant);
    }

    let prior = milestones::effective_date(&tx, term, student_id, pace, track, key)?
        .ok_or_else(|| anyhow::anyhow!("milestone vanished while applying extension"))?;
    let new_date = prior + chrono::Duration::days(grant.granted_days);

    tx.execute(
        "INSERT INTO milestone_overrides(
             id, term, student_id, pace, pace_track, pace_order, unit, ms_type,
             ms_date, prior_date, reason, attempts_allowed, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, ?)",
        (
            Uuid::new_v4().to_string(),
            term,
            student_id,
            pace,
            track,
            key.pace_order,
            key.unit,
            key.ms_type.code(),
            new_date.format("%Y-%m-%d").to_string(),
            prior.format("%Y-%m-%d").to_string(),
            pool.reason(),
            chrono::Utc::now().to_rfc3339(),
        ),
    )?;
    tx.commit()?;

    Ok(ApplyOutcome::Applied {
        grant,
        prior_date: prior,
        new_date,
    })
}
