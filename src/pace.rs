use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Lifecycle phases a pace-ordered schedule may pass through, in the only
/// order a valid schedule allows. Incompletes from a prior term sort before
/// current-term courses; within each group, completed before open before
/// unopened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SchedulePhase {
    IncCompleted,
    IncOpen,
    IncUnopened,
    Completed,
    Open,
    Unopened,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    pub student_id: String,
    pub course_id: String,
    pub sect: String,
    pub term: String,
    pub pace_order: Option<i64>,
    pub open_status: Option<String>,
    pub completed: bool,
    pub inc_in_progress: bool,
    pub inc_term: Option<String>,
    pub inc_counted: bool,
    pub inc_deadline: Option<NaiveDate>,
}

#[derive(Debug, Clone)]
pub struct PaceTrackRule {
    pub subterm: Option<String>,
    pub pace: i64,
    pub pace_track: String,
    pub criteria: String,
}

/// Result of classifying a student's registrations for the active term.
///
/// `Indeterminate` is a reported state, not an error: every downstream
/// lookup must treat it as "no milestones available", never as pace zero.
#[derive(Debug, Clone)]
pub enum Classification {
    NotRegistered,
    Indeterminate,
    Valid(OrderedRegistrations),
}

#[derive(Debug, Clone)]
pub struct OrderedRegistrations {
    pub regs: Vec<Registration>,
    pub phases: Vec<SchedulePhase>,
}

/// Tests whether a registration counts toward the student's pace. Dropped
/// ("D") and ignored ("G") registrations are excluded, as are incompletes
/// carried from a prior term that the registrar marked not-counted.
pub fn counts_toward_pace(reg: &Registration) -> bool {
    let status = reg.open_status.as_deref();
    if status == Some("D") || status == Some("G") {
        return false;
    }
    !(reg.inc_in_progress && !reg.inc_counted)
}

fn natural_phase(reg: &Registration) -> SchedulePhase {
    let open = reg.open_status.as_deref() == Some("Y");
    let closed = reg.completed || reg.open_status.as_deref() == Some("N");
    if reg.inc_in_progress {
        if closed {
            SchedulePhase::IncCompleted
        } else if open {
            SchedulePhase::IncOpen
        } else {
            SchedulePhase::IncUnopened
        }
    } else if closed {
        SchedulePhase::Completed
    } else if open {
        SchedulePhase::Open
    } else {
        SchedulePhase::Unopened
    }
}

/// Classifies a student's registrations: filters to those counted toward
/// pace, validates that pace orders form a dense 1..N set, sorts into pace
/// order, and verifies the lifecycle phases never move backward along the
/// sequence.
pub fn classify(registrations: Vec<Registration>) -> Classification {
    let mut pace_regs: Vec<Registration> = registrations
        .into_iter()
        .filter(|r| counts_toward_pace(r))
        .collect();

    if pace_regs.is_empty() {
        return Classification::NotRegistered;
    }

    // Every in-pace registration must carry a pace order.
    if pace_regs.iter().any(|r| r.pace_order.is_none()) {
        return Classification::Indeterminate;
    }

    // Each value 1..N must be present; membership scan rather than a sort so
    // duplicates and gaps are both caught by the same check.
    let n = pace_regs.len() as i64;
    for which in 1..=n {
        if !pace_regs.iter().any(|r| r.pace_order == Some(which)) {
            return Classification::Indeterminate;
        }
    }

    // Selection-swap into pace order.
    for i in 0..pace_regs.len() {
        let want = i as i64 + 1;
        if pace_regs[i].pace_order == Some(want) {
            continue;
        }
        for j in (i + 1)..pace_regs.len() {
            if pace_regs[j].pace_order == Some(want) {
                pace_regs.swap(i, j);
                break;
            }
        }
    }

    // Phases may only advance along the ordering.
    let mut phases = Vec::with_capacity(pace_regs.len());
    let mut current = SchedulePhase::IncCompleted;
    for reg in &pace_regs {
        let phase = natural_phase(reg);
        if phase < current {
            return Classification::Indeterminate;
        }
        current = phase;
        phases.push(phase);
    }

    Classification::Valid(OrderedRegistrations {
        regs: pace_regs,
        phases,
    })
}

/// The pace is simply the number of registrations counted toward it.
pub fn determine_pace(registrations: &[Registration]) -> i64 {
    registrations.iter().filter(|r| counts_toward_pace(r)).count() as i64
}

/// Matches the ordered in-pace registrations against the published rule
/// table. A rule matches when its pace equals the computed pace, its subterm
/// (when set) equals some registered section, and every course listed in its
/// criteria appears among the in-pace courses. First published match wins.
///
/// "A" is the documented fallback when no rule matches, not a silent guess:
/// terms that publish no rules get a single schedule.
pub fn determine_pace_track(rules: &[PaceTrackRule], ordered: &[Registration], pace: i64) -> String {
    for rule in rules {
        if rule.pace != pace {
            continue;
        }
        if let Some(subterm) = rule.subterm.as_deref() {
            if !ordered.iter().any(|r| r.sect == subterm) {
                continue;
            }
        }
        if criteria_matches(&rule.criteria, ordered) {
            return rule.pace_track.clone();
        }
    }
    tracing::debug!(pace, "no pace-track rule matched; falling back to track A");
    "A".to_string()
}

fn criteria_matches(criteria: &str, ordered: &[Registration]) -> bool {
    criteria
        .split(',')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .all(|course| ordered.iter().any(|r| r.course_id == course))
}
