use chrono::{Datelike, NaiveDate, Weekday};
use serde::Serialize;
use std::collections::HashSet;

use crate::milestones::{date_range, Milestone, MilestoneType};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarDay {
    pub date: String,
    /// Days outside the course's milestone span are filler, not errors.
    pub in_range: bool,
    pub weekend: bool,
    pub holiday: bool,
    pub tasks: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarWeek {
    pub days: Vec<CalendarDay>,
}

fn task_label(milestone: &Milestone) -> Option<String> {
    let unit = milestone.key.unit;
    match milestone.key.ms_type {
        MilestoneType::UsersExam => Some("User's Exam".to_string()),
        MilestoneType::SkillsReview => Some("Skills Review".to_string()),
        MilestoneType::Homework1 => Some(format!("Objective {}.1", unit)),
        MilestoneType::Homework2 => Some(format!("Objective {}.2", unit)),
        MilestoneType::Homework3 => Some(format!("Objective {}.3", unit)),
        MilestoneType::Homework4 => Some(format!("Objective {}.4", unit)),
        MilestoneType::Homework5 => Some(format!("Objective {}.5", unit)),
        MilestoneType::UnitReview => Some(format!("Unit {} Review", unit)),
        MilestoneType::UnitExam => Some(format!("Unit {} Exam", unit)),
        MilestoneType::FinalExam => Some("Final Exam".to_string()),
        MilestoneType::FinalPlusOne => None,
    }
}

/// Lays one course's milestones onto a Sunday-through-Saturday week grid.
/// The milestone span expands outward to whole weeks; weekends and
/// out-of-span days carry no tasks.
pub fn course_calendar(
    milestones: &[Milestone],
    holidays: &HashSet<NaiveDate>,
) -> Vec<CalendarWeek> {
    let Some((earliest, latest)) = date_range(milestones) else {
        return Vec::new();
    };

    let mut first_day = earliest;
    while first_day.weekday() != Weekday::Sun {
        first_day -= chrono::Duration::days(1);
    }
    let mut last_day = latest;
    while last_day.weekday() != Weekday::Sat {
        last_day += chrono::Duration::days(1);
    }

    let mut weeks = Vec::new();
    let mut current = first_day;
    while current <= last_day {
        let mut days = Vec::with_capacity(7);
        for _ in 0..7 {
            let weekend =
                current.weekday() == Weekday::Sun || current.weekday() == Weekday::Sat;
            let in_range = current >= earliest && current <= latest;
            let holiday = !weekend && holidays.contains(&current);

            let tasks = if in_range && !weekend && !holiday {
                milestones
                    .iter()
                    .filter(|m| m.key.ms_type.is_deadline() && m.date == current)
                    .filter_map(task_label)
                    .collect()
            } else {
                Vec::new()
            };

            days.push(CalendarDay {
                date: current.format("%Y-%m-%d").to_string(),
                in_range,
                weekend,
                holiday,
                tasks,
            });
            current += chrono::Duration::days(1);
        }
        weeks.push(CalendarWeek { days });
    }
    weeks
}
