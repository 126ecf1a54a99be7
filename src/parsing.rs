//! Turns Observer/Reflector responses into observation entries
//!
//! Accepted line shapes:
//!
//! ```text
//! Date: 2026-02-23
//! - 🔴 10:15 Decided on PostgreSQL (referenced: 2026-02-23, meaning "today")
//! 🟡 [2026-02-23 10:30] Considering React Native Paper
//! CURRENT_TASK: Wiring up Clerk auth
//! SUGGESTED_NEXT: Configure protected routes
//! ```
//!
//! Anything else is ignored. A response that yields no entries is unusable.

use crate::types::{Observation, Priority, Sequence};
use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};

pub const CURRENT_TASK_PREFIX: &str = "CURRENT TASK:";
pub const SUGGESTED_NEXT_PREFIX: &str = "SUGGESTED NEXT:";

/// Parse a provider response into entries covering messages through `covers_through`
pub fn parse_observations(
    response: &str,
    thread_id: &str,
    covers_through: Sequence,
    now: DateTime<Utc>,
) -> Vec<Observation> {
    let mut observations = Vec::new();
    let mut current_date = now.date_naive();
    let mut current_task = None;
    let mut suggested_next = None;

    for raw in response.lines() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(rest) = line.strip_prefix("Date:") {
            if let Ok(date) = NaiveDate::parse_from_str(rest.trim(), "%Y-%m-%d") {
                current_date = date;
            }
            continue;
        }

        if let Some(rest) = strip_any(line, &["CURRENT_TASK:", CURRENT_TASK_PREFIX]) {
            if !rest.is_empty() {
                current_task = Some(rest.to_string());
            }
            continue;
        }

        if let Some(rest) = strip_any(line, &["SUGGESTED_NEXT:", SUGGESTED_NEXT_PREFIX]) {
            if !rest.is_empty() {
                suggested_next = Some(rest.to_string());
            }
            continue;
        }

        if let Some(obs) = parse_entry_line(line, thread_id, covers_through, current_date, now) {
            observations.push(obs);
        }
    }

    if let Some(task) = current_task {
        observations.push(
            Observation::new(thread_id, format!("{CURRENT_TASK_PREFIX} {task}"), covers_through)
                .with_priority(Priority::Critical)
                .with_created_at(now),
        );
    }
    if let Some(next) = suggested_next {
        observations.push(
            Observation::new(thread_id, format!("{SUGGESTED_NEXT_PREFIX} {next}"), covers_through)
                .with_priority(Priority::Important)
                .with_created_at(now),
        );
    }

    observations
}

fn strip_any<'a>(line: &'a str, prefixes: &[&str]) -> Option<&'a str> {
    prefixes
        .iter()
        .find_map(|p| line.strip_prefix(p))
        .map(str::trim)
}

fn parse_entry_line(
    line: &str,
    thread_id: &str,
    covers_through: Sequence,
    current_date: NaiveDate,
    now: DateTime<Utc>,
) -> Option<Observation> {
    let (bulleted, body) = match line.strip_prefix("- ").or_else(|| line.strip_prefix("* ")) {
        Some(rest) => (true, rest.trim_start()),
        None => (false, line),
    };

    let (priority, body) = match Priority::ALL
        .iter()
        .find_map(|p| body.strip_prefix(p.marker()).map(|rest| (*p, rest.trim_start())))
    {
        Some(found) => found,
        // Unmarked prose is only an entry when it is a bullet
        None if bulleted => (Priority::Info, body),
        None => return None,
    };

    let (date, time, body) = split_timestamp(body, current_date);
    let time = time.unwrap_or_else(|| now.time());
    let (text, referenced, relative) = split_reference(body);
    if text.is_empty() {
        return None;
    }

    let created_at = Utc.from_utc_datetime(&date.and_time(time));
    let mut obs = Observation::new(thread_id, text, covers_through)
        .with_priority(priority)
        .with_created_at(created_at);
    obs.referenced_date = referenced;
    obs.relative_date = relative;
    Some(obs)
}

/// Leading `HH:MM` or `[YYYY-MM-DD HH:MM]`
fn split_timestamp(body: &str, current_date: NaiveDate) -> (NaiveDate, Option<NaiveTime>, &str) {
    if let Some(rest) = body.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            let inner = rest[..end].trim();
            let after = rest[end + 1..].trim_start();
            let mut parts = inner.split_whitespace();
            let date = parts
                .next()
                .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok());
            let time = parts
                .next()
                .and_then(|t| NaiveTime::parse_from_str(t, "%H:%M").ok());
            if let Some(date) = date {
                return (date, time, after);
            }
        }
        return (current_date, None, body);
    }

    let mut split = body.splitn(2, char::is_whitespace);
    let first = split.next().unwrap_or_default();
    match NaiveTime::parse_from_str(first, "%H:%M") {
        Ok(time) => (current_date, Some(time), split.next().unwrap_or_default().trim_start()),
        Err(_) => (current_date, None, body),
    }
}

/// Trailing `(referenced: YYYY-MM-DD, meaning "...")`
fn split_reference(body: &str) -> (String, Option<NaiveDate>, Option<String>) {
    let trimmed = body.trim();
    let Some(open) = trimmed.rfind('(') else {
        return (trimmed.to_string(), None, None);
    };
    let inner_end = trimmed[open..].find(')').map(|i| open + i);
    let Some(close) = inner_end else {
        return (trimmed.to_string(), None, None);
    };
    let inner = &trimmed[open + 1..close];
    if !inner.contains("referenced") && !inner.contains("meaning") {
        return (trimmed.to_string(), None, None);
    }

    let mut referenced = None;
    let mut relative = None;
    for part in inner.split(',') {
        let part = part.trim();
        if let Some(date) = part.strip_prefix("referenced:") {
            referenced = NaiveDate::parse_from_str(date.trim(), "%Y-%m-%d").ok();
        } else if let Some(meaning) = part.strip_prefix("meaning") {
            let meaning = meaning.trim().trim_matches('"').trim();
            if !meaning.is_empty() {
                relative = Some(meaning.to_string());
            }
        }
    }

    let mut text = String::from(trimmed[..open].trim_end());
    let tail = trimmed[close + 1..].trim();
    if !tail.is_empty() {
        text.push(' ');
        text.push_str(tail);
    }
    (text, referenced, relative)
}
