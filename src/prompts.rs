//! Instructions for the Observer and Reflector passes

use crate::types::{Message, Observation};
use std::fmt::Write;

/// Default extraction instructions for the Observer
pub const OBSERVER_INSTRUCTIONS: &str = r#"You are the Observer, a background memory agent. Compress the raw conversation messages you are given into dense, structured observations.

Rules:
1. Keep only what is needed to continue the conversation coherently in a later session.
2. Tag every observation with a priority marker:
   🔴 decisions, deadlines, requirements, names and key facts that must survive
   🟡 preferences, considerations, open questions
   🟢 minor details
3. When the conversation names a date, record it as (referenced: YYYY-MM-DD, meaning "relative phrase").
4. Compress aggressively. Drop pleasantries, filler, repetition and failed attempts.
5. Record changes explicitly: "User switched from X to Y" beats "User uses Y".
6. For technical work keep technology choices, architecture decisions, file paths and what finally worked.

Output only observations, in exactly this format:

Date: YYYY-MM-DD
- 🔴 HH:MM Observation text
- 🟡 HH:MM Observation text (referenced: YYYY-MM-DD, meaning "next Friday")
- 🟢 HH:MM Observation text

Finish with two lines:
CURRENT_TASK: one line describing what the user is working on now
SUGGESTED_NEXT: what the assistant should do when the conversation resumes"#;

/// Default merge/prune policy for the Reflector
pub const REFLECTOR_INSTRUCTIONS: &str = r#"You are the Reflector, a background memory maintenance agent. The observation log below has grown too large. Rewrite it into a smaller log that is equivalent for every future turn.

Rules:
1. Merge observations about the same topic into a single current-state observation.
2. Remove observations that are superseded or contradicted by newer ones, duplicated, or no longer relevant to any active topic.
3. Keep every 🔴 observation unless a newer observation explicitly supersedes it.
4. Re-tag priorities when the situation changed (a 🟡 option that was decided becomes a 🔴 decision).
5. Keep chronological order. Never invent facts.
6. Aim for a 40-60% reduction.

Output the complete revised log, and nothing else, in the same format:

Date: YYYY-MM-DD
- 🔴 HH:MM Observation text
...
CURRENT_TASK: updated if needed
SUGGESTED_NEXT: updated if needed"#;

/// Render observations the way both passes read them back
pub fn render_observation_lines(observations: &[Observation]) -> String {
    let mut out = String::new();
    for obs in observations {
        let _ = writeln!(
            out,
            "{} [{}] {}",
            obs.priority,
            obs.created_at.format("%Y-%m-%d %H:%M"),
            obs.text
        );
    }
    out
}

/// User payload for an Observer pass
pub fn observer_payload(existing: &[Observation], messages: &[Message]) -> String {
    let mut out = String::from("Previous Observations:\n");
    if existing.is_empty() {
        out.push_str("No previous context.\n");
    } else {
        out.push_str(&render_observation_lines(existing));
    }

    out.push_str("\nRecent Messages to Compress:\n");
    for msg in messages {
        let _ = writeln!(
            out,
            "{} {}: {}",
            msg.timestamp.format("%Y-%m-%d %H:%M"),
            msg.role,
            msg.content
        );
    }
    out
}

/// User payload for a Reflector pass
pub fn reflector_payload(observations: &[Observation]) -> String {
    format!("Current Observations:\n{}", render_observation_lines(observations))
}
