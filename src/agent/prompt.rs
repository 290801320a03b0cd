//! System prompt assembly
//!
//! Prompts are built from optional sections joined with a horizontal rule.
//! Shared sections (time, memory, disclosure rules) live here; per-deliverable
//! scaffolds live with the generation strategies.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tracing::warn;

use crate::types::{Deliverable, ScoredMemory};

const SECTION_SEPARATOR: &str = "\n\n---\n\n";

const CHAT_BASE: &str = "You are Steward, a personal work assistant. You keep track of what the user \
asked you to remember, read their connected workspace tools, and maintain recurring deliverables \
for them. Investigate with your tools before answering questions about their work.";

/// Rules every run follows when using platform or memory results
pub const DATA_RULES: &str = "## Using data\n\
- Tool results marked as cached come with a staleness_note. When you rely on cached data, say how old it is. Never present it as current.\n\
- If a search or read comes back empty, say plainly that nothing was found. Do not guess or invent content.\n\
- If a platform needs to be reconnected, tell the user exactly which one.";

/// Resolve the user's display timezone, falling back to UTC
pub fn resolve_timezone(preference: Option<&str>) -> Tz {
    match preference.map(str::parse::<Tz>) {
        Some(Ok(tz)) => tz,
        Some(Err(_)) => {
            warn!(timezone = ?preference, "unknown timezone preference, using UTC");
            Tz::UTC
        }
        None => Tz::UTC,
    }
}

/// Current local time line, e.g. "2026-04-06 14:05 Monday (Europe/Lisbon)"
pub fn local_time(now: DateTime<Utc>, tz: Tz) -> String {
    let local = now.with_timezone(&tz);
    format!(
        "{} {} ({})",
        local.format("%Y-%m-%d %H:%M"),
        local.format("%A"),
        tz.name()
    )
}

/// Memories as a bullet list, most relevant first
pub fn render_memories(memories: &[ScoredMemory]) -> Option<String> {
    if memories.is_empty() {
        return None;
    }
    let lines: Vec<String> = memories
        .iter()
        .map(|s| {
            let scope = match s.memory.scope.project_id() {
                Some(project) => format!(" [project {}]", project),
                None => String::new(),
            };
            format!("- {}{}", s.memory.content.trim(), scope)
        })
        .collect();
    Some(format!("## What you remember\n{}", lines.join("\n")))
}

fn render_deliverables(deliverables: &[Deliverable], tz: Tz) -> Option<String> {
    if deliverables.is_empty() {
        return None;
    }
    let lines: Vec<String> = deliverables
        .iter()
        .map(|d| {
            let last = d
                .last_generated_at
                .map(|t| t.with_timezone(&tz).format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_else(|| "never".to_string());
            format!(
                "- {} ({}, {}, id {}), last generated {}",
                d.title, d.deliverable_type, d.state.as_str(), d.id, last
            )
        })
        .collect();
    Some(format!("## Deliverables\n{}", lines.join("\n")))
}

pub fn join_sections(sections: Vec<Option<String>>) -> String {
    sections
        .into_iter()
        .flatten()
        .filter(|s| !s.trim().is_empty())
        .collect::<Vec<_>>()
        .join(SECTION_SEPARATOR)
}

/// Full system prompt for an interactive chat turn
pub fn chat_system_prompt(
    now: DateTime<Utc>,
    tz: Tz,
    memories: &[ScoredMemory],
    deliverables: &[Deliverable],
) -> String {
    join_sections(vec![
        Some(CHAT_BASE.to_string()),
        Some(format!("## Runtime\nTime: {}", local_time(now, tz))),
        Some(DATA_RULES.to_string()),
        render_memories(memories),
        render_deliverables(deliverables, tz),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_local_time_uses_preference() {
        let now = Utc.with_ymd_and_hms(2026, 4, 6, 12, 0, 0).unwrap();
        let tz = resolve_timezone(Some("America/New_York"));
        assert_eq!(local_time(now, tz), "2026-04-06 08:00 Monday (America/New_York)");
    }

    #[test]
    fn test_bad_timezone_falls_back_to_utc() {
        assert_eq!(resolve_timezone(Some("Nowhere/City")), Tz::UTC);
        assert_eq!(resolve_timezone(None), Tz::UTC);
    }

    #[test]
    fn test_chat_prompt_skips_empty_sections() {
        let now = Utc.with_ymd_and_hms(2026, 4, 6, 12, 0, 0).unwrap();
        let prompt = chat_system_prompt(now, Tz::UTC, &[], &[]);
        assert!(prompt.contains("staleness_note"));
        assert!(!prompt.contains("What you remember"));
        assert!(!prompt.contains("## Deliverables"));
        assert_eq!(prompt.matches("---").count(), 2);
    }
}
