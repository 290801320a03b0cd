//! Generation strategies
//!
//! One per deliverable type: a prompt scaffold describing the expected shape
//! of the output, and the seed context handed to the headless run.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;

use crate::agent::prompt::{join_sections, local_time, render_memories, DATA_RULES};
use crate::agent::ChatMessage;
use crate::types::*;

/// Characters of a single snapshot included in the seed context
const SNAPSHOT_EXCERPT_CHARS: usize = 2_000;
/// Characters of the previous version included in the seed context
const PREVIOUS_VERSION_CHARS: usize = 4_000;

const HEADLESS_BASE: &str = "You are Steward, generating a recurring deliverable in the background. \
No one is watching this run: you cannot ask questions or take actions, only investigate with the \
read-only tools and then write the deliverable. Your final message is the deliverable itself, in \
Markdown, with no preamble.";

/// Context assembled before the run
#[derive(Debug, Clone, Default)]
pub struct SeedContext {
    pub memories: Vec<ScoredMemory>,
    pub snapshots: Vec<SyncSnapshot>,
    pub previous: Option<DeliverableVersion>,
}

#[derive(Debug, Clone, Copy)]
pub struct Strategy {
    pub deliverable_type: DeliverableType,
    scaffold: &'static str,
    /// Whether the last version is part of the seed context
    pub include_previous: bool,
}

pub fn strategy_for(deliverable_type: DeliverableType) -> Strategy {
    let (scaffold, include_previous) = match deliverable_type {
        DeliverableType::StatusReport => (
            "## Format: status report\n\
             Sections: **Done**, **In progress**, **Blocked**, **Next**. One line per item, naming \
             the owner when the source does. Compare against the previous version and call out \
             what changed since then; do not repeat unchanged items in Done.",
            true,
        ),
        DeliverableType::Digest => (
            "## Format: digest\n\
             Group items by theme, most important first. Each bullet is one sentence followed by \
             the platform and resource it came from. Leave out chatter and automated \
             notifications. End with anything that needs the user's reply.",
            true,
        ),
        DeliverableType::MeetingPrep => (
            "## Format: meeting preparation\n\
             Start with the meeting title and time. For each external participant: who they are, \
             recent threads with them and any open commitments. Then a suggested agenda and the \
             questions worth asking. Search other platforms for each participant before writing.",
            false,
        ),
        DeliverableType::ResearchBrief => (
            "## Format: research brief\n\
             A three-sentence summary, then key findings with their sources, then open questions \
             and what would resolve them.",
            true,
        ),
        DeliverableType::Custom => (
            "## Format\n\
             Follow the user's instructions for structure and tone. When they are silent on \
             something, keep it short and cite sources.",
            true,
        ),
    };
    Strategy {
        deliverable_type,
        scaffold,
        include_previous,
    }
}

impl Strategy {
    pub fn system_prompt(&self, deliverable: &Deliverable, now: DateTime<Utc>, tz: Tz) -> String {
        let instructions = deliverable
            .instructions
            .as_deref()
            .filter(|i| !i.trim().is_empty())
            .map(|i| format!("## Instructions from the user\n{}", i.trim()));

        join_sections(vec![
            Some(HEADLESS_BASE.to_string()),
            Some(format!(
                "## Deliverable\nTitle: {}\nType: {}\nSources: {}\nTime: {}",
                deliverable.title,
                deliverable.deliverable_type,
                describe_sources(&deliverable.sources),
                local_time(now, tz)
            )),
            Some(self.scaffold.to_string()),
            instructions,
            Some(DATA_RULES.to_string()),
        ])
    }

    /// First user message of the run: seed context plus optional triage guidance
    pub fn seed_message(
        &self,
        context: &SeedContext,
        guidance: Option<&str>,
        now: DateTime<Utc>,
    ) -> ChatMessage {
        let snapshots = if context.snapshots.is_empty() {
            Some("## Synced content\nNothing has been synced from the sources yet. Use the tools to read them.".to_string())
        } else {
            let blocks: Vec<String> = context
                .snapshots
                .iter()
                .map(|s| {
                    format!(
                        "### {} / {} (synced {} min ago)\n{}",
                        s.platform.display_name(),
                        s.resource_id,
                        (now - s.synced_at).num_minutes().max(0),
                        excerpt(&s.content, SNAPSHOT_EXCERPT_CHARS)
                    )
                })
                .collect();
            Some(format!("## Synced content\n{}", blocks.join("\n\n")))
        };

        let previous = context
            .previous
            .as_ref()
            .filter(|_| self.include_previous)
            .map(|v| {
                format!(
                    "## Previous version (#{}, {})\n{}",
                    v.version,
                    v.created_at.format("%Y-%m-%d %H:%M UTC"),
                    excerpt(&v.content, PREVIOUS_VERSION_CHARS)
                )
            });

        let guidance = guidance.map(|g| format!("## Why this run was started\n{}", g));

        ChatMessage::user(join_sections(vec![
            guidance,
            render_memories(&context.memories),
            snapshots,
            previous,
            Some("Write the deliverable now.".to_string()),
        ]))
    }
}

fn describe_sources(sources: &[SourceRef]) -> String {
    if sources.is_empty() {
        return "none".to_string();
    }
    sources
        .iter()
        .map(|s| match &s.resource_id {
            Some(r) => format!("{} {}", s.platform.display_name(), r),
            None => format!("all of {}", s.platform.display_name()),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn excerpt(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}…", &text[..idx]),
        None => text.to_string(),
    }
}
