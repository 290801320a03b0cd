//! Deterministic triage rules
//!
//! Pure functions over already-loaded rows so each rule can be tested
//! without a database.

use chrono::{DateTime, Duration, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::types::*;

static EMAIL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)[a-z0-9._%+\-]+@([a-z0-9.\-]+\.[a-z]{2,})").unwrap()
});

/// Freshness-trigger rule.
///
/// Fires when content newer than the last generation exists and the minimum
/// inter-generation interval has elapsed. Never-generated deliverables fire on
/// any content.
pub fn freshness_trigger(
    deliverable: &Deliverable,
    latest_changed_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    default_min_interval_minutes: i64,
) -> Option<String> {
    if deliverable.state != DeliverableState::Active {
        return None;
    }
    let latest = latest_changed_at?;

    match deliverable.last_generated_at {
        None => Some(format!(
            "'{}' has never been generated and source content changed at {} is available",
            deliverable.title,
            latest.format("%Y-%m-%d %H:%M UTC")
        )),
        Some(last) => {
            if latest <= last {
                return None;
            }
            let min_interval = deliverable.schedule.min_interval(default_min_interval_minutes);
            if now - last < min_interval {
                return None;
            }
            Some(format!(
                "'{}' sources changed at {} after the last generation at {}; investigate what is new since then",
                deliverable.title,
                latest.format("%Y-%m-%d %H:%M UTC"),
                last.format("%Y-%m-%d %H:%M UTC")
            ))
        }
    }
}

/// A person on a calendar event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attendee {
    pub name: Option<String>,
    pub email: String,
}

impl Attendee {
    pub fn domain(&self) -> &str {
        self.email.rsplit_once('@').map(|(_, d)| d).unwrap_or("")
    }

    /// Terms used to find this person in other sources
    fn search_terms(&self) -> Vec<String> {
        let mut terms = vec![self.email.clone()];
        if let Some(name) = &self.name {
            if name.trim().len() > 2 {
                terms.push(name.trim().to_string());
            }
        }
        terms
    }
}

/// Attendees from event metadata: strings ("Dana <dana@x.io>") or objects ({"email", "name"})
pub fn parse_attendees(metadata: &serde_json::Value) -> Vec<Attendee> {
    let Some(list) = metadata.get("attendees").and_then(|v| v.as_array()) else {
        return Vec::new();
    };

    list.iter()
        .filter_map(|entry| match entry {
            serde_json::Value::String(raw) => {
                let email = EMAIL.find(raw)?.as_str().to_lowercase();
                let name = raw
                    .split('<')
                    .next()
                    .map(|n| n.trim().trim_matches('"').to_string())
                    .filter(|n| !n.is_empty() && !n.contains('@'));
                Some(Attendee { name, email })
            }
            serde_json::Value::Object(obj) => {
                let email = obj.get("email")?.as_str()?.trim().to_lowercase();
                if !EMAIL.is_match(&email) {
                    return None;
                }
                let name = obj
                    .get("name")
                    .and_then(|n| n.as_str())
                    .map(|n| n.trim().to_string())
                    .filter(|n| !n.is_empty());
                Some(Attendee { name, email })
            }
            _ => None,
        })
        .collect()
}

/// Attendees outside the user's organization (and not the user)
pub fn external_attendees(
    attendees: &[Attendee],
    internal_domains: &[String],
    user_email: Option<&str>,
) -> Vec<Attendee> {
    attendees
        .iter()
        .filter(|a| {
            let domain = a.domain().to_lowercase();
            let internal = internal_domains
                .iter()
                .any(|d| domain == *d || domain.ends_with(&format!(".{}", d)));
            let is_user = user_email.map_or(false, |e| e.eq_ignore_ascii_case(&a.email));
            !internal && !is_user
        })
        .cloned()
        .collect()
}

/// Snapshots that mention any of the participants
pub fn related_snapshots<'a>(
    participants: &[Attendee],
    candidates: &'a [SyncSnapshot],
) -> Vec<&'a SyncSnapshot> {
    let patterns: Vec<Regex> = participants
        .iter()
        .flat_map(|p| p.search_terms())
        .filter_map(|term| Regex::new(&format!(r"(?i)\b{}\b", regex::escape(&term))).ok())
        .collect();
    if patterns.is_empty() {
        return Vec::new();
    }

    candidates
        .iter()
        .filter(|snapshot| {
            let metadata = snapshot.metadata.to_string();
            patterns
                .iter()
                .any(|re| re.is_match(&snapshot.content) || re.is_match(&metadata))
        })
        .collect()
}

/// Meeting-preparation emergent rule for one upcoming event.
///
/// The caller has already checked that no deliverable covers the event.
pub fn meeting_prep_candidate(
    event: &SyncSnapshot,
    starts_at: DateTime<Utc>,
    internal_domains: &[String],
    user_email: Option<&str>,
    min_external_participants: usize,
    other_sources: &[SyncSnapshot],
) -> Option<(EmergentCandidate, String)> {
    let attendees = parse_attendees(&event.metadata);
    let external = external_attendees(&attendees, internal_domains, user_email);
    if external.len() < min_external_participants {
        return None;
    }

    let related = related_snapshots(&external, other_sources);
    if related.is_empty() {
        return None;
    }

    let title = event
        .metadata
        .get("title")
        .and_then(|t| t.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| event.content.lines().next().unwrap_or("meeting").to_string());

    let mut related_refs: Vec<SourceRef> = related
        .iter()
        .map(|s| SourceRef::resource(s.platform, s.resource_id.clone()))
        .collect();
    related_refs.dedup();

    let names: Vec<String> = external
        .iter()
        .map(|a| a.name.clone().unwrap_or_else(|| a.email.clone()))
        .collect();
    let reasoning = format!(
        "Upcoming meeting '{}' at {} with {} external participants ({}); {} related item(s) found on other platforms mention them. Prepare background on each participant and open threads.",
        title,
        starts_at.format("%Y-%m-%d %H:%M UTC"),
        external.len(),
        names.join(", "),
        related_refs.len()
    );

    Some((
        EmergentCandidate {
            deliverable_type: DeliverableType::MeetingPrep,
            title: format!("Prep: {}", title),
            anchor: SourceRef::resource(Platform::Calendar, event.resource_id.clone()),
            starts_at: Some(starts_at),
            participants: external.into_iter().map(|a| a.email).collect(),
            related: related_refs,
        },
        reasoning,
    ))
}

/// Lookahead window end
pub fn lookahead_end(now: DateTime<Utc>, hours: i64) -> DateTime<Utc> {
    now + Duration::hours(hours.max(0))
}
