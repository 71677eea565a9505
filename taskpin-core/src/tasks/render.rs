//! Canonical dashboard text.
//!
//! Rendering is a pure function of the classified tasks and the locale: no
//! clock reads, no sorting. Equal input yields byte-identical text, which is
//! what lets the dashboard skip no-op edits.

use super::Task;
use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};

/// Language of the dashboard text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Locale {
    #[default]
    En,
    De,
}

impl std::fmt::Display for Locale {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Locale::En => write!(f, "en"),
            Locale::De => write!(f, "de"),
        }
    }
}

impl std::str::FromStr for Locale {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "en" => Ok(Locale::En),
            "de" => Ok(Locale::De),
            other => Err(format!("unknown locale '{other}', expected en or de")),
        }
    }
}

const GERMAN_MONTHS: [&str; 12] = [
    "Januar",
    "Februar",
    "März",
    "April",
    "Mai",
    "Juni",
    "Juli",
    "August",
    "September",
    "Oktober",
    "November",
    "Dezember",
];

impl Locale {
    /// First line of every dashboard. Used to recognise an existing one.
    pub fn header(self) -> &'static str {
        match self {
            Locale::En => "### Tasks Overview",
            Locale::De => "### Aufgabenübersicht",
        }
    }

    fn pending_heading(self) -> &'static str {
        match self {
            Locale::En => "**Pending Tasks:**",
            Locale::De => "**Ausstehende Aufgaben:**",
        }
    }

    fn passed_heading(self) -> &'static str {
        match self {
            Locale::En => "**Passed Tasks:**",
            Locale::De => "**Vergangene Aufgaben:**",
        }
    }

    fn no_pending(self) -> &'static str {
        match self {
            Locale::En => "No pending tasks.",
            Locale::De => "Keine ausstehenden Aufgaben.",
        }
    }

    fn no_passed(self) -> &'static str {
        match self {
            Locale::En => "No passed tasks.",
            Locale::De => "Keine vergangenen Aufgaben.",
        }
    }

    fn due_label(self) -> &'static str {
        match self {
            Locale::En => "Due",
            Locale::De => "Fällig",
        }
    }

    fn was_due_label(self) -> &'static str {
        match self {
            Locale::En => "Was due",
            Locale::De => "War fällig",
        }
    }

    /// Format a due date. Depends only on `due`.
    pub fn format_due(self, due: Option<DateTime<Utc>>) -> String {
        match (self, due) {
            (Locale::En, Some(d)) => d.format("%Y-%m-%d").to_string(),
            (Locale::De, Some(d)) => {
                format!("{}. {}", d.day(), GERMAN_MONTHS[d.month0() as usize])
            }
            (Locale::En, None) => "No due date".to_string(),
            (Locale::De, None) => "Kein Fälligkeitsdatum".to_string(),
        }
    }
}

/// Rendered dashboard. Equality compares the text only.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub pending_lines: Vec<String>,
    pub passed_lines: Vec<String>,
    pub rendered_at: DateTime<Utc>,
    text: String,
}

impl PartialEq for Snapshot {
    fn eq(&self, other: &Self) -> bool {
        self.text == other.text
    }
}

impl Eq for Snapshot {}

impl Snapshot {
    pub fn text(&self) -> &str {
        &self.text
    }

    /// The text cut to at most `limit` characters, ending in an ellipsis line
    /// when anything was dropped. Cuts happen on line boundaries.
    pub fn text_within(&self, limit: usize) -> String {
        truncate_lines(&self.text, limit)
    }
}

/// Render the pending and passed buckets. `rendered_at` is carried along
/// for logging and never appears in the text.
pub fn render(
    pending: &[Task],
    passed: &[Task],
    locale: Locale,
    rendered_at: DateTime<Utc>,
) -> Snapshot {
    let pending_lines: Vec<String> = pending
        .iter()
        .map(|t| {
            format!(
                "- **{}** ({}: {})",
                t.title,
                locale.due_label(),
                locale.format_due(t.due)
            )
        })
        .collect();
    let passed_lines: Vec<String> = passed
        .iter()
        .map(|t| {
            format!(
                "- __{}__ ({}: {})",
                t.title,
                locale.was_due_label(),
                locale.format_due(t.due)
            )
        })
        .collect();

    let section = |lines: &[String], placeholder: &str| {
        if lines.is_empty() {
            placeholder.to_string()
        } else {
            lines.join("\n")
        }
    };

    let text = format!(
        "{}\n{}\n{}\n\n{}\n{}",
        locale.header(),
        locale.pending_heading(),
        section(&pending_lines, locale.no_pending()),
        locale.passed_heading(),
        section(&passed_lines, locale.no_passed()),
    );

    Snapshot {
        pending_lines,
        passed_lines,
        rendered_at,
        text,
    }
}

const ELLIPSIS_LINE: &str = "…";

fn truncate_lines(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    // Room for "\n…".
    let budget = limit.saturating_sub(2);
    let mut out = String::new();
    let mut used = 0;
    for line in text.lines() {
        let cost = line.chars().count() + usize::from(!out.is_empty());
        if used + cost > budget {
            break;
        }
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(line);
        used += cost;
    }
    if out.is_empty() {
        ELLIPSIS_LINE.to_string()
    } else {
        format!("{out}\n{ELLIPSIS_LINE}")
    }
}
