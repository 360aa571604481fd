//! Markdown plans: numbered sections with checkbox tasks.
//!
//! ```text
//! 1. Refactor the domain model [x]
//!    - [x] merge the post entity into the blog aggregate
//!    - [!] add publish and review methods
//! 2. Clean up layers
//!    - remove duplicate DTOs
//! ```

use std::fmt;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

lazy_static! {
    static ref SECTION: Regex =
        Regex::new(r"^(\d+)\.\s*(?:\[([xX!*✓ ]?)\]\s*)?(.+?)(?:\s*\[([xX!*✓ ]?)\])?\s*$").unwrap();
    static ref TASK: Regex = Regex::new(r"^\s*[-*]\s*\[\s*([xX!*✓]?)\s*\]\s*(.*)$").unwrap();
    static ref ITEM: Regex = Regex::new(r"^\s*[-*]\s+(.+)$").unwrap();
    static ref FILE_LINK: Regex = Regex::new(r"\[(.*?)\]\((.*?)\)").unwrap();
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display, strum::AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    #[default]
    Todo,
    Completed,
    Failed,
    InProgress,
}

impl TaskStatus {
    pub fn from_marker(marker: &str) -> Self {
        match marker.trim() {
            "x" | "X" | "✓" => TaskStatus::Completed,
            "!" => TaskStatus::Failed,
            "*" => TaskStatus::InProgress,
            _ => TaskStatus::Todo,
        }
    }

    pub fn marker(&self) -> &'static str {
        match self {
            TaskStatus::Todo => " ",
            TaskStatus::Completed => "x",
            TaskStatus::Failed => "!",
            TaskStatus::InProgress => "*",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeFileLink {
    pub display_text: String,
    pub file_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanTask {
    pub step: String,
    pub status: TaskStatus,
    pub code_file_links: Vec<CodeFileLink>,
}

impl PlanTask {
    fn new(step: &str, status: TaskStatus) -> Self {
        let code_file_links = FILE_LINK
            .captures_iter(step)
            .map(|caps| CodeFileLink {
                display_text: caps[1].to_string(),
                file_path: caps[2].to_string(),
            })
            .collect();
        Self {
            step: step.to_string(),
            status,
            code_file_links,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == TaskStatus::Completed
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanItem {
    pub title: String,
    pub tasks: Vec<PlanTask>,
    pub status: TaskStatus,
}

impl PlanItem {
    /// Explicitly marked completed, or every task completed.
    pub fn is_completed(&self) -> bool {
        self.status == TaskStatus::Completed
            || (!self.tasks.is_empty() && self.tasks.iter().all(PlanTask::is_completed))
    }
}

impl fmt::Display for PlanItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.title)?;
        if self.status != TaskStatus::Todo {
            write!(f, " [{}]", self.status.marker())?;
        }
        for task in &self.tasks {
            write!(f, "\n   - [{}] {}", task.status.marker(), task.step)?;
        }
        Ok(())
    }
}

#[mockall::automock]
pub trait MarkdownPlanParser: Send + Sync {
    fn parse(&self, markdown: &str) -> Vec<PlanItem>;
}

/// Line-based parser. Lines before the first section and lines that are
/// neither sections nor list items are ignored.
#[derive(Debug, Default, Clone, Copy)]
pub struct RegexPlanParser;

impl MarkdownPlanParser for RegexPlanParser {
    #[tracing::instrument(level = "debug", skip(self, markdown))]
    fn parse(&self, markdown: &str) -> Vec<PlanItem> {
        let mut items: Vec<PlanItem> = Vec::new();
        for line in markdown.lines() {
            let trimmed = line.trim();
            if let Some(caps) = SECTION.captures(trimmed) {
                let marker = caps
                    .get(2)
                    .or_else(|| caps.get(4))
                    .map(|m| m.as_str())
                    .unwrap_or_default();
                items.push(PlanItem {
                    title: caps[3].trim().to_string(),
                    tasks: Vec::new(),
                    status: TaskStatus::from_marker(marker),
                });
                continue;
            }
            let Some(current) = items.last_mut() else {
                continue;
            };
            if let Some(caps) = TASK.captures(line) {
                let step = caps[2].trim();
                if !step.is_empty() {
                    current.tasks.push(PlanTask::new(step, TaskStatus::from_marker(&caps[1])));
                }
            } else if let Some(caps) = ITEM.captures(line) {
                current.tasks.push(PlanTask::new(caps[1].trim(), TaskStatus::Todo));
            }
        }
        tracing::debug!("parsed {} plan sections", items.len());
        items
    }
}
