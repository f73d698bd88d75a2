// Splice formatting and output extraction

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::grammar::ToolKind;
use crate::ledger::TaskId;

static ANSWER_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<answer>(.*?)</answer>").expect("Failed to compile answer regex"));

/// Classification carried by an error splice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorClass {
    Rejected,
    Failed,
    Timeout,
    Cancelled,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Rejected => "rejected",
            ErrorClass::Failed => "failed",
            ErrorClass::Timeout => "timeout",
            ErrorClass::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of processed output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Fragment {
    /// Pass-through prose or markup
    Text { text: String },

    /// Output of a successful tool invocation
    ToolResult {
        task_id: TaskId,
        tool: ToolKind,
        output: String,
    },

    /// User-safe description of a failed invocation
    ToolError {
        task_id: TaskId,
        tool: ToolKind,
        class: ErrorClass,
        message: String,
    },
}

impl Fragment {
    pub fn text(text: impl Into<String>) -> Self {
        Fragment::Text { text: text.into() }
    }

    pub fn is_text(&self) -> bool {
        matches!(self, Fragment::Text { .. })
    }

    /// True for both success and error splices
    pub fn is_splice(&self) -> bool {
        !self.is_text()
    }

    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            Fragment::Text { .. } => None,
            Fragment::ToolResult { task_id, .. } | Fragment::ToolError { task_id, .. } => {
                Some(*task_id)
            }
        }
    }

    /// Text form written into the response stream
    pub fn render(&self) -> String {
        match self {
            Fragment::Text { text } => text.clone(),
            Fragment::ToolResult { output, .. } => format_result(output),
            Fragment::ToolError { class, message, .. } => format_error(*class, message),
        }
    }
}

pub fn format_result(output: &str) -> String {
    format!("<result>{}</result>", output)
}

pub fn format_error(class: ErrorClass, message: &str) -> String {
    format!(
        "<result><error kind=\"{}\">{}</error></result>",
        class.as_str(),
        message
    )
}

/// Concatenate the rendered form of `fragments`
pub fn render_all(fragments: &[Fragment]) -> String {
    fragments.iter().map(Fragment::render).collect()
}

/// Contents of every closed `<answer>` region, trimmed
pub fn extract_answers(text: &str) -> Vec<String> {
    ANSWER_REGEX
        .captures_iter(text)
        .map(|caps| caps[1].trim().to_string())
        .filter(|answer| !answer.is_empty())
        .collect()
}

/// What the user should see: the answers, or the whole text when there are none
pub fn final_answer(text: &str) -> String {
    let answers = extract_answers(text);
    if answers.is_empty() {
        text.trim().to_string()
    } else {
        answers.join("\n\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_result() {
        let fragment = Fragment::ToolResult {
            task_id: TaskId::new(1),
            tool: ToolKind::Python,
            output: "2".to_string(),
        };
        assert_eq!(fragment.render(), "<result>2</result>");
        assert!(fragment.is_splice());
        assert_eq!(fragment.task_id(), Some(TaskId::new(1)));
    }

    #[test]
    fn test_render_error_carries_class() {
        let fragment = Fragment::ToolError {
            task_id: TaskId::new(7),
            tool: ToolKind::Terminal,
            class: ErrorClass::Timeout,
            message: "Tool execution timed out after 1 seconds".to_string(),
        };
        assert_eq!(
            fragment.render(),
            "<result><error kind=\"timeout\">Tool execution timed out after 1 seconds</error></result>"
        );
    }

    #[test]
    fn test_render_all_concatenates() {
        let fragments = vec![Fragment::text("a "), Fragment::text("b")];
        assert_eq!(render_all(&fragments), "a b");
    }

    #[test]
    fn test_final_answer_prefers_answer_tags() {
        let text = "<thinking>hmm</thinking><answer> first </answer> noise <answer>second</answer>";
        assert_eq!(final_answer(text), "first\n\nsecond");
        assert_eq!(final_answer("  plain reply "), "plain reply");
    }

    #[test]
    fn test_fragment_serialization() {
        let json = serde_json::to_string(&Fragment::text("hi")).unwrap();
        assert!(json.contains("\"type\":\"text\""));
    }
}
