// Tag grammar for model output markup
//
// Regions are delimited by `<kind>` ... `</kind>`. `<task>` additionally
// accepts an `id="..."` attribute and `</endtask>` stands alone.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Standalone marker closing the current task
pub const END_TASK_MARKER: &str = "</endtask>";

/// Longest attribute section accepted on a `<task ...>` start marker
pub const MAX_TASK_ATTR_BYTES: usize = 128;

static TASK_ATTR_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^\s+id="([^"<>]*)"\s*$"#).expect("Failed to compile task attribute regex")
});

/// Tool tags backed by an executor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolKind {
    Python,
    Terminal,
    Perplexity,
}

impl ToolKind {
    pub const ALL: [ToolKind; 3] = [ToolKind::Python, ToolKind::Terminal, ToolKind::Perplexity];

    /// Tag name as it appears in markup
    pub fn tag(&self) -> &'static str {
        match self {
            ToolKind::Python => "python",
            ToolKind::Terminal => "terminal",
            ToolKind::Perplexity => "perplexity",
        }
    }

    /// Exact, case-sensitive lookup
    pub fn from_tag(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.tag() == name)
    }
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Every recognized region kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagKind {
    Task,
    Thinking,
    Answer,
    Memory,
    Progress,
    Update,
    Tool(ToolKind),
}

impl TagKind {
    pub const ALL: [TagKind; 9] = [
        TagKind::Task,
        TagKind::Thinking,
        TagKind::Answer,
        TagKind::Memory,
        TagKind::Progress,
        TagKind::Update,
        TagKind::Tool(ToolKind::Python),
        TagKind::Tool(ToolKind::Terminal),
        TagKind::Tool(ToolKind::Perplexity),
    ];

    pub fn name(&self) -> &'static str {
        match self {
            TagKind::Task => "task",
            TagKind::Thinking => "thinking",
            TagKind::Answer => "answer",
            TagKind::Memory => "memory",
            TagKind::Progress => "progress",
            TagKind::Update => "update",
            TagKind::Tool(tool) => tool.tag(),
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    /// Structural kinds are passed through, never dispatched
    pub fn is_structural(&self) -> bool {
        !matches!(self, TagKind::Tool(_))
    }

    pub fn tool(&self) -> Option<ToolKind> {
        match self {
            TagKind::Tool(tool) => Some(*tool),
            _ => None,
        }
    }

    pub fn start_marker(&self) -> &'static str {
        match self {
            TagKind::Task => "<task>",
            TagKind::Thinking => "<thinking>",
            TagKind::Answer => "<answer>",
            TagKind::Memory => "<memory>",
            TagKind::Progress => "<progress>",
            TagKind::Update => "<update>",
            TagKind::Tool(ToolKind::Python) => "<python>",
            TagKind::Tool(ToolKind::Terminal) => "<terminal>",
            TagKind::Tool(ToolKind::Perplexity) => "<perplexity>",
        }
    }

    pub fn end_marker(&self) -> &'static str {
        match self {
            TagKind::Task => "</task>",
            TagKind::Thinking => "</thinking>",
            TagKind::Answer => "</answer>",
            TagKind::Memory => "</memory>",
            TagKind::Progress => "</progress>",
            TagKind::Update => "</update>",
            TagKind::Tool(ToolKind::Python) => "</python>",
            TagKind::Tool(ToolKind::Terminal) => "</terminal>",
            TagKind::Tool(ToolKind::Perplexity) => "</perplexity>",
        }
    }
}

impl fmt::Display for TagKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Outcome of matching markup at a `<`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkerMatch {
    /// Complete start marker of `len` bytes
    Start {
        kind: TagKind,
        len: usize,
        id: Option<String>,
    },
    /// Complete `</endtask>` marker
    EndTask { len: usize },
    /// Input ends before the marker can be decided
    Partial,
    /// Not a recognized marker
    None,
}

/// Match a marker at the start of `input`, which must begin with `<`.
///
/// The decision is stable: once `None` or a complete match is returned,
/// appending more input to `input` never changes it.
pub fn match_marker(input: &str) -> MarkerMatch {
    debug_assert!(input.starts_with('<'));

    if input.starts_with(END_TASK_MARKER) {
        return MarkerMatch::EndTask {
            len: END_TASK_MARKER.len(),
        };
    }

    let mut partial = END_TASK_MARKER.starts_with(input);

    for kind in TagKind::ALL {
        let marker = kind.start_marker();
        if input.starts_with(marker) {
            return MarkerMatch::Start {
                kind,
                len: marker.len(),
                id: None,
            };
        }
        if marker.starts_with(input) {
            partial = true;
        }
    }

    if let Some(rest) = input.strip_prefix("<task") {
        match match_task_attributes(rest) {
            AttrMatch::Complete { len, id } => {
                return MarkerMatch::Start {
                    kind: TagKind::Task,
                    len: "<task".len() + len,
                    id: Some(id),
                };
            }
            AttrMatch::Partial => partial = true,
            AttrMatch::None => {}
        }
    }

    if partial {
        MarkerMatch::Partial
    } else {
        MarkerMatch::None
    }
}

enum AttrMatch {
    Complete { len: usize, id: String },
    Partial,
    None,
}

fn match_task_attributes(rest: &str) -> AttrMatch {
    if !rest.starts_with(|ch: char| ch.is_ascii_whitespace() && ch != '\n') {
        return AttrMatch::None;
    }

    for (idx, ch) in rest.char_indices() {
        if idx > MAX_TASK_ATTR_BYTES {
            return AttrMatch::None;
        }
        match ch {
            '>' => {
                let attrs = &rest[..idx];
                return match TASK_ATTR_REGEX.captures(attrs) {
                    Some(caps) => AttrMatch::Complete {
                        len: idx + 1,
                        id: caps[1].to_string(),
                    },
                    None => AttrMatch::None,
                };
            }
            '<' | '\n' => return AttrMatch::None,
            _ => {}
        }
    }

    if rest.len() > MAX_TASK_ATTR_BYTES {
        AttrMatch::None
    } else {
        AttrMatch::Partial
    }
}
