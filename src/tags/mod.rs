// Tag grammar and splice formatting for model output markup

pub mod format;
pub mod grammar;

pub use format::{
    extract_answers, final_answer, format_error, format_result, render_all,
    ErrorClass, Fragment,
};
pub use grammar::{match_marker, MarkerMatch, TagKind, ToolKind, END_TASK_MARKER};
