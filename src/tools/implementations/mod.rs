// Tool implementations
//
// Built-in executors for the python, terminal and perplexity tags

pub mod perplexity;
pub mod python;
pub mod terminal;

pub use perplexity::PerplexityTool;
pub use python::PythonTool;
pub use terminal::TerminalTool;

/// Cap `output` at `max_chars` characters, noting how much was dropped
pub(crate) fn truncate_output(output: &str, max_chars: usize) -> String {
    let total = output.chars().count();
    if total <= max_chars {
        return output.to_string();
    }
    let kept: String = output.chars().take(max_chars).collect();
    format!(
        "{}\n\n[Output truncated - showing first {} of {} characters]",
        kept, max_chars, total
    )
}
