// System prompt generation

use chrono::{DateTime, Local};

use crate::tags::ToolKind;

const BASE_PROMPT: &str = "You are GLAD, an AI virtual coworker.

The timestamp in front of each user message [YYYY-MM-DD HH:MM:SS] is the real current \
time when the message was sent. Use it for anything involving dates or times.

Rules:
1. The user only sees what you write inside <answer></answer> tags.
2. Each task begins with <task id=\"...\"> and ends with </endtask>.
3. You may use several <answer> tags in one task for progress, problems or partial results.
4. Write </endtask> only when the task is completely finished: every tool has run, every \
error is handled and the final result has been explained.
5. The user never sees your reasoning or raw tool output.";

const CHAT_ONLY: &str = "No tools are enabled; you are in chat-only mode.";

const TAG_GUIDE: &str = "Other tags:
- <thinking>: your reasoning (hidden from the user)
- <answer>: what the user sees
- <memory>: something worth remembering across conversations (hidden)
- <progress>: a short progress report
- <update>: a background status update
- <task id=\"...\">: marks the start of a task
- </endtask>: marks the task as complete
- <result>: inserted for you after each tool runs, holding its output or an error

When you close a tool tag, stop and wait. The result is inserted in place of the tool \
call as <result>...</result>, or <result><error kind=\"...\">...</error></result> when it \
failed, and you continue from there.

Example:
<task id=\"calc-1\">
<thinking>I'll compute it directly.</thinking>
<python>
print(6 * 7)
</python>
<result>42</result>
<answer>The result is 42.</answer>
</endtask>";

fn tool_usage(kind: ToolKind) -> (&'static str, &'static str) {
    match kind {
        ToolKind::Python => (
            "Python code execution",
            "<python>\nprint(\"your code here\")\n</python>",
        ),
        ToolKind::Terminal => (
            "Terminal commands (read-only: ls, cat, grep, find, wc, ...)",
            "<terminal>\nls -l\n</terminal>",
        ),
        ToolKind::Perplexity => (
            "Web search",
            "<perplexity>\nyour search query\n</perplexity>",
        ),
    }
}

/// Prompt describing the tag protocol and the tools in `enabled`
pub fn system_prompt(enabled: &[ToolKind]) -> String {
    let mut prompt = String::from(BASE_PROMPT);
    prompt.push_str("\n\n");

    if enabled.is_empty() {
        prompt.push_str(CHAT_ONLY);
        return prompt;
    }

    prompt.push_str("You can run tools with tags:\n\n");
    for kind in enabled {
        let (title, usage) = tool_usage(*kind);
        prompt.push_str(&format!("{}:\n{}\n\n", title, usage));
    }
    prompt.push_str(TAG_GUIDE);
    prompt
}

/// `[YYYY-MM-DD HH:MM:SS] text` wrapped in a task start marker
pub fn wrap_user_message(task_number: u64, text: &str, at: DateTime<Local>) -> String {
    format!(
        "<task id=\"task-{}\">\n[{}] {}",
        task_number,
        at.format("%Y-%m-%d %H:%M:%S"),
        text
    )
}
