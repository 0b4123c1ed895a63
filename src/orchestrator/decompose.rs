//! 任务分解与结果综合
//!
//! 构造分解 / 综合两类 prompt，从 LLM 输出中提取子任务数组；
//! 综合不可用时回退为按序拼接已完成的结果。

use crate::llm::Message;
use crate::orchestrator::types::{SubTask, SubTaskStatus, TaskPlan};

/// 构造分解请求：system 说明输出格式与规则，user 为原始任务
pub fn build_decompose_messages(
    task: &str,
    skills: &[(String, String)],
    max_subtasks: usize,
) -> Vec<Message> {
    let mut skill_lines = String::new();
    for (name, description) in skills {
        skill_lines.push_str(&format!("- {}: {}\n", name, description));
    }
    if skill_lines.is_empty() {
        skill_lines.push_str("- (none)\n");
    }

    let system = format!(
        r#"You are a task planner. Break the user's task into a small list of subtasks.

Respond with a JSON array only. Each element:
{{"description": "...", "skill": "skill name, or omit to answer directly", "input": "input for the skill", "depends_on": [indices of prerequisite subtasks]}}

Available skills:
{}
Rules:
- Use at most {} subtasks.
- depends_on holds zero-based indices into this same array.
- Only declare a dependency when the subtask needs the other subtask's output.
- Prefer independent subtasks so they can run in parallel."#,
        skill_lines, max_subtasks
    );

    vec![Message::system(system), Message::user(task.to_string())]
}

/// 从 LLM 输出中提取子任务数组（```json 块、裸数组或 {"subtasks": [...]} 均接受）
pub fn parse_subtasks(output: &str) -> Result<Vec<SubTask>, String> {
    let trimmed = output.trim();

    let json_str = if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        rest.find("```")
            .map(|end| rest[..end].trim())
            .unwrap_or(rest.trim())
    } else if let Some(start) = trimmed.find('[') {
        match trimmed.rfind(']') {
            Some(end) if end > start => &trimmed[start..=end],
            _ => trimmed,
        }
    } else if let Some(start) = trimmed.find('{') {
        match trimmed.rfind('}') {
            Some(end) if end > start => &trimmed[start..=end],
            _ => trimmed,
        }
    } else {
        return Err(format!("No JSON found in decomposition output: {}", trimmed));
    };

    if let Ok(subtasks) = serde_json::from_str::<Vec<SubTask>>(json_str) {
        return Ok(subtasks);
    }

    #[derive(serde::Deserialize)]
    struct Wrapper {
        subtasks: Vec<SubTask>,
    }
    serde_json::from_str::<Wrapper>(json_str)
        .map(|wrapper| wrapper.subtasks)
        .map_err(|e| format!("{}: {}", e, json_str))
}

/// 构造综合请求：带上每个子任务的终态与结果
pub fn build_synthesis_messages(task: &str, plan: &TaskPlan) -> Vec<Message> {
    let mut results = String::new();
    for (index, subtask) in plan.subtasks.iter().enumerate() {
        let line = match subtask.status {
            SubTaskStatus::Completed => format!(
                "[{}] {} => {}\n",
                index,
                subtask.description,
                subtask.result.as_deref().unwrap_or("")
            ),
            SubTaskStatus::Failed => format!(
                "[{}] {} => FAILED: {}\n",
                index,
                subtask.description,
                subtask.error.as_deref().unwrap_or("unknown error")
            ),
            _ => format!("[{}] {} => NOT RUN\n", index, subtask.description),
        };
        results.push_str(&line);
    }

    let system = format!(
        r#"You are finalizing a task that was split into subtasks. Combine the subtask results below into one coherent answer for the user. Mention failed subtasks only if they matter for the answer.

Subtask results:
{}"#,
        results
    );

    vec![Message::system(system), Message::user(task.to_string())]
}

/// 综合回退：按子任务顺序拼接已完成的结果
pub fn fallback_synthesis(plan: &TaskPlan) -> String {
    let parts: Vec<String> = plan
        .subtasks
        .iter()
        .enumerate()
        .filter(|(_, subtask)| subtask.status == SubTaskStatus::Completed)
        .filter_map(|(index, subtask)| {
            subtask
                .result
                .as_ref()
                .map(|result| format!("[{}] {}:\n{}", index + 1, subtask.description, result))
        })
        .collect();

    if parts.is_empty() {
        "No subtask produced a result.".to_string()
    } else {
        parts.join("\n\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bare_array() {
        let output = r#"[{"description": "a"}, {"description": "b", "depends_on": [0]}]"#;
        let subtasks = parse_subtasks(output).unwrap();
        assert_eq!(subtasks.len(), 2);
        assert_eq!(subtasks[1].depends_on, vec![0]);
        assert_eq!(subtasks[0].status, SubTaskStatus::Pending);
    }

    #[test]
    fn test_parse_fenced_block_with_chatter() {
        let output = "Sure, here is the plan:\n```json\n[{\"description\": \"a\", \"skill\": \"echo\"}]\n```\nLet me know!";
        let subtasks = parse_subtasks(output).unwrap();
        assert_eq!(subtasks.len(), 1);
        assert_eq!(subtasks[0].skill.as_deref(), Some("echo"));
    }

    #[test]
    fn test_parse_wrapper_object() {
        let output = r#"{"subtasks": [{"description": "a"}]}"#;
        let subtasks = parse_subtasks(output).unwrap();
        assert_eq!(subtasks.len(), 1);
    }

    #[test]
    fn test_parse_rejects_plain_text() {
        assert!(parse_subtasks("I cannot split this task.").is_err());
    }

    #[test]
    fn test_fallback_concatenates_completed_only() {
        let mut done = SubTask::new("first");
        done.status = SubTaskStatus::Completed;
        done.result = Some("alpha".to_string());

        let mut failed = SubTask::new("second");
        failed.status = SubTaskStatus::Failed;
        failed.error = Some("boom".to_string());

        let plan = TaskPlan::new("demo", vec![done, failed]);
        let answer = fallback_synthesis(&plan);
        assert!(answer.contains("alpha"));
        assert!(!answer.contains("boom"));
    }

    #[test]
    fn test_fallback_with_nothing_completed() {
        let plan = TaskPlan::new("demo", vec![SubTask::new("only")]);
        assert_eq!(fallback_synthesis(&plan), "No subtask produced a result.");
    }

    #[test]
    fn test_decompose_messages_list_skills() {
        let skills = vec![("echo".to_string(), "Echo input".to_string())];
        let messages = build_decompose_messages("do it", &skills, 8);
        assert_eq!(messages.len(), 2);
        assert!(messages[0].content.contains("- echo: Echo input"));
        assert!(messages[0].content.contains("at most 8"));
        assert_eq!(messages[1].content, "do it");
    }
}
