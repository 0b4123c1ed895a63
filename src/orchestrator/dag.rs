//! 子任务依赖图校验
//!
//! depends_on 来自 LLM，按不可信输入处理：越界与自指依赖先剔除，
//! 环检测在任何子任务执行前完成，带环计划整体拒绝。

use std::collections::{HashSet, VecDeque};

use crate::orchestrator::types::{SubTask, SubTaskStatus};

/// 剔除越界、自指与重复依赖，返回被剔除的 (子任务下标, 依赖下标) 列表
pub fn sanitize_dependencies(subtasks: &mut [SubTask]) -> Vec<(usize, usize)> {
    let len = subtasks.len();
    let mut dropped = Vec::new();

    for (index, subtask) in subtasks.iter_mut().enumerate() {
        let mut seen = HashSet::new();
        subtask.depends_on.retain(|&dep| {
            if dep >= len || dep == index {
                dropped.push((index, dep));
                return false;
            }
            // 重复依赖静默去重，只保留首次出现
            seen.insert(dep)
        });
    }

    for (index, dep) in &dropped {
        tracing::warn!(
            subtask = index,
            dependency = dep,
            "Dropping invalid dependency from plan"
        );
    }
    dropped
}

/// DFS 找环；返回沿依赖边的环路径，如 "0 -> 1 -> 2 -> 0"
pub fn find_cycle(subtasks: &[SubTask]) -> Option<String> {
    fn visit(
        node: usize,
        subtasks: &[SubTask],
        visited: &mut [bool],
        in_stack: &mut [bool],
        path: &mut Vec<usize>,
    ) -> Option<Vec<usize>> {
        visited[node] = true;
        in_stack[node] = true;
        path.push(node);

        for &dep in &subtasks[node].depends_on {
            if !visited[dep] {
                if let Some(cycle) = visit(dep, subtasks, visited, in_stack, path) {
                    return Some(cycle);
                }
            } else if in_stack[dep] {
                // 回边指向栈内节点，从该节点起截取环
                let start = path.iter().position(|&n| n == dep).unwrap_or(0);
                let mut cycle = path[start..].to_vec();
                cycle.push(dep);
                return Some(cycle);
            }
        }

        in_stack[node] = false;
        path.pop();
        None
    }

    let mut visited = vec![false; subtasks.len()];
    let mut in_stack = vec![false; subtasks.len()];

    for start in 0..subtasks.len() {
        if visited[start] {
            continue;
        }
        let mut path = Vec::new();
        if let Some(cycle) = visit(start, subtasks, &mut visited, &mut in_stack, &mut path) {
            let rendered = cycle
                .iter()
                .map(|n| n.to_string())
                .collect::<Vec<_>>()
                .join(" -> ");
            return Some(rendered);
        }
    }
    None
}

/// 所有依赖均已完成的 Pending 子任务下标
pub fn ready_indices(subtasks: &[SubTask]) -> Vec<usize> {
    subtasks
        .iter()
        .enumerate()
        .filter(|(_, subtask)| subtask.status == SubTaskStatus::Pending)
        .filter(|(_, subtask)| {
            subtask
                .depends_on
                .iter()
                .all(|&dep| subtasks[dep].status == SubTaskStatus::Completed)
        })
        .map(|(index, _)| index)
        .collect()
}

/// 失败沿依赖边向下游传播：直接或传递依赖失败任务的 Pending 子任务
/// 不执行，直接标记 Failed，返回被波及的下标
pub fn cascade_failure(subtasks: &mut [SubTask], failed: usize) -> Vec<usize> {
    let mut cascaded = Vec::new();
    let mut affected = vec![false; subtasks.len()];
    affected[failed] = true;

    let mut queue = VecDeque::from([failed]);
    while let Some(current) = queue.pop_front() {
        for index in 0..subtasks.len() {
            if affected[index] || subtasks[index].status != SubTaskStatus::Pending {
                continue;
            }
            if subtasks[index].depends_on.contains(&current) {
                affected[index] = true;
                subtasks[index].status = SubTaskStatus::Failed;
                subtasks[index].error = Some(format!("Dependency {current} failed"));
                cascaded.push(index);
                queue.push_back(index);
            }
        }
    }
    cascaded
}
