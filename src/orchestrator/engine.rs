//! 任务编排引擎
//!
//! 执行管线：LLM 分解 → 依赖清洗 → 环检测 → 按就绪波次并发执行 →
//! 失败沿依赖传播 → LLM 综合（失败回退拼接）。
//! LLM 与每个技能各走独立熔断器；全程通过显式上下文与追踪句柄传递状态。

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;

use crate::breaker::{BreakerError, BreakerRegistry};
use crate::llm::{LlmClient, Message};
use crate::orchestrator::dag::{
    cascade_failure, find_cycle, ready_indices, sanitize_dependencies,
};
use crate::orchestrator::decompose::{
    build_decompose_messages, build_synthesis_messages, fallback_synthesis, parse_subtasks,
};
use crate::orchestrator::types::{
    ExecContext, ExecutionReport, OrchestratorError, SubTask, SubTaskStatus, TaskPlan,
};
use crate::skills::{SkillContext, SkillExecutor};
use crate::state::StateManager;
use crate::trace::{TraceHandle, TraceRecorder, TraceStatus};

const DEFAULT_MAX_PARALLEL: usize = 4;
const DEFAULT_MAX_SUBTASKS: usize = 16;
const DEFAULT_LLM_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_SKILL_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_HISTORY_LIMIT: usize = 20;

/// LLM 依赖的熔断器名；技能用 "skill:{name}"
const LLM_BREAKER: &str = "llm";
const SESSION_COLLECTION: &str = "sessions";

const SUBTASK_SYSTEM_PROMPT: &str =
    "You are completing one subtask of a larger plan. Answer the subtask directly and concisely.";

/// 任务编排器
pub struct Orchestrator {
    llm: Arc<dyn LlmClient>,
    skills: Arc<dyn SkillExecutor>,
    state: Arc<StateManager>,
    breakers: Arc<BreakerRegistry>,
    recorder: TraceRecorder,
    max_parallel: usize,
    max_subtasks: usize,
    llm_timeout: Duration,
    skill_timeout: Duration,
    history_limit: usize,
}

impl Orchestrator {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        skills: Arc<dyn SkillExecutor>,
        state: Arc<StateManager>,
        breakers: Arc<BreakerRegistry>,
        recorder: TraceRecorder,
    ) -> Self {
        Self {
            llm,
            skills,
            state,
            breakers,
            recorder,
            max_parallel: DEFAULT_MAX_PARALLEL,
            max_subtasks: DEFAULT_MAX_SUBTASKS,
            llm_timeout: DEFAULT_LLM_TIMEOUT,
            skill_timeout: DEFAULT_SKILL_TIMEOUT,
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }

    pub fn from_config(
        llm: Arc<dyn LlmClient>,
        skills: Arc<dyn SkillExecutor>,
        state: Arc<StateManager>,
        breakers: Arc<BreakerRegistry>,
        recorder: TraceRecorder,
        cfg: &crate::config::OrchestratorSection,
    ) -> Self {
        let mut orchestrator = Self::new(llm, skills, state, breakers, recorder);
        orchestrator.max_parallel = cfg.max_parallel;
        orchestrator.max_subtasks = cfg.max_subtasks;
        orchestrator.llm_timeout = Duration::from_secs(cfg.llm_timeout_secs);
        orchestrator.skill_timeout = Duration::from_secs(cfg.skill_timeout_secs);
        orchestrator.history_limit = cfg.history_limit;
        orchestrator
    }

    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel;
        self
    }

    pub fn with_max_subtasks(mut self, max_subtasks: usize) -> Self {
        self.max_subtasks = max_subtasks;
        self
    }

    pub fn with_llm_timeout(mut self, timeout: Duration) -> Self {
        self.llm_timeout = timeout;
        self
    }

    pub fn with_skill_timeout(mut self, timeout: Duration) -> Self {
        self.skill_timeout = timeout;
        self
    }

    pub fn with_history_limit(mut self, history_limit: usize) -> Self {
        self.history_limit = history_limit;
        self
    }

    /// 执行一次编排；追踪在所有路径上恰好终结一次
    pub async fn run(
        &self,
        task: &str,
        ctx: ExecContext,
    ) -> Result<ExecutionReport, OrchestratorError> {
        let started = Instant::now();
        let guard =
            self.recorder
                .begin_guarded(task, ctx.requester_id.clone(), ctx.session_id.clone());
        let trace = guard.handle();
        let ctx = ExecContext {
            trace: Some(trace.clone()),
            ..ctx
        };

        tracing::info!(trace_id = %trace.trace_id(), "Orchestration started");

        match self.run_inner(task, &ctx, &trace, started).await {
            Ok(report) => {
                let failed = report
                    .plan
                    .subtasks
                    .iter()
                    .filter(|s| s.status == SubTaskStatus::Failed)
                    .count();
                trace.add_metadata(
                    "subtasks_total",
                    serde_json::json!(report.plan.subtasks.len()),
                );
                trace.add_metadata("subtasks_failed", serde_json::json!(failed));
                trace.set_final_output(&report.answer);
                guard.finish(TraceStatus::Success, None).await;
                tracing::info!(
                    trace_id = %report.trace_id,
                    duration_ms = report.duration_ms,
                    "Orchestration finished"
                );
                Ok(report)
            }
            Err(e) => {
                let status = match &e {
                    OrchestratorError::Breaker(BreakerError::Timeout { .. }) => {
                        TraceStatus::Timeout
                    }
                    _ => TraceStatus::Error,
                };
                guard.finish(status, Some(e.to_string())).await;
                tracing::warn!(error = %e, "Orchestration failed");
                Err(e)
            }
        }
    }

    async fn run_inner(
        &self,
        task: &str,
        ctx: &ExecContext,
        trace: &TraceHandle,
        started: Instant,
    ) -> Result<ExecutionReport, OrchestratorError> {
        if ctx.cancel.is_cancelled() {
            return Err(OrchestratorError::Cancelled);
        }

        let mut subtasks = self.decompose_plan(task, trace).await?;

        let dropped = sanitize_dependencies(&mut subtasks);
        if !dropped.is_empty() {
            trace.add_metadata("dependencies_dropped", serde_json::json!(dropped.len()));
        }

        if let Some(path) = find_cycle(&subtasks) {
            // 带环计划整体拒绝，任何子任务都不执行
            return Err(OrchestratorError::CyclicDependency(path));
        }

        let mut plan = TaskPlan::new(task, subtasks);
        tracing::info!(
            subtasks = plan.subtasks.len(),
            trace_id = %trace.trace_id(),
            "Executing plan"
        );

        self.execute_plan(&mut plan, ctx, trace).await?;

        let (answer, synthesized) = self.synthesize(task, &plan, trace).await;

        self.record_session(task, &answer, ctx, trace).await;

        Ok(ExecutionReport {
            answer,
            plan,
            trace_id: trace.trace_id(),
            duration_ms: started.elapsed().as_millis() as u64,
            synthesized,
        })
    }

    async fn decompose_plan(
        &self,
        task: &str,
        trace: &TraceHandle,
    ) -> Result<Vec<SubTask>, OrchestratorError> {
        let messages =
            build_decompose_messages(task, &self.skills.descriptions(), self.max_subtasks);
        let llm = self.llm.clone();
        let started = Instant::now();
        let output = self
            .breakers
            .breaker(LLM_BREAKER)
            .call(self.llm_timeout, || async move {
                llm.complete(&messages).await
            })
            .await?;
        trace.record_tool_call(
            "llm.decompose",
            task,
            &output,
            started.elapsed().as_millis() as u64,
            false,
        );

        let mut subtasks = parse_subtasks(&output).map_err(OrchestratorError::Decompose)?;
        if subtasks.is_empty() {
            return Err(OrchestratorError::EmptyPlan);
        }
        if subtasks.len() > self.max_subtasks {
            tracing::warn!(
                count = subtasks.len(),
                max = self.max_subtasks,
                "Plan exceeds subtask limit, truncating"
            );
            // 截断可能留下越界依赖，由 sanitize 剔除
            subtasks.truncate(self.max_subtasks);
        }
        Ok(subtasks)
    }

    /// 按就绪波次执行计划：每波并发量受 max_parallel 约束，
    /// 失败立即向下游传播，独立分支继续执行
    async fn execute_plan(
        &self,
        plan: &mut TaskPlan,
        ctx: &ExecContext,
        trace: &TraceHandle,
    ) -> Result<(), OrchestratorError> {
        let semaphore = Arc::new(Semaphore::new(self.max_parallel));

        loop {
            if ctx.cancel.is_cancelled() {
                return Err(OrchestratorError::Cancelled);
            }

            let ready = ready_indices(&plan.subtasks);
            if ready.is_empty() {
                let pending = plan
                    .subtasks
                    .iter()
                    .filter(|s| s.status == SubTaskStatus::Pending)
                    .count();
                if pending == 0 {
                    return Ok(());
                }
                // 安全网：带环计划在执行前已被拒绝，走到这里说明计划状态被破坏
                return Err(OrchestratorError::Deadlock { pending });
            }

            trace.bump_iteration();
            tracing::debug!(wave = ?ready, "Dispatching ready subtasks");

            let mut handles = Vec::new();
            for index in ready {
                plan.subtasks[index].status = SubTaskStatus::Running;

                let input = compose_input(&plan.subtasks, index);
                let skill = plan.subtasks[index].skill.clone();
                let llm = self.llm.clone();
                let skills = self.skills.clone();
                let breakers = self.breakers.clone();
                let trace = trace.clone();
                let skill_ctx = SkillContext {
                    requester_id: ctx.requester_id.clone(),
                    session_id: ctx.session_id.clone(),
                    trace_id: Some(trace.trace_id()),
                    trace: ctx.trace.clone(),
                };
                let llm_timeout = self.llm_timeout;
                let skill_timeout = self.skill_timeout;
                let semaphore = semaphore.clone();

                let handle = tokio::spawn(async move {
                    let _permit = match semaphore.acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => return Err("Semaphore closed".to_string()),
                    };

                    let started = Instant::now();
                    let label = skill.clone().unwrap_or_else(|| "llm.subtask".to_string());

                    let outcome = match skill {
                        Some(name) => {
                            let breaker = breakers.breaker(&format!("skill:{name}"));
                            let skill_input = input.clone();
                            breaker
                                .call(skill_timeout, || async move {
                                    skills.run(&name, &skill_input, &skill_ctx).await
                                })
                                .await
                        }
                        None => {
                            // 无技能的子任务由 LLM 直接完成
                            let breaker = breakers.breaker(LLM_BREAKER);
                            let messages = vec![
                                Message::system(SUBTASK_SYSTEM_PROMPT.to_string()),
                                Message::user(input.clone()),
                            ];
                            breaker
                                .call(llm_timeout, || async move {
                                    llm.complete(&messages).await
                                })
                                .await
                        }
                    };

                    let duration_ms = started.elapsed().as_millis() as u64;
                    match outcome {
                        Ok(output) => {
                            trace.record_tool_call(&label, &input, &output, duration_ms, false);
                            Ok(output)
                        }
                        Err(e) => {
                            let message = e.to_string();
                            trace.record_tool_call(&label, &input, &message, duration_ms, true);
                            Err(message)
                        }
                    }
                });
                handles.push((index, handle));
            }

            // 同一波内的子任务互不依赖，按派发顺序回收即可
            let mut handles = handles.into_iter();
            while let Some((index, mut handle)) = handles.next() {
                let joined = tokio::select! {
                    _ = ctx.cancel.cancelled() => {
                        handle.abort();
                        for (_, rest) in handles {
                            rest.abort();
                        }
                        return Err(OrchestratorError::Cancelled);
                    }
                    joined = &mut handle => joined,
                };
                match joined {
                    Ok(Ok(output)) => {
                        plan.subtasks[index].status = SubTaskStatus::Completed;
                        plan.subtasks[index].result = Some(output);
                    }
                    Ok(Err(error)) => fail_subtask(plan, index, error),
                    // 子任务 panic 按失败处理，不拖垮整个计划
                    Err(join_error) => {
                        fail_subtask(plan, index, format!("Subtask panicked: {join_error}"));
                    }
                }
            }
        }
    }

    async fn synthesize(
        &self,
        task: &str,
        plan: &TaskPlan,
        trace: &TraceHandle,
    ) -> (String, bool) {
        // 单子任务成功时直接用其结果，省一次 LLM 往返
        if plan.subtasks.len() == 1 {
            if let Some(result) = plan.subtasks.first().and_then(|s| s.result.clone()) {
                return (result, false);
            }
        }

        let messages = build_synthesis_messages(task, plan);
        let llm = self.llm.clone();
        let started = Instant::now();
        match self
            .breakers
            .breaker(LLM_BREAKER)
            .call(self.llm_timeout, || async move {
                llm.complete(&messages).await
            })
            .await
        {
            Ok(answer) => {
                trace.record_tool_call(
                    "llm.synthesize",
                    task,
                    &answer,
                    started.elapsed().as_millis() as u64,
                    false,
                );
                (answer, true)
            }
            Err(e) => {
                // 已完成的结果不浪费，降级为拼接
                tracing::warn!(error = %e, "Synthesis failed, falling back to concatenation");
                trace.record_tool_call(
                    "llm.synthesize",
                    task,
                    &e.to_string(),
                    started.elapsed().as_millis() as u64,
                    true,
                );
                (fallback_synthesis(plan), false)
            }
        }
    }

    async fn record_session(
        &self,
        task: &str,
        answer: &str,
        ctx: &ExecContext,
        trace: &TraceHandle,
    ) {
        let Some(session_id) = &ctx.session_id else { return };
        let entry = serde_json::json!({
            "task": task,
            "answer": answer,
            "trace_id": trace.trace_id(),
            "timestamp": chrono::Utc::now().timestamp_millis(),
        });
        // 历史写失败不影响本次结果
        if let Err(e) = self
            .state
            .append_bounded(
                SESSION_COLLECTION,
                session_id,
                "history",
                entry,
                self.history_limit,
                self.state.default_ttl(),
            )
            .await
        {
            tracing::warn!(session_id = %session_id, error = %e, "Failed to record session history");
        }
    }
}

/// 子任务输入：黏合自身 input/description 与前置子任务的结果
fn compose_input(subtasks: &[SubTask], index: usize) -> String {
    let subtask = &subtasks[index];
    let base = subtask
        .input
        .clone()
        .unwrap_or_else(|| subtask.description.clone());
    if subtask.depends_on.is_empty() {
        return base;
    }

    let mut context = String::new();
    for &dep in &subtask.depends_on {
        if let Some(result) = &subtasks[dep].result {
            context.push_str(&format!("[{}] {}\n", dep, result));
        }
    }
    if context.is_empty() {
        base
    } else {
        format!("{}\n\nResults from prerequisite subtasks:\n{}", base, context)
    }
}

fn fail_subtask(plan: &mut TaskPlan, index: usize, error: String) {
    tracing::warn!(subtask = index, error = %error, "Subtask failed");
    plan.subtasks[index].status = SubTaskStatus::Failed;
    plan.subtasks[index].error = Some(error);

    let cascaded = cascade_failure(&mut plan.subtasks, index);
    if !cascaded.is_empty() {
        tracing::warn!(
            subtask = index,
            cascaded = ?cascaded,
            "Failing dependents of failed subtask without execution"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;
    use crate::skills::{Skill, SkillRegistry};
    use crate::state::{DocumentStore, MemoryStore};
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use tokio_util::sync::CancellationToken;

    struct RecordingSkill {
        name: &'static str,
        delay_ms: u64,
        fail: bool,
        log: Arc<StdMutex<Vec<String>>>,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl Skill for RecordingSkill {
        fn name(&self) -> &str {
            self.name
        }

        fn description(&self) -> &str {
            "test skill"
        }

        async fn run(&self, _input: &str, _ctx: &SkillContext) -> Result<String, String> {
            if self.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            }
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.log.lock().unwrap().push(self.name.to_string());
            if self.fail {
                Err(format!("{} exploded", self.name))
            } else {
                Ok(format!("{} done", self.name))
            }
        }
    }

    struct Harness {
        orchestrator: Orchestrator,
        recorder: TraceRecorder,
        breakers: Arc<BreakerRegistry>,
        mem: Arc<MemoryStore>,
        llm: Arc<MockLlmClient>,
        log: Arc<StdMutex<Vec<String>>>,
        calls: Arc<AtomicUsize>,
    }

    fn harness(skill_defs: &[(&'static str, u64, bool)]) -> Harness {
        let mem = Arc::new(MemoryStore::new());
        let breakers = Arc::new(BreakerRegistry::default());
        let state = Arc::new(StateManager::new(
            mem.clone(),
            breakers.clone(),
            100,
            Duration::from_secs(5),
            Duration::from_secs(300),
        ));
        let recorder = TraceRecorder::new(state.clone(), 1.0, 2000);
        let llm = Arc::new(MockLlmClient::new());
        let log = Arc::new(StdMutex::new(Vec::new()));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut registry = SkillRegistry::new();
        for (name, delay_ms, fail) in skill_defs {
            registry.register(RecordingSkill {
                name,
                delay_ms: *delay_ms,
                fail: *fail,
                log: log.clone(),
                calls: calls.clone(),
            });
        }

        let orchestrator = Orchestrator::new(
            llm.clone(),
            Arc::new(registry),
            state,
            breakers.clone(),
            recorder.clone(),
        );
        Harness {
            orchestrator,
            recorder,
            breakers,
            mem,
            llm,
            log,
            calls,
        }
    }

    fn diamond_plan() -> String {
        r#"[
            {"description": "load", "skill": "a"},
            {"description": "left", "skill": "b", "depends_on": [0]},
            {"description": "right", "skill": "c", "depends_on": [0]},
            {"description": "join", "skill": "d", "depends_on": [1, 2]}
        ]"#
        .to_string()
    }

    #[tokio::test]
    async fn test_diamond_executes_in_dependency_order() {
        let h = harness(&[
            ("a", 0, false),
            ("b", 10, false),
            ("c", 10, false),
            ("d", 0, false),
        ]);
        h.llm.push_response(diamond_plan());
        h.llm.push_response("final answer");

        let report = h
            .orchestrator
            .run("do the thing", ExecContext::new())
            .await
            .unwrap();

        assert_eq!(report.answer, "final answer");
        assert!(report.synthesized);
        assert!(report
            .plan
            .subtasks
            .iter()
            .all(|s| s.status == SubTaskStatus::Completed));

        let log = h.log.lock().unwrap();
        assert_eq!(log.len(), 4);
        assert_eq!(log[0], "a");
        assert_eq!(log[3], "d");
        let middle: HashSet<&str> = [log[1].as_str(), log[2].as_str()].into();
        assert_eq!(middle, ["b", "c"].into());

        let trace = h
            .recorder
            .get_trace(&report.trace_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(trace.status, TraceStatus::Success);
        assert_eq!(trace.iterations, 3);
        // 分解 + 四个子任务 + 综合
        assert_eq!(trace.tool_calls.len(), 6);
    }

    #[tokio::test]
    async fn test_cyclic_plan_rejected_without_execution() {
        let h = harness(&[("a", 0, false), ("b", 0, false)]);
        h.llm.push_response(
            r#"[{"description": "x", "skill": "a", "depends_on": [1]},
                {"description": "y", "skill": "b", "depends_on": [0]}]"#,
        );

        let err = h
            .orchestrator
            .run("loop", ExecContext::new())
            .await
            .unwrap_err();
        match err {
            OrchestratorError::CyclicDependency(path) => assert!(path.contains("->")),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(h.calls.load(Ordering::SeqCst), 0);

        let traces = h
            .recorder
            .list_by_status(TraceStatus::Error, None)
            .await
            .unwrap();
        assert_eq!(traces.len(), 1);
        assert!(traces[0].error.as_deref().unwrap().contains("Cyclic"));
    }

    #[tokio::test]
    async fn test_invalid_dependencies_dropped_before_execution() {
        let h = harness(&[("a", 0, false)]);
        h.llm
            .push_response(r#"[{"description": "x", "skill": "a", "depends_on": [7, 0]}]"#);

        let report = h.orchestrator.run("t", ExecContext::new()).await.unwrap();

        assert_eq!(report.plan.subtasks[0].depends_on, Vec::<usize>::new());
        assert_eq!(report.answer, "a done");
        assert!(!report.synthesized);
        assert_eq!(h.llm.call_count(), 1);
    }

    #[tokio::test]
    async fn test_failure_cascades_while_siblings_complete() {
        let h = harness(&[
            ("a", 0, false),
            ("b", 0, true),
            ("c", 30, false),
            ("d", 0, false),
        ]);
        h.llm.push_response(diamond_plan());
        h.llm.push_response("partial summary");

        let report = h.orchestrator.run("t", ExecContext::new()).await.unwrap();

        let plan = &report.plan;
        assert_eq!(plan.subtasks[0].status, SubTaskStatus::Completed);
        assert_eq!(plan.subtasks[1].status, SubTaskStatus::Failed);
        assert_eq!(plan.subtasks[2].status, SubTaskStatus::Completed);
        assert_eq!(plan.subtasks[3].status, SubTaskStatus::Failed);
        assert!(plan.subtasks[3]
            .error
            .as_deref()
            .unwrap()
            .contains("Dependency 1"));
        assert_eq!(report.answer, "partial summary");

        let trace = h
            .recorder
            .get_trace(&report.trace_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            trace.metadata.get("subtasks_failed"),
            Some(&serde_json::json!(2))
        );
    }

    #[tokio::test]
    async fn test_empty_plan_is_error() {
        let h = harness(&[]);
        h.llm.push_response("[]");

        let err = h
            .orchestrator
            .run("t", ExecContext::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::EmptyPlan));
    }

    #[tokio::test]
    async fn test_unparseable_plan_is_error() {
        let h = harness(&[]);
        h.llm.push_response("I refuse to answer with JSON.");

        let err = h
            .orchestrator
            .run("t", ExecContext::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Decompose(_)));

        let traces = h
            .recorder
            .list_by_status(TraceStatus::Error, None)
            .await
            .unwrap();
        assert_eq!(traces.len(), 1);
    }

    #[tokio::test]
    async fn test_synthesis_falls_back_to_concatenation() {
        let h = harness(&[("a", 0, false), ("b", 0, false)]);
        h.llm.push_response(
            r#"[{"description": "one", "skill": "a"}, {"description": "two", "skill": "b"}]"#,
        );
        h.llm.push_error("llm down");

        let report = h.orchestrator.run("t", ExecContext::new()).await.unwrap();

        assert!(!report.synthesized);
        assert!(report.answer.contains("a done"));
        assert!(report.answer.contains("b done"));
    }

    #[tokio::test]
    async fn test_open_llm_breaker_fails_fast() {
        let h = harness(&[]);
        h.breakers.breaker(LLM_BREAKER).force_open();

        let err = h
            .orchestrator
            .run("t", ExecContext::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::Breaker(BreakerError::CircuitOpen { .. })
        ));
        assert_eq!(h.llm.call_count(), 0);
    }

    #[tokio::test]
    async fn test_subtask_without_skill_goes_to_llm() {
        let h = harness(&[]);
        h.llm
            .push_response(r#"[{"description": "answer the question"}]"#);
        h.llm.push_response("forty-two");

        let report = h
            .orchestrator
            .run("what is it", ExecContext::new())
            .await
            .unwrap();

        assert_eq!(report.answer, "forty-two");
        // 分解 + 子任务；单子任务不再综合
        assert_eq!(h.llm.call_count(), 2);
    }

    #[tokio::test]
    async fn test_dependency_results_flow_into_input() {
        let h = harness(&[("a", 0, false)]);
        h.llm.push_response(
            r#"[{"description": "fetch", "skill": "a"},
                {"description": "summarize what was fetched", "depends_on": [0]}]"#,
        );
        h.llm.push_response("summary");
        h.llm.push_response("final");

        let report = h.orchestrator.run("t", ExecContext::new()).await.unwrap();
        assert_eq!(report.answer, "final");

        // 第二个 LLM 调用（子任务）带上了前置结果
        let trace = h
            .recorder
            .get_trace(&report.trace_id)
            .await
            .unwrap()
            .unwrap();
        let subtask_call = trace
            .tool_calls
            .iter()
            .find(|call| call.name == "llm.subtask")
            .unwrap();
        assert!(subtask_call.input.contains("a done"));
    }

    #[tokio::test]
    async fn test_cancellation_aborts_and_finalizes_trace() {
        let h = harness(&[("slow", 500, false)]);
        h.llm
            .push_response(r#"[{"description": "s", "skill": "slow"}]"#);

        let cancel = CancellationToken::new();
        let ctx = ExecContext::new().with_cancel(cancel.clone());
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let err = h.orchestrator.run("t", ctx).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Cancelled));

        let traces = h
            .recorder
            .list_by_status(TraceStatus::Error, None)
            .await
            .unwrap();
        assert_eq!(traces.len(), 1);
        assert!(traces[0].is_finalized());
    }

    #[tokio::test]
    async fn test_plan_truncated_to_max_subtasks() {
        let h = harness(&[("a", 0, false)]);
        let orchestrator = h.orchestrator.with_max_subtasks(2);
        h.llm.push_response(
            r#"[{"description": "1", "skill": "a"},
                {"description": "2", "skill": "a"},
                {"description": "3", "skill": "a", "depends_on": [0]}]"#,
        );
        h.llm.push_response("done");

        let report = orchestrator.run("t", ExecContext::new()).await.unwrap();
        assert_eq!(report.plan.subtasks.len(), 2);
    }

    #[tokio::test]
    async fn test_consecutive_runs_get_disjoint_traces() {
        let h = harness(&[("a", 0, false)]);
        h.llm
            .push_response(r#"[{"description": "x", "skill": "a"}]"#);
        h.llm
            .push_response(r#"[{"description": "y", "skill": "a"}]"#);

        let first = h.orchestrator.run("one", ExecContext::new()).await.unwrap();
        let second = h.orchestrator.run("two", ExecContext::new()).await.unwrap();

        assert_ne!(first.trace_id, second.trace_id);
        let trace = h
            .recorder
            .get_trace(&second.trace_id)
            .await
            .unwrap()
            .unwrap();
        // 第二次执行的追踪只含自己的调用：分解 + 一个子任务
        assert_eq!(trace.task, "two");
        assert_eq!(trace.tool_calls.len(), 2);
        assert_eq!(trace.final_output.as_deref(), Some("a done"));
    }

    /// 在 run 内通过 ctx.trace 记录一次内部下游调用的技能
    struct AuditedSkill;

    #[async_trait::async_trait]
    impl Skill for AuditedSkill {
        fn name(&self) -> &str {
            "lookup"
        }

        fn description(&self) -> &str {
            "lookup with inner call recording"
        }

        async fn run(&self, input: &str, ctx: &SkillContext) -> Result<String, String> {
            if let Some(trace) = &ctx.trace {
                trace.record_tool_call("lookup.fetch", input, "200 OK", 1, false);
            }
            Ok("looked up".to_string())
        }
    }

    #[tokio::test]
    async fn test_skill_records_nested_call_on_trace() {
        let breakers = Arc::new(BreakerRegistry::default());
        let state = Arc::new(StateManager::new(
            Arc::new(MemoryStore::new()),
            breakers.clone(),
            100,
            Duration::from_secs(5),
            Duration::from_secs(300),
        ));
        let recorder = TraceRecorder::new(state.clone(), 1.0, 2000);
        let llm = Arc::new(MockLlmClient::new());
        llm.push_response(r#"[{"description": "look it up", "skill": "lookup"}]"#);

        let mut registry = SkillRegistry::new();
        registry.register(AuditedSkill);
        let orchestrator = Orchestrator::new(
            llm,
            Arc::new(registry),
            state,
            breakers,
            recorder.clone(),
        );

        let report = orchestrator.run("t", ExecContext::new()).await.unwrap();
        assert_eq!(report.answer, "looked up");

        // 技能内部的下游调用与编排自身的记录汇入同一条追踪
        let trace = recorder
            .get_trace(&report.trace_id)
            .await
            .unwrap()
            .unwrap();
        let names: Vec<&str> = trace.tool_calls.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["llm.decompose", "lookup.fetch", "lookup"]);
    }

    #[tokio::test]
    async fn test_session_history_recorded() {
        let h = harness(&[("a", 0, false)]);
        h.llm
            .push_response(r#"[{"description": "x", "skill": "a"}]"#);

        let ctx = ExecContext::new().with_requester("u1").with_session("s1");
        let report = h.orchestrator.run("remember", ctx).await.unwrap();

        let doc = h.mem.get("sessions", "s1").await.unwrap().unwrap();
        let history = doc["history"].as_array().unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0]["task"], "remember");
        assert_eq!(history[0]["trace_id"], serde_json::json!(report.trace_id));
    }

    #[tokio::test]
    async fn test_deadlock_guard_reports_stuck_subtasks() {
        let h = harness(&[]);
        let mut blocked = SubTask::new("blocked").with_depends_on(vec![1]);
        blocked.status = SubTaskStatus::Pending;
        let mut dead = SubTask::new("dead");
        dead.status = SubTaskStatus::Failed;
        let mut plan = TaskPlan::new("t", vec![blocked, dead]);

        let trace = h.recorder.begin("t", None, None);
        let err = h
            .orchestrator
            .execute_plan(&mut plan, &ExecContext::new(), &trace)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Deadlock { pending: 1 }));
    }

    #[tokio::test]
    async fn test_parallelism_respects_semaphore() {
        let h = harness(&[
            ("p1", 50, false),
            ("p2", 50, false),
            ("p3", 50, false),
            ("p4", 50, false),
        ]);
        let orchestrator = h.orchestrator.with_max_parallel(1);
        h.llm.push_response(
            r#"[{"description": "1", "skill": "p1"},
                {"description": "2", "skill": "p2"},
                {"description": "3", "skill": "p3"},
                {"description": "4", "skill": "p4"}]"#,
        );
        h.llm.push_response("done");

        let started = Instant::now();
        let report = orchestrator.run("t", ExecContext::new()).await.unwrap();
        // max_parallel=1 时四个 50ms 子任务只能串行
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert!(report
            .plan
            .subtasks
            .iter()
            .all(|s| s.status == SubTaskStatus::Completed));
    }
}
