//! 技能注册表
//!
//! 所有技能实现 Skill trait（name / description / run），由 SkillRegistry 按名注册与查找。
//! SkillRegistry 同时实现 SkillExecutor，编排器只依赖 SkillExecutor，宿主可整体替换为远端执行器。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::trace::TraceHandle;

/// 技能调用上下文：请求方与会话标识，供技能实现做审计或隔离
#[derive(Clone, Default)]
pub struct SkillContext {
    pub requester_id: Option<String>,
    pub session_id: Option<String>,
    pub trace_id: Option<String>,
    /// 当前编排的追踪句柄；技能内部的下游调用可以挂到同一条追踪上
    pub trace: Option<TraceHandle>,
}

/// 技能 trait：名称、描述（供 LLM 理解）、异步执行
#[async_trait]
pub trait Skill: Send + Sync {
    /// 技能名称（分解计划中 skill 字段引用的名字）
    fn name(&self) -> &str;

    /// 技能描述（供 LLM 选择技能）
    fn description(&self) -> &str;

    /// 执行技能
    async fn run(&self, input: &str, ctx: &SkillContext) -> Result<String, String>;
}

/// 技能执行器 trait：编排器消费的唯一接口
#[async_trait]
pub trait SkillExecutor: Send + Sync {
    /// 按名称执行技能
    async fn run(&self, skill_name: &str, input: &str, ctx: &SkillContext)
        -> Result<String, String>;

    /// 返回 (name, description) 列表，用于生成分解 prompt 中的可用技能段落
    /// 默认返回空，表示执行器不公开技能清单
    fn descriptions(&self) -> Vec<(String, String)> {
        Vec::new()
    }
}

/// 技能注册表：按名称存储 Arc<dyn Skill>，支持 register / get / skill_names
#[derive(Default)]
pub struct SkillRegistry {
    skills: HashMap<String, Arc<dyn Skill>>,
}

impl SkillRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, skill: impl Skill + 'static) {
        let name = skill.name().to_string();
        self.skills.insert(name, Arc::new(skill));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Skill>> {
        self.skills.get(name).cloned()
    }

    pub fn skill_names(&self) -> Vec<String> {
        self.skills.keys().cloned().collect()
    }
}

#[async_trait]
impl SkillExecutor for SkillRegistry {
    async fn run(
        &self,
        skill_name: &str,
        input: &str,
        ctx: &SkillContext,
    ) -> Result<String, String> {
        let skill = self
            .skills
            .get(skill_name)
            .ok_or_else(|| format!("Unknown skill: {skill_name}"))?;
        skill.run(input, ctx).await
    }

    fn descriptions(&self) -> Vec<(String, String)> {
        self.skills
            .iter()
            .map(|(name, skill)| (name.clone(), skill.description().to_string()))
            .collect()
    }
}
