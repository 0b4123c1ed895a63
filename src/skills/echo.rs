//! Echo 技能（测试用）

use async_trait::async_trait;

use crate::skills::{Skill, SkillContext};

/// Echo 技能：回显输入文本
pub struct EchoSkill;

#[async_trait]
impl Skill for EchoSkill {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo the input text back unchanged (for testing)"
    }

    async fn run(&self, input: &str, _ctx: &SkillContext) -> Result<String, String> {
        Ok(input.to_string())
    }
}
