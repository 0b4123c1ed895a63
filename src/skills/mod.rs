//! 技能系统：技能抽象、注册表与内置测试技能

pub mod echo;
pub mod registry;

pub use echo::EchoSkill;
pub use registry::{Skill, SkillContext, SkillExecutor, SkillRegistry};
