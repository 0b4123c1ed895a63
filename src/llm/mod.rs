//! LLM 层：客户端抽象与测试实现（具体后端由宿主注入）

pub mod mock;
pub mod traits;

pub use mock::MockLlmClient;
pub use traits::{LlmClient, Message, Role};
