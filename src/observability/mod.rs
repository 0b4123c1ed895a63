//! 可观测性
//!
//! tracing 初始化：RUST_LOG 优先，未设置时默认 info。
//! 作为库被嵌入时宿主可能已装好全局 subscriber，重复初始化按无操作处理。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub fn init() {
    let result = tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .with(fmt::layer())
        .try_init();

    if result.is_err() {
        tracing::debug!("Global tracing subscriber already installed");
    }
}
