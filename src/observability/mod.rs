//! 可观测性：tracing 订阅者初始化
//!
//! RUST_LOG 优先；否则使用 [logging].level。format = "json" 时输出结构化 JSON 行。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingSection;

/// 初始化全局订阅者；重复调用时返回 false（测试与二进制可以各自调用）
pub fn init(logging: &LoggingSection) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(filter);
    let result = if logging.format.eq_ignore_ascii_case("json") {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer()).try_init()
    };
    result.is_ok()
}
