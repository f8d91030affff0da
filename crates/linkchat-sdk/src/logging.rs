//! 日志初始化
//!
//! 宿主应用已经安装了全局 subscriber 时，这里什么都不做。

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// 默认过滤规则：优先读取 `RUST_LOG`
fn default_filter(debug_mode: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if debug_mode {
            EnvFilter::new("linkchat_sdk=debug,info")
        } else {
            EnvFilter::new("linkchat_sdk=info,warn")
        }
    })
}

/// 安装 fmt subscriber，重复调用安全
///
/// 返回 `true` 表示本次调用完成了安装。
pub fn init_logging(debug_mode: bool) -> bool {
    tracing_subscriber::registry()
        .with(default_filter(debug_mode))
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init_logging(true);
        // 第二次一定失败（已安装），但不能 panic
        assert!(!init_logging(false));
    }
}
