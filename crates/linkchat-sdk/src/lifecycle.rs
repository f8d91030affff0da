//! SDK 生命周期管理
//!
//! 管理 App 前后台切换，统一通知各模块。

use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::Result;

/// App 所处的前后台状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppState {
    Foreground,
    Background,
}

/// 生命周期回调 Hook
///
/// 各模块通过实现此 trait 来响应生命周期变化
#[async_trait]
pub trait LifecycleHook: Send + Sync {
    /// App 切换到后台时调用
    async fn on_background(&self) -> Result<()> {
        Ok(())
    }

    /// App 切换到前台时调用
    async fn on_foreground(&self) -> Result<()>;
}

/// 生命周期管理器
pub struct LifecycleManager {
    hooks: RwLock<Vec<Arc<dyn LifecycleHook>>>,
    state: RwLock<AppState>,
}

impl LifecycleManager {
    pub fn new() -> Self {
        Self {
            hooks: RwLock::new(Vec::new()),
            state: RwLock::new(AppState::Foreground),
        }
    }

    pub fn hook_count(&self) -> usize {
        self.hooks.read().len()
    }

    pub fn app_state(&self) -> AppState {
        *self.state.read()
    }

    /// 注册生命周期回调 Hook
    pub fn register_hook(&self, hook: Arc<dyn LifecycleHook>) {
        let mut hooks = self.hooks.write();
        hooks.push(hook);
        info!("[Lifecycle] ✅ Hook 已注册: 当前共 {} 个", hooks.len());
    }

    /// 会话结束时清空
    pub fn clear_hooks(&self) {
        self.hooks.write().clear();
    }

    /// 通知所有 Hook：App 切换到后台
    ///
    /// 按注册顺序执行，某个 Hook 失败只记录，其余照常执行；返回第一个错误
    pub async fn notify_background(&self) -> Result<()> {
        *self.state.write() = AppState::Background;
        info!("[Lifecycle] 🔄 App 切换到后台");
        let hooks = self.hooks.read().clone();
        let mut first_error = None;
        for (index, hook) in hooks.iter().enumerate() {
            if let Err(e) = hook.on_background().await {
                warn!("[Lifecycle] ⚠️ Hook #{} 后台切换失败: {}", index, e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// 通知所有 Hook：App 切换到前台
    pub async fn notify_foreground(&self) -> Result<()> {
        *self.state.write() = AppState::Foreground;
        info!("[Lifecycle] 🔄 App 切换到前台");
        let hooks = self.hooks.read().clone();
        let mut first_error = None;
        for (index, hook) in hooks.iter().enumerate() {
            if let Err(e) = hook.on_foreground().await {
                warn!("[Lifecycle] ⚠️ Hook #{} 前台切换失败: {}", index, e);
                first_error.get_or_insert(e);
            }
        }
        if first_error.is_none() {
            info!("[Lifecycle] ✅ 所有模块前台切换完成");
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl Default for LifecycleManager {
    fn default() -> Self {
        Self::new()
    }
}
