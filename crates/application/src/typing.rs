//! 输入提示的发送端
//!
//! 第一次按键立即发布“正在输入”，之后在静默窗口内不再重复发布；窗口内没有新的按键时
//! 自动发布“停止输入”，显式调用 `stop_typing_indicator` 时立即发布并取消定时器。

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use domain::ChannelId;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

use crate::presence::TransportError;

/// 输入事件的发布目标
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait TypingPublisher: Send + Sync {
    async fn publish_typing(&self, channel_id: ChannelId) -> Result<(), TransportError>;

    async fn publish_stopped_typing(&self, channel_id: ChannelId) -> Result<(), TransportError>;
}

#[derive(Default)]
struct TriggerState {
    channel: Option<ChannelId>,
    typing: bool,
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

impl TriggerState {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

struct TriggerShared {
    publisher: Arc<dyn TypingPublisher>,
    idle: Duration,
    state: Mutex<TriggerState>,
}

impl TriggerShared {
    async fn publish_stopped(&self, channel_id: ChannelId) {
        if let Err(e) = self.publisher.publish_stopped_typing(channel_id).await {
            warn!(channel_id = %channel_id, error = %e, "发布停止输入事件失败");
        }
    }

    async fn idle_elapsed(&self, generation: u64) {
        let channel = {
            let mut state = self.state.lock().await;
            if state.generation != generation || !state.typing {
                return;
            }
            state.typing = false;
            state.timer = None;
            state.channel
        };

        if let Some(channel_id) = channel {
            debug!(channel_id = %channel_id, "输入静默超时，自动停止");
            self.publish_stopped(channel_id).await;
        }
    }
}

/// 合并连续按键的输入提示发布器
pub struct TypingTrigger {
    shared: Arc<TriggerShared>,
}

impl TypingTrigger {
    pub fn new(publisher: Arc<dyn TypingPublisher>, idle: Duration) -> Self {
        Self {
            shared: Arc::new(TriggerShared {
                publisher,
                idle,
                state: Mutex::new(TriggerState::default()),
            }),
        }
    }

    /// 切换当前频道；正在输入时先对旧频道发布停止输入
    pub async fn bind_channel(&self, channel: Option<ChannelId>) {
        let previous = {
            let mut state = self.shared.state.lock().await;
            if state.channel == channel {
                return;
            }
            state.cancel_timer();
            state.generation += 1;
            let was_typing = std::mem::take(&mut state.typing);
            let previous = std::mem::replace(&mut state.channel, channel);
            previous.filter(|_| was_typing)
        };

        if let Some(channel_id) = previous {
            self.shared.publish_stopped(channel_id).await;
        }
    }

    pub async fn channel(&self) -> Option<ChannelId> {
        self.shared.state.lock().await.channel
    }

    pub async fn is_typing(&self) -> bool {
        self.shared.state.lock().await.typing
    }

    /// 本地有输入活动
    ///
    /// 没有绑定频道时什么也不做。
    pub async fn trigger_typing_indicator(&self) {
        let (channel_id, first) = {
            let mut state = self.shared.state.lock().await;
            let Some(channel_id) = state.channel else {
                return;
            };

            let first = !state.typing;
            state.typing = true;
            state.generation += 1;
            state.cancel_timer();

            let generation = state.generation;
            let idle = self.shared.idle;
            let shared: Weak<TriggerShared> = Arc::downgrade(&self.shared);
            state.timer = Some(tokio::spawn(async move {
                sleep(idle).await;
                if let Some(shared) = shared.upgrade() {
                    shared.idle_elapsed(generation).await;
                }
            }));
            (channel_id, first)
        };

        if first {
            if let Err(e) = self.shared.publisher.publish_typing(channel_id).await {
                warn!(channel_id = %channel_id, error = %e, "发布输入事件失败");
            }
        }
    }

    /// 立即停止（例如消息已发送）；当前没有在输入时什么也不做
    pub async fn stop_typing_indicator(&self) {
        let channel = {
            let mut state = self.shared.state.lock().await;
            state.cancel_timer();
            state.generation += 1;
            if !std::mem::take(&mut state.typing) {
                return;
            }
            state.channel
        };

        if let Some(channel_id) = channel {
            self.shared.publish_stopped(channel_id).await;
        }
    }
}

impl Drop for TypingTrigger {
    fn drop(&mut self) {
        if let Ok(mut state) = self.shared.state.try_lock() {
            state.cancel_timer();
        }
    }
}
