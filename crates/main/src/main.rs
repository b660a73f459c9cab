//! 在线状态节点入口
//!
//! 连接 Redis 传输，以本地用户身份订阅群组频道，并把在线/输入状态变更写入日志，
//! 直到收到 Ctrl-C。

use std::{env, sync::Arc};

use application::{ChannelMember, PresenceChange, PresenceContext, PubSubTransport, SystemClock};
use config::AppConfig;
use domain::{ChannelScope, GroupId, UserId};
use infrastructure::RedisPubSubTransport;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load()?;

    // 初始化日志，RUST_LOG 优先于配置文件
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.filter)),
        )
        .init();

    let user_id = match env::var("CHATROOM_USER_ID") {
        Ok(raw) => raw.parse::<UserId>()?,
        Err(_) => UserId::generate(),
    };
    let user_name = env::var("CHATROOM_USER_NAME").unwrap_or_else(|_| format!("user-{user_id}"));
    let group_id = match env::var("CHATROOM_GROUP_ID") {
        Ok(raw) => raw.parse::<GroupId>()?,
        Err(_) => GroupId::generate(),
    };
    let scope = ChannelScope::Group(group_id);

    tracing::info!("连接 Redis: {}", config.redis.url);
    let redis = Arc::new(
        RedisPubSubTransport::connect(&config.redis)
            .await?
            .with_event_buffer(config.presence.event_buffer),
    );
    let transport: Arc<dyn PubSubTransport> = redis.clone();

    let context = PresenceContext::from_config(
        transport,
        Arc::new(SystemClock::default()),
        ChannelMember::new(user_id, user_name.clone()),
        &config.presence,
    );
    let mut changes = context.store().subscribe();

    context.subscribe(scope).await?;
    tracing::info!(user_id = %user_id, user_name = %user_name, channel = %scope, "已加入频道");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("收到退出信号");
                break;
            }
            change = changes.recv() => match change {
                Ok(change) => log_change(&change),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "在线状态通知积压，部分变更未记录");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    context.shutdown().await;
    redis.shutdown().await;
    Ok(())
}

fn log_change(change: &PresenceChange) {
    match change {
        PresenceChange::StatusUpdated(record) => {
            tracing::info!(user_id = %record.user_id, status = %record.status, "在线状态更新");
        }
        PresenceChange::Removed(user_id) => {
            tracing::info!(user_id = %user_id, "用户离开");
        }
        PresenceChange::TypingStarted(typing) => {
            tracing::info!(user_id = %typing.user_id, channel_id = %typing.channel_id, "正在输入");
        }
        PresenceChange::TypingStopped { user_id, channel_id } => {
            tracing::info!(user_id = %user_id, channel_id = %channel_id, "停止输入");
        }
        PresenceChange::Cleared => tracing::debug!("在线状态已清空"),
    }
}
