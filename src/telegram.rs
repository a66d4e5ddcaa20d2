use crate::config::TelegramConfig;
use crate::format;
use crate::metrics::Metrics;
use crate::router::{
    ChatInfo, ChatKind, Command, CommandRouter, Invocation, Prepared, SenderIdentity,
};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use teloxide::prelude::*;
use teloxide::types::{BotCommand, Chat, ParseMode, User};
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

const COMMAND_FAILED_TEXT: &str = "❌ Could not collect metrics, please try again later.";

#[derive(Debug, Error)]
pub enum TelegramError {
    #[error("telegram request failed: {0}")]
    Request(#[from] teloxide::RequestError),
}

#[derive(Clone)]
struct BotRuntime {
    router: Arc<CommandRouter>,
    metrics: Arc<Metrics>,
    limiter: Arc<Mutex<RateLimiter>>,
}

/// Serves chat commands until `shutdown` flips.
pub async fn run_bot(
    bot: Bot,
    cfg: TelegramConfig,
    router: Arc<CommandRouter>,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), TelegramError> {
    let me = bot.get_me().await?;
    info!(username = me.username(), "telegram bot authorized");

    if let Err(err) = bot.set_my_commands(bot_commands()).await {
        warn!(error = %err, "failed to register the command menu");
    }

    let runtime = BotRuntime {
        router,
        metrics,
        limiter: Arc::new(Mutex::new(RateLimiter::new(cfg.rate_limit_per_minute))),
    };

    let handler = dptree::entry().branch(Update::filter_message().endpoint(handle_message));

    let mut dispatcher = Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![runtime])
        .build();

    let mut dispatch_handle = tokio::spawn(async move {
        dispatcher.dispatch().await;
    });
    info!("telegram bot started");

    tokio::select! {
        _ = shutdown.changed() => {
            dispatch_handle.abort();
            let _ = (&mut dispatch_handle).await;
            info!("telegram bot stopped");
            Ok(())
        }
        result = &mut dispatch_handle => {
            match result {
                Ok(()) => Ok(()),
                Err(join_err) if join_err.is_cancelled() => Ok(()),
                Err(join_err) => {
                    warn!(error = %join_err, "telegram dispatcher task failed");
                    Ok(())
                }
            }
        }
    }
}

fn bot_commands() -> Vec<BotCommand> {
    Command::ALL
        .into_iter()
        .map(|c| BotCommand::new(c.as_str(), c.description()))
        .collect()
}

async fn handle_message(bot: Bot, msg: Message, runtime: BotRuntime) -> ResponseResult<()> {
    let Some(text) = msg.text() else {
        return Ok(());
    };
    if !text.starts_with('/') {
        return Ok(());
    }

    let chat_id = msg.chat.id;
    if !runtime.limiter.lock().await.allow(chat_id.0, now_unix()) {
        debug!(chat_id = chat_id.0, "rate limited");
        bot.send_message(chat_id, format::RATE_LIMITED_TEXT).await?;
        return Ok(());
    }

    let invocation = Invocation {
        sender: msg.from().map(sender_identity).unwrap_or_default(),
        chat: chat_info(&msg.chat),
    };

    let command = match runtime.router.prepare(&invocation.sender.id, text) {
        Ok(Prepared::Ready(command)) => command,
        Ok(Prepared::Denied(reply)) => {
            let name = Command::parse(text).map(Command::as_str).unwrap_or("unknown");
            runtime.metrics.inc_command(name, "denied");
            bot.send_message(chat_id, reply.text).await?;
            return Ok(());
        }
        Err(err) => {
            debug!(error = %err, chat_id = chat_id.0, "ignoring message");
            return Ok(());
        }
    };

    let progress = match command.progress_text() {
        Some(text) => Some(bot.send_message(chat_id, text).await?),
        None => None,
    };

    let result = runtime.router.execute(command, &invocation).await;

    if let Some(progress) = progress {
        if let Err(err) = bot.delete_message(chat_id, progress.id).await {
            debug!(error = %err, "failed to delete progress message");
        }
    }

    match result {
        Ok(reply) => {
            runtime.metrics.inc_command(command.as_str(), "ok");
            bot.send_message(chat_id, reply.text)
                .parse_mode(ParseMode::Html)
                .await?;
        }
        Err(err) => {
            runtime.metrics.inc_command(command.as_str(), "error");
            warn!(command = command.as_str(), error = %err, "command failed");
            bot.send_message(chat_id, COMMAND_FAILED_TEXT).await?;
        }
    }
    Ok(())
}

fn sender_identity(user: &User) -> SenderIdentity {
    SenderIdentity {
        id: user.id.0.to_string(),
        username: user.username.clone(),
        first_name: Some(user.first_name.clone()),
        last_name: user.last_name.clone(),
    }
}

fn chat_info(chat: &Chat) -> ChatInfo {
    let kind = if chat.is_private() {
        ChatKind::Private
    } else if chat.is_supergroup() {
        ChatKind::Supergroup
    } else if chat.is_group() {
        ChatKind::Group
    } else {
        ChatKind::Channel
    };
    ChatInfo {
        id: chat.id.0,
        kind,
        title: chat.title().map(str::to_string),
    }
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// Sliding one-minute window per chat.
struct RateLimiter {
    limit_per_minute: u32,
    timestamps_by_chat: HashMap<i64, VecDeque<i64>>,
}

impl RateLimiter {
    fn new(limit_per_minute: u32) -> Self {
        Self {
            limit_per_minute,
            timestamps_by_chat: HashMap::new(),
        }
    }

    fn allow(&mut self, chat_id: i64, now_unix: i64) -> bool {
        // Chats with nothing inside the window are forgotten.
        self.timestamps_by_chat
            .retain(|_, queue| queue.back().is_some_and(|&ts| now_unix - ts < 60));

        let queue = self.timestamps_by_chat.entry(chat_id).or_default();
        while let Some(ts) = queue.front().copied() {
            if now_unix - ts >= 60 {
                queue.pop_front();
            } else {
                break;
            }
        }

        if queue.len() >= self.limit_per_minute as usize {
            return false;
        }

        queue.push_back(now_unix);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limiter_enforces_limit() {
        let mut limiter = RateLimiter::new(2);
        assert!(limiter.allow(1, 10));
        assert!(limiter.allow(1, 20));
        assert!(!limiter.allow(1, 30));
        assert!(limiter.allow(1, 71));
    }

    #[test]
    fn rate_limiter_tracks_chats_separately() {
        let mut limiter = RateLimiter::new(1);
        assert!(limiter.allow(1, 10));
        assert!(!limiter.allow(1, 11));
        assert!(limiter.allow(2, 11));
    }

    #[test]
    fn rate_limiter_forgets_idle_chats() {
        let mut limiter = RateLimiter::new(5);
        assert!(limiter.allow(1, 10));
        assert!(limiter.allow(2, 30));
        assert_eq!(limiter.timestamps_by_chat.len(), 2);

        assert!(limiter.allow(2, 75));
        assert_eq!(limiter.timestamps_by_chat.len(), 1);
        assert!(!limiter.timestamps_by_chat.contains_key(&1));

        assert!(limiter.allow(3, 200));
        assert_eq!(limiter.timestamps_by_chat.keys().copied().collect::<Vec<_>>(), vec![3]);
    }

    #[test]
    fn command_menu_lists_every_command() {
        let commands = bot_commands();
        assert_eq!(commands.len(), Command::ALL.len());
        assert!(commands
            .iter()
            .any(|c| c.command == "groupid" && c.description == "Show the group ID"));
    }
}
