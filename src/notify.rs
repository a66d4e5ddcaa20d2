use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::ParseMode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("telegram request failed: {0}")]
    Request(#[from] teloxide::RequestError),
}

/// Best-effort delivery of a formatted message to a chat.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, destination: i64, text: &str) -> Result<(), NotifyError>;
}

#[derive(Clone)]
pub struct TelegramNotifier {
    bot: Bot,
}

impl TelegramNotifier {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, destination: i64, text: &str) -> Result<(), NotifyError> {
        self.bot
            .send_message(ChatId(destination), text.to_string())
            .parse_mode(ParseMode::Html)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod recording {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct RecordingNotifier {
        pub sent: Mutex<Vec<(i64, String)>>,
        pub fail: AtomicBool,
    }

    impl RecordingNotifier {
        pub fn failing() -> Self {
            let n = Self::default();
            n.fail.store(true, Ordering::SeqCst);
            n
        }

        pub fn messages(&self) -> Vec<(i64, String)> {
            self.sent.lock().expect("notifier lock").clone()
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn send(&self, destination: i64, text: &str) -> Result<(), NotifyError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(NotifyError::Request(teloxide::RequestError::Api(
                    teloxide::ApiError::BotBlocked,
                )));
            }
            self.sent
                .lock()
                .expect("notifier lock")
                .push((destination, text.to_string()));
            Ok(())
        }
    }
}
