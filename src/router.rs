use crate::collectors::{MetricsSource, SourceError};
use crate::format;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

const TOP_PROCESS_LIMIT: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Help,
    Start,
    Info,
    Status,
    Cpu,
    Ram,
    Disk,
    Gpu,
    Network,
    Top,
    UserId,
    GroupId,
    Author,
}

impl Command {
    pub const ALL: [Command; 13] = [
        Self::Help,
        Self::Start,
        Self::Info,
        Self::Status,
        Self::Cpu,
        Self::Ram,
        Self::Disk,
        Self::Gpu,
        Self::Network,
        Self::Top,
        Self::UserId,
        Self::GroupId,
        Self::Author,
    ];

    /// Accepts `/Status`, `status` and `/status@some_bot`, ignoring arguments.
    pub fn parse(text: &str) -> Option<Self> {
        let first = text.split_whitespace().next()?;
        let name = first.strip_prefix('/').unwrap_or(first);
        let normalized = name.split('@').next()?.to_lowercase();
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == normalized.as_str())
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Help => "help",
            Self::Start => "start",
            Self::Info => "info",
            Self::Status => "status",
            Self::Cpu => "cpu",
            Self::Ram => "ram",
            Self::Disk => "disk",
            Self::Gpu => "gpu",
            Self::Network => "network",
            Self::Top => "top",
            Self::UserId => "userid",
            Self::GroupId => "groupid",
            Self::Author => "author",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::Help => "Show the command list",
            Self::Start => "Start the bot",
            Self::Info => "System information",
            Self::Status => "System status",
            Self::Cpu => "CPU details",
            Self::Ram => "RAM and swap",
            Self::Disk => "Disk usage",
            Self::Gpu => "GPU details",
            Self::Network => "Network details",
            Self::Top => "Top processes",
            Self::UserId => "Show your user ID",
            Self::GroupId => "Show the group ID",
            Self::Author => "About this bot",
        }
    }

    /// Transient message shown while a slow command runs.
    pub fn progress_text(self) -> Option<&'static str> {
        match self {
            Self::Top => Some(format::TOP_PROGRESS_TEXT),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("unknown command {0:?}")]
    NotFound(String),
    #[error(transparent)]
    Source(#[from] SourceError),
}

/// Sender ids allowed to use the bot. An empty set allows everyone.
#[derive(Debug, Clone, Default)]
pub struct AuthorizedSenders {
    ids: HashSet<String>,
}

impl AuthorizedSenders {
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ids: ids
                .into_iter()
                .map(Into::into)
                .map(|s: String| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn allows(&self, sender_id: &str) -> bool {
        self.is_open() || self.ids.contains(sender_id)
    }
}

#[derive(Debug, Clone, Default)]
pub struct SenderIdentity {
    pub id: String,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatKind {
    Private,
    Group,
    Supergroup,
    Channel,
}

impl ChatKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Private => "private",
            Self::Group => "group",
            Self::Supergroup => "supergroup",
            Self::Channel => "channel",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatInfo {
    pub id: i64,
    pub kind: ChatKind,
    pub title: Option<String>,
}

impl ChatInfo {
    pub fn is_group(&self) -> bool {
        matches!(self.kind, ChatKind::Group | ChatKind::Supergroup)
    }
}

/// Who sent a command and where.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub sender: SenderIdentity,
    pub chat: ChatInfo,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub text: String,
}

impl Reply {
    fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Prepared {
    /// Sender is not on the allow-list; reply with the text and stop.
    Denied(Reply),
    Ready(Command),
}

pub struct CommandRouter {
    source: Arc<dyn MetricsSource>,
    senders: AuthorizedSenders,
}

impl CommandRouter {
    pub fn new(source: Arc<dyn MetricsSource>, senders: AuthorizedSenders) -> Self {
        Self { source, senders }
    }

    /// Resolves the command and checks the sender. Touches no metrics.
    pub fn prepare(&self, sender_id: &str, name: &str) -> Result<Prepared, DispatchError> {
        let command =
            Command::parse(name).ok_or_else(|| DispatchError::NotFound(name.to_string()))?;
        if !self.senders.allows(sender_id) {
            debug!(sender = sender_id, command = command.as_str(), "sender not authorized");
            return Ok(Prepared::Denied(Reply::new(format::NOT_AUTHORIZED_TEXT)));
        }
        Ok(Prepared::Ready(command))
    }

    /// Runs an already authorized command.
    pub async fn execute(
        &self,
        command: Command,
        invocation: &Invocation,
    ) -> Result<Reply, DispatchError> {
        let text = match command {
            Command::Help | Command::Start => format::help_text(),
            Command::UserId => format::format_userid(&invocation.sender),
            Command::GroupId => format::format_groupid(&invocation.chat),
            Command::Author => format::author_text(),
            _ => {
                let source = Arc::clone(&self.source);
                tokio::task::spawn_blocking(move || render_metrics(command, source.as_ref()))
                    .await
                    .map_err(|e| SourceError::Join(e.to_string()))??
            }
        };
        Ok(Reply::new(text))
    }

    pub async fn dispatch(
        &self,
        name: &str,
        invocation: &Invocation,
    ) -> Result<Reply, DispatchError> {
        match self.prepare(&invocation.sender.id, name)? {
            Prepared::Denied(reply) => Ok(reply),
            Prepared::Ready(command) => self.execute(command, invocation).await,
        }
    }
}

/// Blocking: one fresh sample plus the command's secondary pass.
fn render_metrics(command: Command, source: &dyn MetricsSource) -> Result<String, SourceError> {
    let text = match command {
        Command::Info => format::format_info(&source.sample()?),
        Command::Status => format::format_status(&source.sample()?),
        Command::Cpu => {
            let snapshot = source.sample()?;
            format::format_cpu(&snapshot, &source.cpu_per_core()?)
        }
        Command::Ram => {
            let snapshot = source.sample()?;
            format::format_ram(&snapshot, &source.swap()?)
        }
        Command::Disk => format::format_disk(&source.sample()?),
        Command::Gpu => format::format_gpu(&source.sample()?),
        Command::Network => {
            let snapshot = source.sample()?;
            format::format_network(&snapshot, &source.interfaces()?)
        }
        Command::Top => format::format_top(&source.top_processes(TOP_PROCESS_LIMIT)?),
        Command::Help
        | Command::Start
        | Command::UserId
        | Command::GroupId
        | Command::Author => {
            return Err(SourceError::Unavailable(format!(
                "{} does not read metrics",
                command.as_str()
            )))
        }
    };
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::fake::FakeSource;

    fn invocation(sender: &str) -> Invocation {
        Invocation {
            sender: SenderIdentity {
                id: sender.to_string(),
                username: Some("ops".to_string()),
                first_name: Some("Ops".to_string()),
                last_name: None,
            },
            chat: ChatInfo {
                id: 77,
                kind: ChatKind::Private,
                title: None,
            },
        }
    }

    fn router(source: Arc<FakeSource>, allowed: &[&str]) -> CommandRouter {
        CommandRouter::new(source, AuthorizedSenders::new(allowed.iter().copied()))
    }

    #[test]
    fn command_names_are_normalized() {
        assert_eq!(Command::parse("/STATUS@host_bot extra"), Some(Command::Status));
        assert_eq!(Command::parse("cpu"), Some(Command::Cpu));
        assert_eq!(Command::parse("  /groupid  "), Some(Command::GroupId));
        assert_eq!(Command::parse("/"), None);
        assert_eq!(Command::parse("/reboot"), None);
        assert_eq!(Command::parse(""), None);
    }

    #[test]
    fn only_top_has_progress_text() {
        for c in Command::ALL {
            assert_eq!(c.progress_text().is_some(), c == Command::Top, "{c:?}");
        }
    }

    #[tokio::test]
    async fn unauthorized_sender_gets_denial_without_sampling() {
        let source = Arc::new(FakeSource::default());
        let r = router(source.clone(), &["111"]);

        for name in ["/status", "/top", "/help", "/userid"] {
            let reply = r.dispatch(name, &invocation("999")).await.expect("denial is a reply");
            assert_eq!(reply.text, format::NOT_AUTHORIZED_TEXT);
        }
        assert_eq!(source.sample_count(), 0);
        assert_eq!(source.secondary_count(), 0);
    }

    #[tokio::test]
    async fn empty_allow_list_admits_everyone() {
        let source = Arc::new(FakeSource::default());
        let r = router(source.clone(), &[]);
        let reply = r.dispatch("/status", &invocation("anyone")).await.expect("status");
        assert!(reply.text.contains("SYSTEM STATUS"));
        assert_eq!(source.sample_count(), 1);
    }

    #[tokio::test]
    async fn unknown_command_is_not_found() {
        let r = router(Arc::new(FakeSource::default()), &[]);
        let err = r.dispatch("/reboot", &invocation("1")).await.expect_err("unknown");
        assert!(matches!(err, DispatchError::NotFound(name) if name == "/reboot"));
    }

    #[tokio::test]
    async fn every_metric_command_samples_fresh() {
        let source = Arc::new(FakeSource::default());
        let r = router(source.clone(), &["1"]);
        r.dispatch("/info", &invocation("1")).await.expect("info");
        r.dispatch("/info", &invocation("1")).await.expect("info");
        assert_eq!(source.sample_count(), 2);
    }

    #[tokio::test]
    async fn identity_commands_do_not_sample() {
        let source = Arc::new(FakeSource::default());
        let r = router(source.clone(), &["1"]);
        for name in ["/help", "/start", "/userid", "/groupid", "/author"] {
            r.dispatch(name, &invocation("1")).await.expect("reply");
        }
        assert_eq!(source.sample_count(), 0);
        assert_eq!(source.secondary_count(), 0);
    }

    #[tokio::test]
    async fn secondary_passes_run_for_detail_commands() {
        let source = Arc::new(FakeSource::default());
        let r = router(source.clone(), &[]);

        let cpu = r.dispatch("/cpu", &invocation("1")).await.expect("cpu");
        assert!(cpu.text.contains("Core 1: 20.5%"));

        let top = r.dispatch("/top", &invocation("1")).await.expect("top");
        let postgres = top.text.find("postgres").expect("postgres listed");
        let init = top.text.find("init").expect("init listed");
        assert!(postgres < init);

        let net = r.dispatch("/network", &invocation("1")).await.expect("network");
        assert!(net.text.contains("eth0"));

        assert_eq!(source.secondary_count(), 3);
        // top needs no snapshot
        assert_eq!(source.sample_count(), 2);
    }

    #[tokio::test]
    async fn source_failure_surfaces_as_error() {
        let source = Arc::new(FakeSource {
            fail: true,
            ..FakeSource::default()
        });
        let r = router(source, &[]);
        let err = r.dispatch("/disk", &invocation("1")).await.expect_err("fails");
        assert!(matches!(err, DispatchError::Source(_)));
    }

    #[test]
    fn allow_list_ignores_blank_entries() {
        let senders = AuthorizedSenders::new(vec![" 42 ".to_string(), String::new()]);
        assert!(!senders.is_open());
        assert!(senders.allows("42"));
        assert!(!senders.allows(""));
    }
}
