//! Per-message request handling.

use crate::message::Message;
use crate::reply::{ReplyAssembler, ReplyReport};
use crate::store::{SessionBusy, SessionStats, SessionStore};
use crate::traits::Transport;
use crate::window::ContextWindowBuilder;
use std::sync::Arc;
use std::time::Duration;

const GREETING: &str = "Hi! I'm a bot powered by a large language model. Chat away~";
const RESET_CONFIRMATION: &str = "✅ Conversation history reset";
const NO_SESSION: &str = "📊 No conversation yet.";
const STATS_BUSY: &str = "⏳ Still answering your last message, try /stats again in a moment.";

/// A text message from a user, as produced by a transport adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    /// Session key.
    pub user_id: String,
    /// Where replies go.
    pub chat_id: i64,
    pub text: String,
}

impl IncomingMessage {
    pub fn new(user_id: impl Into<String>, chat_id: i64, text: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            chat_id,
            text: text.into(),
        }
    }
}

/// Recognized bot commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    /// `/reset` or `/clear`
    Reset,
    Stats,
    Unknown(String),
}

impl Command {
    /// Parse a leading `/command`, ignoring any `@botname` suffix and
    /// arguments. Returns `None` for plain text.
    pub fn parse(text: &str) -> Option<Self> {
        let word = text.split_whitespace().next()?.strip_prefix('/')?;
        let name = word.split('@').next().unwrap_or(word).to_lowercase();

        Some(match name.as_str() {
            "start" => Self::Start,
            "reset" | "clear" => Self::Reset,
            "stats" => Self::Stats,
            _ => Self::Unknown(name),
        })
    }
}

/// What happened to an incoming message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleOutcome {
    /// Empty text or unknown command; nothing done.
    Dropped,
    Command(Command),
    Replied(ReplyReport),
    Failed(ReplyReport),
}

/// Routes incoming messages to commands or a generated reply.
pub struct RequestHandler {
    store: Arc<SessionStore>,
    builder: ContextWindowBuilder,
    assembler: ReplyAssembler,
    transport: Arc<dyn Transport>,
}

impl RequestHandler {
    pub fn new(
        store: Arc<SessionStore>,
        builder: ContextWindowBuilder,
        assembler: ReplyAssembler,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            store,
            builder,
            assembler,
            transport,
        }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Handle one message. Never fails; problems are logged and reported to
    /// the user where that makes sense.
    pub async fn handle(&self, message: IncomingMessage) -> HandleOutcome {
        let text = message.text.trim();
        if text.is_empty() {
            tracing::debug!(user_id = %message.user_id, "Dropping empty message");
            return HandleOutcome::Dropped;
        }

        if let Some(command) = Command::parse(text) {
            return self.handle_command(&message, command).await;
        }

        // Held for the whole turn so one user's messages are strictly ordered.
        let mut session = self.store.touch(&message.user_id).await;
        session.buffer.push(Message::user(text));

        let window = self.builder.build(&mut session.buffer);
        tracing::debug!(
            user_id = %message.user_id,
            tokens = window.estimated_tokens,
            evictions = window.evictions.len(),
            messages = window.messages.len(),
            "Context window ready"
        );

        let report = self
            .assembler
            .respond(message.chat_id, &window.messages, &mut session.buffer)
            .await;

        if report.is_success() {
            HandleOutcome::Replied(report)
        } else {
            HandleOutcome::Failed(report)
        }
    }

    async fn handle_command(&self, message: &IncomingMessage, command: Command) -> HandleOutcome {
        let reply = match &command {
            Command::Start => GREETING.to_string(),
            Command::Reset => {
                self.store.clear(&message.user_id).await;
                RESET_CONFIRMATION.to_string()
            }
            Command::Stats => match self.store.stats(&message.user_id, self.builder.estimator()) {
                Ok(Some(stats)) => format_stats(&stats, self.builder.budget().max_context_tokens),
                Ok(None) => NO_SESSION.to_string(),
                Err(SessionBusy) => STATS_BUSY.to_string(),
            },
            Command::Unknown(name) => {
                tracing::debug!(user_id = %message.user_id, command = %name, "Ignoring unknown command");
                return HandleOutcome::Dropped;
            }
        };

        if let Err(e) = self.transport.deliver_text(message.chat_id, &reply).await {
            tracing::warn!(chat_id = message.chat_id, error = %e, "Failed to deliver command reply");
        }
        HandleOutcome::Command(command)
    }
}

fn format_stats(stats: &SessionStats, budget: usize) -> String {
    format!(
        "📊 Session stats\nMessages: {} ({} rounds)\nEstimated tokens: {} / {}\nActive for: {}\nIdle: {}",
        stats.messages,
        stats.rounds,
        stats.estimated_tokens,
        budget,
        format_duration(stats.age),
        format_duration(stats.idle),
    )
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::reply::testing::{RecordingTransport, Script, ScriptedGenerator};
    use crate::reply::ReplyPhase;
    use crate::tokenizer::FallbackEstimator;
    use crate::traits::GenerationParams;
    use crate::window::WindowBudget;

    struct Fixture {
        handler: RequestHandler,
        store: Arc<SessionStore>,
        generator: Arc<ScriptedGenerator>,
        transport: Arc<RecordingTransport>,
    }

    fn fixture(script: Script) -> Fixture {
        let store = Arc::new(SessionStore::new(Arc::new(ManualClock::at_epoch())));
        let generator = Arc::new(ScriptedGenerator::new(script));
        let transport = Arc::new(RecordingTransport::default());
        let builder = ContextWindowBuilder::new(
            Arc::new(FallbackEstimator::heuristic(1.0)),
            "be nice",
            WindowBudget::default(),
        );
        let assembler = ReplyAssembler::new(
            generator.clone(),
            transport.clone(),
            GenerationParams::default(),
            Duration::from_millis(100),
        );
        Fixture {
            handler: RequestHandler::new(store.clone(), builder, assembler, transport.clone()),
            store,
            generator,
            transport,
        }
    }

    #[test]
    fn parses_commands() {
        assert_eq!(Command::parse("/start"), Some(Command::Start));
        assert_eq!(Command::parse("/reset now"), Some(Command::Reset));
        assert_eq!(Command::parse("/clear@parley_bot"), Some(Command::Reset));
        assert_eq!(Command::parse("/STATS"), Some(Command::Stats));
        assert_eq!(Command::parse("/help"), Some(Command::Unknown("help".into())));
        assert_eq!(Command::parse("hello /start"), None);
        assert_eq!(Command::parse("plain text"), None);
    }

    #[test]
    fn formats_durations() {
        assert_eq!(format_duration(Duration::from_secs(5)), "5s");
        assert_eq!(format_duration(Duration::from_secs(125)), "2m 5s");
        assert_eq!(format_duration(Duration::from_secs(7260)), "2h 1m");
    }

    #[tokio::test]
    async fn empty_text_is_dropped() {
        let f = fixture(Script::Reply("unused".into()));
        let outcome = f.handler.handle(IncomingMessage::new("u1", 1, "   ")).await;

        assert_eq!(outcome, HandleOutcome::Dropped);
        assert!(f.store.is_empty());
        assert!(f.transport.deliveries().is_empty());
    }

    #[tokio::test]
    async fn reply_is_recorded_with_user_message() {
        let f = fixture(Script::Reply("Hi!".into()));
        let outcome = f.handler.handle(IncomingMessage::new("u1", 7, "  hello  ")).await;

        assert!(matches!(outcome, HandleOutcome::Replied(_)));
        let session = f.store.touch("u1").await;
        assert_eq!(
            session.buffer,
            vec![Message::user("hello"), Message::assistant("Hi!")]
        );

        let windows = f.generator.windows.lock().unwrap().clone();
        assert_eq!(windows[0], vec![Message::system("be nice"), Message::user("hello")]);
    }

    #[tokio::test]
    async fn failure_records_no_assistant_message() {
        let f = fixture(Script::Fail("quota exceeded".into()));
        let outcome = f.handler.handle(IncomingMessage::new("u1", 7, "hello")).await;

        match outcome {
            HandleOutcome::Failed(report) => assert_eq!(report.phase, ReplyPhase::Errored),
            other => panic!("expected failure, got {other:?}"),
        }
        let session = f.store.touch("u1").await;
        assert_eq!(session.buffer, vec![Message::user("hello")]);
        assert_eq!(f.transport.sent_texts(), vec!["❌ quota exceeded"]);
    }

    #[tokio::test]
    async fn history_carries_into_next_window() {
        let f = fixture(Script::Reply("ok".into()));
        f.handler.handle(IncomingMessage::new("u1", 7, "first")).await;
        f.handler.handle(IncomingMessage::new("u1", 7, "second")).await;

        let windows = f.generator.windows.lock().unwrap().clone();
        assert_eq!(windows[1].len(), 4);
        assert_eq!(windows[1][3], Message::user("second"));
    }

    #[tokio::test]
    async fn start_greets_without_session() {
        let f = fixture(Script::Reply("unused".into()));
        let outcome = f.handler.handle(IncomingMessage::new("u1", 7, "/start")).await;

        assert_eq!(outcome, HandleOutcome::Command(Command::Start));
        assert_eq!(f.transport.sent_texts(), vec![GREETING]);
        assert!(f.store.is_empty());
        assert_eq!(f.generator.calls(), 0);
    }

    #[tokio::test]
    async fn reset_clears_history() {
        let f = fixture(Script::Reply("ok".into()));
        f.handler.handle(IncomingMessage::new("u1", 7, "remember")).await;
        let outcome = f.handler.handle(IncomingMessage::new("u1", 7, "/reset")).await;

        assert_eq!(outcome, HandleOutcome::Command(Command::Reset));
        assert!(f.store.touch("u1").await.buffer.is_empty());
        assert_eq!(f.transport.sent_texts().last().map(String::as_str), Some(RESET_CONFIRMATION));
    }

    #[tokio::test]
    async fn stats_reports_session_size() {
        let f = fixture(Script::Reply("ok".into()));
        f.handler.handle(IncomingMessage::new("u1", 7, "/stats")).await;
        assert_eq!(f.transport.sent_texts(), vec![NO_SESSION]);

        f.handler.handle(IncomingMessage::new("u1", 7, "hello")).await;
        f.handler.handle(IncomingMessage::new("u1", 7, "/stats")).await;

        let stats = f.transport.sent_texts().pop().unwrap();
        assert!(stats.contains("Messages: 2 (1 rounds)"));
        assert!(stats.contains("Estimated tokens: 7 / 8000"));
    }

    #[tokio::test]
    async fn stats_answers_while_reply_in_flight() {
        let f = fixture(Script::Reply("ok".into()));
        f.handler.handle(IncomingMessage::new("u1", 7, "hello")).await;

        let in_flight = f.store.touch("u1").await;
        let outcome = tokio::time::timeout(
            Duration::from_secs(1),
            f.handler.handle(IncomingMessage::new("u1", 7, "/stats")),
        )
        .await
        .expect("/stats waited on the session lock");
        drop(in_flight);

        assert_eq!(outcome, HandleOutcome::Command(Command::Stats));
        assert_eq!(f.transport.sent_texts().last().map(String::as_str), Some(STATS_BUSY));
    }

    #[tokio::test]
    async fn unknown_command_is_dropped() {
        let f = fixture(Script::Reply("unused".into()));
        let outcome = f.handler.handle(IncomingMessage::new("u1", 7, "/frobnicate")).await;

        assert_eq!(outcome, HandleOutcome::Dropped);
        assert!(f.transport.deliveries().is_empty());
        assert_eq!(f.generator.calls(), 0);
    }

    #[tokio::test]
    async fn users_have_separate_histories() {
        let f = fixture(Script::Reply("ok".into()));
        f.handler.handle(IncomingMessage::new("alice", 1, "a")).await;
        f.handler.handle(IncomingMessage::new("bob", 2, "b")).await;

        assert_eq!(f.store.len(), 2);
        assert_eq!(f.store.touch("alice").await.buffer.len(), 2);
        assert_eq!(f.store.touch("bob").await.buffer[0], Message::user("b"));
    }
}
