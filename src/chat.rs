//! The Chat Adapter boundary: outbound message delivery (the `ChatAdapter` trait below) plus the
//! inbound command/webapp-payload parser (`parse_command`/`parse_webapp_payload`/
//! `InboundRouter`) that maps whatever a chat-platform webhook delivers onto Orchestrator calls.
//! A real bot integration (Telegram, Discord, etc.) is out of scope; `LoggingChatAdapter` is a
//! stub good enough to drive the HTTP boundary and the Reminder Dispatcher in tests and demos.

use crate::{
    error::{CoreError, CoreResult},
    event::{CreateEventRequest, EventId, EventWindow, Orchestrator},
    share::ShareLinks,
    user::{Authorizer, UserId},
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use lazy_static::lazy_static;
use serde::Deserialize;
use std::{
    collections::{HashSet, VecDeque},
    sync::{Arc, Mutex},
};
use tracing::info;

/// An inline button attached to a message; `payload` is opaque to the adapter and interpreted by
/// the core when the corresponding callback arrives (`"join:<event_id>"`, `"reminders:<event_id>"`).
#[derive(Debug, Clone)]
pub struct Button {
    pub label: String,
    pub payload: String,
}

#[async_trait]
pub trait ChatAdapter: Send + Sync {
    async fn send_message(
        &self,
        chat_id: &str,
        thread_id: Option<&str>,
        text: &str,
        buttons: &[Button],
    ) -> Result<String>;

    async fn edit_message(
        &self,
        chat_id: &str,
        message_id: &str,
        text: &str,
        buttons: &[Button],
    ) -> Result<()>;

    async fn answer_callback(&self, callback_id: &str, text: &str, alert: bool) -> Result<()>;
}

/// Logs every outbound call and synthesizes message IDs, rather than talking to a real chat
/// backend.
#[derive(Default)]
pub struct LoggingChatAdapter {
    next_id: std::sync::atomic::AtomicU64,
}

#[async_trait]
impl ChatAdapter for LoggingChatAdapter {
    async fn send_message(
        &self,
        chat_id: &str,
        thread_id: Option<&str>,
        text: &str,
        buttons: &[Button],
    ) -> Result<String> {
        let id = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        info!(chat_id, ?thread_id, ?buttons, "send_message: {}", text);
        Ok(id.to_string())
    }

    async fn edit_message(
        &self,
        chat_id: &str,
        message_id: &str,
        text: &str,
        buttons: &[Button],
    ) -> Result<()> {
        info!(chat_id, message_id, ?buttons, "edit_message: {}", text);
        Ok(())
    }

    async fn answer_callback(&self, callback_id: &str, text: &str, alert: bool) -> Result<()> {
        info!(callback_id, alert, "answer_callback: {}", text);
        Ok(())
    }
}

/// A bounded, evictable cache of recently-processed inbound update IDs, replacing the global
/// mutable `processed_messages` set the original bot kept around forever. Owned by whichever
/// adapter implementation needs update-dedup (webhook retries, at-least-once delivery).
pub struct ProcessedUpdateCache {
    capacity: usize,
    seen: Mutex<VecDeque<String>>,
}

impl ProcessedUpdateCache {
    pub fn new(capacity: usize) -> Self {
        ProcessedUpdateCache {
            capacity,
            seen: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Returns true if `update_id` had already been recorded (i.e., this is a duplicate).
    /// Otherwise records it, evicting the oldest entry if at capacity.
    pub fn check_and_record(&self, update_id: &str) -> bool {
        let mut seen = self.seen.lock().expect("ProcessedUpdateCache lock poisoned");
        if seen.iter().any(|id| id == update_id) {
            return true;
        }
        if seen.len() >= self.capacity {
            seen.pop_front();
        }
        seen.push_back(update_id.to_owned());
        false
    }
}

lazy_static! {
    /// The slash commands the inbound parser recognizes. Anything else is reported as an
    /// unrecognized command rather than silently ignored.
    static ref KNOWN_COMMANDS: HashSet<&'static str> =
        ["/create", "/share", "/help"].into_iter().collect();
}

const HELP_TEXT: &str = "Commands:\n\
/create - open the scheduling webapp to start a new event\n\
/share - get a one-time link to forward this event to another chat\n\
/help - show this message";

/// A recognized slash command from an inbound chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundCommand {
    Create,
    Share,
    Help,
}

/// Parses `text` as one of the three recognized commands (ignoring anything after the first
/// whitespace-separated word, e.g. bot-suffixed commands like `/help@some_bot` are not matched
/// by this simple form). Returns `None` for anything else.
pub fn parse_command(text: &str) -> Option<InboundCommand> {
    let word = text.trim().split_whitespace().next()?;
    if !KNOWN_COMMANDS.contains(word) {
        return None;
    }
    match word {
        "/create" => Some(InboundCommand::Create),
        "/share" => Some(InboundCommand::Share),
        "/help" => Some(InboundCommand::Help),
        _ => unreachable!("word was just checked against KNOWN_COMMANDS"),
    }
}

/// The two shapes the scheduling webapp posts back, distinguished by `web_app_number`.
#[derive(Debug)]
pub enum WebAppPayload {
    CreateEvent(WebAppCreateEvent),
    ConfirmEvent(WebAppConfirmEvent),
}

#[derive(Debug, Deserialize)]
pub struct WebAppCreateEvent {
    pub event_name: String,
    pub event_details: String,
    pub window_start_date: NaiveDate,
    pub window_end_date: NaiveDate,
    pub daily_start_time: NaiveTime,
    pub daily_end_time: NaiveTime,
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

fn default_timezone() -> String {
    "UTC".to_owned()
}

#[derive(Debug, Deserialize)]
pub struct WebAppConfirmEvent {
    pub event_id: EventId,
    pub best_start_time: DateTime<Utc>,
    pub best_end_time: DateTime<Utc>,
}

/// Parses a webapp payload envelope (`{"web_app_number": 0 | 1, ...}`) into the matching variant.
pub fn parse_webapp_payload(value: &serde_json::Value) -> Result<WebAppPayload> {
    let number = value
        .get("web_app_number")
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| anyhow::format_err!("missing web_app_number"))?;
    match number {
        0 => Ok(WebAppPayload::CreateEvent(serde_json::from_value(
            value.clone(),
        )?)),
        1 => Ok(WebAppPayload::ConfirmEvent(serde_json::from_value(
            value.clone(),
        )?)),
        other => Err(anyhow::format_err!("unrecognized web_app_number: {}", other)),
    }
}

/// Maps inbound commands and webapp payloads onto Orchestrator/ShareLinks calls. The counterpart
/// to the outbound `ChatAdapter` above: together they are the whole Chat Adapter boundary.
pub struct InboundRouter {
    orchestrator: Arc<Orchestrator>,
    authorizer: Arc<Authorizer>,
    share_links: Arc<ShareLinks>,
}

impl InboundRouter {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        authorizer: Arc<Authorizer>,
        share_links: Arc<ShareLinks>,
    ) -> Self {
        InboundRouter {
            orchestrator,
            authorizer,
            share_links,
        }
    }

    /// Handles a `/create`, `/share`, or `/help` command, returning the reply text.
    pub async fn handle_command(
        &self,
        chat_identity: &str,
        display_name: &str,
        chat_id: &str,
        thread_id: Option<&str>,
        text: &str,
    ) -> CoreResult<String> {
        match parse_command(text) {
            Some(InboundCommand::Help) => Ok(HELP_TEXT.to_owned()),
            Some(InboundCommand::Create) => {
                Ok("Open the scheduling webapp to create an event.".to_owned())
            }
            Some(InboundCommand::Share) => {
                let user_id = self.authorizer.identity_for(chat_identity, display_name).await?;
                let token = self
                    .share_links
                    .mint(user_id, chat_id.to_owned(), thread_id.map(str::to_owned))
                    .await?;
                Ok(format!("Share this event using token: {}", token))
            }
            None => Err(CoreError::InvalidInput(format!(
                "Unrecognized command: {}",
                text.trim()
            ))),
        }
    }

    /// Handles a webapp payload delivered via the webhook, identifying (or lazily creating) the
    /// sending user through `Authorizer::identity_for`.
    pub async fn handle_webapp_payload(
        &self,
        chat_identity: &str,
        display_name: &str,
        value: &serde_json::Value,
    ) -> CoreResult<()> {
        let payload =
            parse_webapp_payload(value).map_err(|e| CoreError::InvalidInput(e.to_string()))?;
        let user_id: UserId = self.authorizer.identity_for(chat_identity, display_name).await?;

        match payload {
            WebAppPayload::CreateEvent(p) => {
                let timezone = p.timezone.parse().map_err(|_| {
                    CoreError::InvalidInput(format!("Unknown timezone: {}", p.timezone))
                })?;
                self.orchestrator
                    .create_event(CreateEventRequest {
                        creator_user_id: user_id,
                        name: p.event_name,
                        description: p.event_details,
                        window: EventWindow {
                            window_start_date: p.window_start_date,
                            window_end_date: p.window_end_date,
                            daily_start_time: p.daily_start_time,
                            daily_end_time: p.daily_end_time,
                        },
                        min_participants: 2,
                        min_block_slots: 2,
                        max_block_slots: 4,
                        timezone,
                    })
                    .await?;
                Ok(())
            }
            WebAppPayload::ConfirmEvent(p) => {
                self.orchestrator
                    .confirm_event(p.event_id, p.best_start_time, p.best_end_time)
                    .await?;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreExt as _;

    #[tokio::test]
    async fn logging_adapter_returns_ids() {
        let adapter = LoggingChatAdapter::default();
        let id1 = adapter
            .send_message("chat1", None, "hello", &[])
            .await
            .unwrap();
        let id2 = adapter
            .send_message("chat1", None, "world", &[])
            .await
            .unwrap();
        assert_ne!(id1, id2);
    }

    #[test]
    fn cache_detects_duplicates_and_evicts() {
        let cache = ProcessedUpdateCache::new(2);
        assert!(!cache.check_and_record("a"));
        assert!(cache.check_and_record("a"));
        assert!(!cache.check_and_record("b"));
        assert!(!cache.check_and_record("c")); // evicts "a"
        assert!(!cache.check_and_record("a"));
    }

    #[test]
    fn parse_command_recognizes_the_three_commands() {
        assert_eq!(parse_command("/create"), Some(InboundCommand::Create));
        assert_eq!(parse_command("/share"), Some(InboundCommand::Share));
        assert_eq!(parse_command("  /help  "), Some(InboundCommand::Help));
        assert_eq!(parse_command("/unknown"), None);
        assert_eq!(parse_command("not a command"), None);
    }

    #[test]
    fn parse_webapp_payload_dispatches_on_web_app_number() {
        let create = serde_json::json!({
            "web_app_number": 0,
            "event_name": "Standup",
            "event_details": "",
            "window_start_date": "2025-01-01",
            "window_end_date": "2025-01-07",
            "daily_start_time": "09:00:00",
            "daily_end_time": "22:00:00",
            "timezone": "UTC",
        });
        assert!(matches!(
            parse_webapp_payload(&create).unwrap(),
            WebAppPayload::CreateEvent(_)
        ));

        let confirm = serde_json::json!({
            "web_app_number": 1,
            "event_id": uuid::Uuid::new_v4(),
            "best_start_time": "2025-01-01T10:00:00Z",
            "best_end_time": "2025-01-01T11:00:00Z",
        });
        assert!(matches!(
            parse_webapp_payload(&confirm).unwrap(),
            WebAppPayload::ConfirmEvent(_)
        ));

        let unknown = serde_json::json!({ "web_app_number": 7 });
        assert!(parse_webapp_payload(&unknown).is_err());
    }

    fn inbound_router() -> (InboundRouter, Arc<crate::store::InMemoryStore>) {
        let store = Arc::new(crate::store::InMemoryStore::new());
        let clock = Arc::new(crate::clock::test::TestClock::new(chrono::Utc::now()));
        let authorizer = Arc::new(Authorizer::new(store.clone()));
        let orchestrator = Arc::new(Orchestrator::new(store.clone(), clock, authorizer.clone()));
        let share_links = Arc::new(ShareLinks::new(store.clone(), std::time::Duration::from_secs(900)));
        (InboundRouter::new(orchestrator, authorizer, share_links), store)
    }

    #[tokio::test]
    async fn share_command_mints_a_consumable_token() {
        let (router, _store) = inbound_router();
        let reply = router
            .handle_command("tg:1", "Alice", "chat1", None, "/share")
            .await
            .unwrap();
        assert!(reply.contains("token"));
    }

    #[tokio::test]
    async fn webapp_create_payload_creates_an_event() {
        let (router, store) = inbound_router();
        let payload = serde_json::json!({
            "web_app_number": 0,
            "event_name": "Standup",
            "event_details": "",
            "window_start_date": "2025-01-01",
            "window_end_date": "2025-01-07",
            "daily_start_time": "09:00:00",
            "daily_end_time": "22:00:00",
            "timezone": "UTC",
        });
        router
            .handle_webapp_payload("tg:1", "Alice", &payload)
            .await
            .unwrap();
        let events: Vec<crate::store::EventRow> = store
            .get_many("events", "name", "Standup")
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn unrecognized_command_is_rejected() {
        let (router, _store) = inbound_router();
        let result = router
            .handle_command("tg:1", "Alice", "chat1", None, "/nope")
            .await;
        assert!(matches!(result, Err(CoreError::InvalidInput(_))));
    }
}
