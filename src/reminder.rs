//! The Reminder Dispatcher: a periodic tick that performs three Store-query passes and emits
//! messages through the Chat Adapter. Borrows the `EventScheduler`'s background-loop shape
//! (`tokio::spawn` + `tracing::error!`-and-continue per item, graceful stop on drop) from
//! `event/alert.rs`, but replaces its priority-queue-of-scheduled-actions with the spec's
//! fixed-cadence, three-pass design grounded on `reminder_service.py`.

use crate::{
    chat::{Button, ChatAdapter},
    clock::Clock,
    store::{ConfirmationRow, EventChatRow, EventRow, Store, StoreExt},
};
use chrono::{Duration, Utc};
use futures::future::{abortable, AbortHandle};
use std::sync::Arc;
use tracing::{error, info};

pub const EVENT_REMINDER_HOUR_OFFSET: i64 = 2;

pub struct ReminderDispatcherConfig {
    pub tick: std::time::Duration,
    pub imminent_window: Duration,
    pub imminent_cooldown: Duration,
}

impl Default for ReminderDispatcherConfig {
    fn default() -> Self {
        ReminderDispatcherConfig {
            tick: std::time::Duration::from_secs(60),
            imminent_window: Duration::hours(EVENT_REMINDER_HOUR_OFFSET),
            imminent_cooldown: Duration::minutes(30),
        }
    }
}

pub struct ReminderDispatcher {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    chat: Arc<dyn ChatAdapter>,
    config: ReminderDispatcherConfig,
}

impl ReminderDispatcher {
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        chat: Arc<dyn ChatAdapter>,
        config: ReminderDispatcherConfig,
    ) -> Arc<Self> {
        Arc::new(ReminderDispatcher {
            store,
            clock,
            chat,
            config,
        })
    }

    /// Spawns the background tick loop, returning a handle that stops the loop when aborted or
    /// dropped (mirroring `EventScheduler::start`'s use of `futures::future::abortable`).
    pub fn start(self: &Arc<Self>) -> AbortHandle {
        let dispatcher = self.clone();
        let (task, handle) = abortable(async move {
            let mut interval = tokio::time::interval(dispatcher.config.tick);
            loop {
                interval.tick().await;
                dispatcher.run_once().await;
            }
        });
        tokio::spawn(task);
        handle
    }

    /// Runs the past-due sweep and all three reminder passes once. Exposed directly so tests
    /// (and an externally-triggered `/api/reminders` endpoint) don't need to wait on the tick
    /// interval.
    pub async fn run_once(&self) {
        if let Err(err) = self.transition_past_events().await {
            error!("past-event transition pass failed: {:?}", err);
        }
        if let Err(err) = self.send_daily_availability_nudges().await {
            error!("daily availability nudge pass failed: {:?}", err);
        }
        if let Err(err) = self.send_daily_event_countdowns().await {
            error!("daily event countdown pass failed: {:?}", err);
        }
        if let Err(err) = self.send_imminent_reminders().await {
            error!("imminent reminder pass failed: {:?}", err);
        }
    }

    /// Moves `confirmed` events whose `confirmed_end_instant` has elapsed to `past`, mirroring
    /// the teacher's `EventAction::Cleanup` sweep. Nothing downstream reads `past` events, so
    /// this only needs to run before the other passes, not atomically with them.
    async fn transition_past_events(&self) -> anyhow::Result<()> {
        let now = self.clock.now();
        let rows = self.store.get_past_due_confirmed_events(now).await?;
        for value in rows {
            let confirmation: ConfirmationRow = serde_json::from_value(value)?;
            let transitioned = self
                .store
                .update_raw(
                    "events",
                    "event_id",
                    &confirmation.event_id.to_string(),
                    serde_json::json!({ "state": "past" }),
                )
                .await?;
            if transitioned {
                info!("Event {} transitioned to past", confirmation.event_id);
            }
        }
        Ok(())
    }

    async fn send_daily_availability_nudges(&self) -> anyhow::Result<()> {
        let now = self.clock.now();
        let rows = self.store.get_unconfirmed_active_events_at_local_noon(now).await?;
        for value in rows {
            let event: EventRow = serde_json::from_value(value)?;
            let tz: chrono_tz::Tz = match event.timezone.parse() {
                Ok(tz) => tz,
                Err(_) => continue,
            };
            let today = now.with_timezone(&tz).date_naive();
            if event.last_availability_nudge_date == Some(today) {
                continue;
            }

            let text = generate_availability_reminder_message(&event.name);
            self.broadcast(event.event_id, &text, &[]).await;

            let _ = self
                .store
                .update_raw(
                    "events",
                    "event_id",
                    &event.event_id.to_string(),
                    serde_json::json!({ "last_availability_nudge_date": today }),
                )
                .await;
        }
        Ok(())
    }

    async fn send_daily_event_countdowns(&self) -> anyhow::Result<()> {
        let now = self.clock.now();
        let rows = self.store.get_confirmed_events_at_local_noon(now).await?;
        for value in rows {
            let event: EventRow = serde_json::from_value(value)?;
            let tz: chrono_tz::Tz = match event.timezone.parse() {
                Ok(tz) => tz,
                Err(_) => continue,
            };

            let confirmation: Option<ConfirmationRow> = self
                .store
                .get("confirmations", "event_id", &event.event_id.to_string())
                .await?;
            let confirmation = match confirmation {
                Some(c) => c,
                None => continue,
            };
            if confirmation.confirmed_start_instant <= now {
                continue; // already happened; nothing left to count down to
            }

            let today = now.with_timezone(&tz).date_naive();
            if event.last_daily_countdown_date == Some(today) {
                continue;
            }

            let text = generate_daily_reminder_message(&event.name, confirmation.confirmed_start_instant);
            self.broadcast(event.event_id, &text, &[]).await;

            let _ = self
                .store
                .update_raw(
                    "events",
                    "event_id",
                    &event.event_id.to_string(),
                    serde_json::json!({ "last_daily_countdown_date": today }),
                )
                .await;
        }
        Ok(())
    }

    async fn send_imminent_reminders(&self) -> anyhow::Result<()> {
        let now = self.clock.now();
        let rows = self
            .store
            .get_confirmed_events_starting_soon(now, self.config.imminent_window)
            .await?;
        for value in rows {
            let confirmation: ConfirmationRow = serde_json::from_value(value)?;
            if let Some(last) = confirmation.last_imminent_emitted_at {
                if now - last < self.config.imminent_cooldown {
                    continue;
                }
            }

            let event: Option<EventRow> = self
                .store
                .get("events", "event_id", &confirmation.event_id.to_string())
                .await?;
            let event = match event {
                Some(e) => e,
                None => continue,
            };

            let text = generate_event_reminder_message(&event.name, confirmation.confirmed_start_instant);
            self.broadcast(confirmation.event_id, &text, &[]).await;

            let _ = self
                .store
                .update_raw(
                    "confirmations",
                    "event_id",
                    &confirmation.event_id.to_string(),
                    serde_json::json!({ "last_imminent_emitted_at": now }),
                )
                .await;
        }
        Ok(())
    }

    /// Sends `text` to every chat associated with `event_id`. A send failure for one chat is
    /// logged and does not block sends to the rest.
    async fn broadcast(&self, event_id: uuid::Uuid, text: &str, buttons: &[Button]) {
        let chats: Vec<EventChatRow> = match self
            .store
            .get_many("event_chats", "event_id", &event_id.to_string())
            .await
        {
            Ok(chats) => chats,
            Err(err) => {
                error!("Failed to look up chats for event {}: {:?}", event_id, err);
                return;
            }
        };

        for chat in chats {
            if !chat.reminders_enabled {
                continue;
            }
            if let Err(err) = self
                .chat
                .send_message(&chat.chat_id, chat.thread_id.as_deref(), text, buttons)
                .await
            {
                error!(
                    "Failed to send reminder for event {} to chat {}: {:?}",
                    event_id, chat.chat_id, err
                );
            } else {
                info!("Sent reminder for event {} to chat {}", event_id, chat.chat_id);
            }
        }
    }
}

fn generate_availability_reminder_message(event_name: &str) -> String {
    format!(
        "Reminder: please submit your availability for \"{}\" if you haven't already.",
        event_name
    )
}

fn generate_daily_reminder_message(event_name: &str, start: chrono::DateTime<Utc>) -> String {
    format!("\"{}\" is happening on {}.", event_name, start.format("%Y-%m-%d %H:%M UTC"))
}

fn generate_event_reminder_message(event_name: &str, start: chrono::DateTime<Utc>) -> String {
    format!(
        "\"{}\" is starting soon, at {}.",
        event_name,
        start.format("%Y-%m-%d %H:%M UTC")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        chat::LoggingChatAdapter,
        clock::test::TestClock,
        store::{EventChatRow, EventRow, InMemoryStore},
    };
    use chrono::TimeZone;
    use uuid::Uuid;

    fn event_row(event_id: uuid::Uuid, state: &str) -> EventRow {
        EventRow {
            event_id,
            name: "Standup".to_owned(),
            description: "".to_owned(),
            creator_user_id: Uuid::new_v4(),
            window_start_date: chrono::NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            window_end_date: chrono::NaiveDate::from_ymd_opt(2025, 1, 7).unwrap(),
            daily_start_time: chrono::NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            daily_end_time: chrono::NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
            min_participants: 2,
            min_block_slots: 2,
            max_block_slots: 4,
            reminders_enabled: true,
            timezone: "UTC".to_owned(),
            state: state.to_owned(),
            last_availability_nudge_date: None,
            last_daily_countdown_date: None,
        }
    }

    #[tokio::test]
    async fn imminent_pass_fires_once_then_respects_cooldown() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(TestClock::new(Utc.with_ymd_and_hms(2025, 1, 1, 10, 0, 0).unwrap()));
        let chat = Arc::new(LoggingChatAdapter::default());
        let dispatcher = ReminderDispatcher::new(
            store.clone(),
            clock.clone(),
            chat.clone(),
            ReminderDispatcherConfig::default(),
        );

        let event_id = Uuid::new_v4();
        store.insert("events", &event_row(event_id, "confirmed")).await.unwrap();
        store
            .insert(
                "event_chats",
                &EventChatRow {
                    event_id,
                    chat_id: "chat1".to_owned(),
                    thread_id: None,
                    reminders_enabled: true,
                },
            )
            .await
            .unwrap();
        store
            .insert(
                "confirmations",
                &ConfirmationRow {
                    event_id,
                    confirmed_start_instant: Utc.with_ymd_and_hms(2025, 1, 1, 11, 0, 0).unwrap(),
                    confirmed_end_instant: Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap(),
                    confirmed_at: clock.now(),
                    last_imminent_emitted_at: None,
                },
            )
            .await
            .unwrap();

        dispatcher.run_once().await;
        let confirmation: ConfirmationRow = store
            .get("confirmations", "event_id", &event_id.to_string())
            .await
            .unwrap()
            .unwrap();
        assert!(confirmation.last_imminent_emitted_at.is_some());

        // Running again immediately should not re-fire within the cooldown.
        let before = confirmation.last_imminent_emitted_at;
        dispatcher.run_once().await;
        let confirmation: ConfirmationRow = store
            .get("confirmations", "event_id", &event_id.to_string())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(confirmation.last_imminent_emitted_at, before);
    }

    #[tokio::test]
    async fn daily_nudge_does_not_double_fire_same_day() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(TestClock::new(Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap()));
        let chat = Arc::new(LoggingChatAdapter::default());
        let dispatcher = ReminderDispatcher::new(
            store.clone(),
            clock.clone(),
            chat.clone(),
            ReminderDispatcherConfig::default(),
        );

        let event_id = Uuid::new_v4();
        store.insert("events", &event_row(event_id, "open")).await.unwrap();
        store
            .insert(
                "event_chats",
                &EventChatRow {
                    event_id,
                    chat_id: "chat1".to_owned(),
                    thread_id: None,
                    reminders_enabled: true,
                },
            )
            .await
            .unwrap();

        dispatcher.run_once().await;
        let event: EventRow = store
            .get("events", "event_id", &event_id.to_string())
            .await
            .unwrap()
            .unwrap();
        assert!(event.last_availability_nudge_date.is_some());
        let first_date = event.last_availability_nudge_date;

        dispatcher.run_once().await;
        let event: EventRow = store
            .get("events", "event_id", &event_id.to_string())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.last_availability_nudge_date, first_date);
    }

    #[tokio::test]
    async fn daily_nudge_does_not_fire_before_local_noon() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(TestClock::new(Utc.with_ymd_and_hms(2025, 1, 1, 9, 0, 0).unwrap()));
        let chat = Arc::new(LoggingChatAdapter::default());
        let dispatcher = ReminderDispatcher::new(
            store.clone(),
            clock.clone(),
            chat.clone(),
            ReminderDispatcherConfig::default(),
        );

        let event_id = Uuid::new_v4();
        store.insert("events", &event_row(event_id, "open")).await.unwrap();

        dispatcher.run_once().await;
        let event: EventRow = store
            .get("events", "event_id", &event_id.to_string())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.last_availability_nudge_date, None);
    }

    #[tokio::test]
    async fn past_due_confirmed_event_transitions_to_past() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(TestClock::new(Utc.with_ymd_and_hms(2025, 1, 1, 13, 0, 0).unwrap()));
        let chat = Arc::new(LoggingChatAdapter::default());
        let dispatcher = ReminderDispatcher::new(
            store.clone(),
            clock.clone(),
            chat.clone(),
            ReminderDispatcherConfig::default(),
        );

        let event_id = Uuid::new_v4();
        store.insert("events", &event_row(event_id, "confirmed")).await.unwrap();
        store
            .insert(
                "confirmations",
                &ConfirmationRow {
                    event_id,
                    confirmed_start_instant: Utc.with_ymd_and_hms(2025, 1, 1, 11, 0, 0).unwrap(),
                    confirmed_end_instant: Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap(),
                    confirmed_at: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
                    last_imminent_emitted_at: None,
                },
            )
            .await
            .unwrap();

        dispatcher.run_once().await;
        let event: EventRow = store
            .get("events", "event_id", &event_id.to_string())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.state, "past");
    }
}
