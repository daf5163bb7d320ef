use crate::{
    error::{CoreError, CoreResult},
    store::{Store, UserRow},
};
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

pub type UserId = Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub user_id: UserId,
    pub chat_identity: String,
    pub display_name: String,
    pub sleep_start: Option<NaiveTime>,
    pub sleep_end: Option<NaiveTime>,
}

/// Derives authorization facts from Store lookups. Deliberately has no side effects; every
/// method is a pure read-and-compare.
pub struct Authorizer {
    store: Arc<dyn Store>,
}

impl Authorizer {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Authorizer { store }
    }

    /// Looks up (or lazily creates) the User for a given chat-system identity. The chat adapter
    /// vouches for this identity; the core does not authenticate it further.
    pub async fn identity_for(
        &self,
        chat_identity: &str,
        display_name: &str,
    ) -> CoreResult<UserId> {
        if let Some(row) = self
            .store
            .get::<UserRow>("users", "chat_identity", chat_identity)
            .await
            .map_err(CoreError::Transient)?
        {
            return Ok(row.user_id);
        }

        let row = UserRow {
            user_id: Uuid::new_v4(),
            chat_identity: chat_identity.to_owned(),
            display_name: display_name.to_owned(),
            sleep_start: None,
            sleep_end: None,
        };
        self.store
            .insert("users", &row)
            .await
            .map_err(CoreError::Transient)?;
        Ok(row.user_id)
    }

    pub async fn is_creator(&self, event_id: Uuid, user: UserId) -> CoreResult<bool> {
        let event: Option<crate::store::EventRow> = self
            .store
            .get("events", "event_id", &event_id.to_string())
            .await
            .map_err(CoreError::Transient)?;
        let event = event.ok_or(CoreError::NotFound {
            kind: "event",
            id: event_id.to_string(),
        })?;
        Ok(event.creator_user_id == user)
    }

    pub async fn is_member(&self, event_id: Uuid, user: UserId) -> CoreResult<bool> {
        let rows: Vec<crate::store::MembershipRow> = self
            .store
            .get_many("memberships", "event_id", &event_id.to_string())
            .await
            .map_err(CoreError::Transient)?;
        Ok(rows.iter().any(|m| m.user_id == user))
    }
}
