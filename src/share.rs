//! Share-link minting and consumption. Grounded on `share_service.py`'s `put_ctx`/`get_ctx`:
//! a short-TTL, single-use opaque token that carries the originating chat context into the
//! webapp/confirmation flow. Consumption is atomic via `Store::consume_share_token`.

use crate::{
    error::{CoreError, CoreResult},
    store::{ShareTokenRow, Store, StoreExt},
    user::UserId,
};
use chrono::{Duration, Utc};
use std::sync::Arc;
use uuid::Uuid;

pub struct ShareTokenContext {
    pub user_id: UserId,
    pub chat_id: String,
    pub thread_id: Option<String>,
}

pub struct ShareLinks {
    store: Arc<dyn Store>,
    ttl: Duration,
}

impl ShareLinks {
    pub fn new(store: Arc<dyn Store>, ttl: std::time::Duration) -> Self {
        ShareLinks {
            store,
            ttl: Duration::from_std(ttl).unwrap_or_else(|_| Duration::minutes(15)),
        }
    }

    /// Mints a new single-use token good for `self.ttl` from now.
    pub async fn mint(
        &self,
        user_id: UserId,
        chat_id: String,
        thread_id: Option<String>,
    ) -> CoreResult<String> {
        let token = Uuid::new_v4().simple().to_string();
        let row = ShareTokenRow {
            token: token.clone(),
            user_id,
            chat_id,
            thread_id,
            expires_at: Utc::now() + self.ttl,
        };
        self.store
            .insert("share_tokens", &row)
            .await
            .map_err(CoreError::Transient)?;
        Ok(token)
    }

    /// Consumes `token`, returning its context exactly once. A second call (or a call after
    /// expiry) returns `not_found`.
    pub async fn consume(&self, token: &str) -> CoreResult<ShareTokenContext> {
        let row = self
            .store
            .consume_share_token(token)
            .await
            .map_err(CoreError::Transient)?;
        let row: ShareTokenRow = match row {
            Some(v) => serde_json::from_value(v).map_err(|e| CoreError::Transient(e.into()))?,
            None => {
                return Err(CoreError::NotFound {
                    kind: "share_token",
                    id: token.to_owned(),
                })
            }
        };
        if row.expires_at < Utc::now() {
            return Err(CoreError::NotFound {
                kind: "share_token",
                id: token.to_owned(),
            });
        }
        Ok(ShareTokenContext {
            user_id: row.user_id,
            chat_id: row.chat_id,
            thread_id: row.thread_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    #[tokio::test]
    async fn token_is_single_use() {
        let store = Arc::new(InMemoryStore::new());
        let links = ShareLinks::new(store, std::time::Duration::from_secs(900));
        let user_id = Uuid::new_v4();
        let token = links
            .mint(user_id, "chat1".to_owned(), None)
            .await
            .unwrap();

        let ctx = links.consume(&token).await.unwrap();
        assert_eq!(ctx.user_id, user_id);

        let result = links.consume(&token).await;
        assert!(matches!(result, Err(CoreError::NotFound { .. })));
    }
}
