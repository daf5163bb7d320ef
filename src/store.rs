//! The persistence boundary. `Store` is the one trait the rest of the core depends on; it is
//! kept object-safe (and so usable as `Arc<dyn Store>`) by operating on `serde_json::Value` rows,
//! exactly the way the Python `DatabaseService` wraps a dynamic Supabase client. `StoreExt`
//! layers typed sugar on top so call sites work with the row structs below instead of raw JSON,
//! matching the "typed row structs, not dynamic dict rows" redesign note.

use crate::util::tempfile;
use anyhow::{Context as _, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Timelike, Utc};
use fs2::FileExt;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File, OpenOptions},
    io::{AsyncReadExt, AsyncWriteExt},
    sync::RwLock,
};
use uuid::Uuid;

pub const TABLES: &[&str] = &[
    "users",
    "events",
    "availability",
    "confirmations",
    "memberships",
    "event_chats",
    "share_tokens",
];

#[async_trait]
pub trait Store: Send + Sync {
    async fn get_raw(&self, table: &str, field: &str, value: &str) -> Result<Option<Value>>;
    async fn get_many_raw(&self, table: &str, field: &str, value: &str) -> Result<Vec<Value>>;
    async fn insert_raw(&self, table: &str, row: Value) -> Result<()>;
    async fn insert_many_raw(&self, table: &str, rows: Vec<Value>) -> Result<()>;
    /// Returns whether a row was found and patched.
    async fn update_raw(
        &self,
        table: &str,
        key_field: &str,
        key_value: &str,
        patch: Value,
    ) -> Result<bool>;
    async fn delete_raw(
        &self,
        table: &str,
        key_field: &str,
        key_value: &str,
        other_field: &str,
        other_value: &str,
    ) -> Result<()>;
    async fn delete_many_raw(
        &self,
        table: &str,
        key_field: &str,
        key_value: &str,
        other_field: &str,
        other_values: &[String],
    ) -> Result<()>;

    /// Rows for `open` events with reminders enabled whose own `timezone` currently reads noon,
    /// per spec's "at local noon" daily nudge pass. `now` is the instant to evaluate against,
    /// supplied by the caller (the Reminder Dispatcher's clock) rather than read from the system
    /// clock here, so the comparison stays testable.
    async fn get_unconfirmed_active_events_at_local_noon(&self, now: DateTime<Utc>) -> Result<Vec<Value>>;
    /// Rows for `confirmed` events whose own `timezone` currently reads noon.
    async fn get_confirmed_events_at_local_noon(&self, now: DateTime<Utc>) -> Result<Vec<Value>>;
    async fn get_confirmed_events_starting_soon(&self, now: DateTime<Utc>, window: Duration) -> Result<Vec<Value>>;
    /// Confirmation rows whose `confirmed_end_instant` has elapsed and whose event is still
    /// `confirmed` (not yet swept to `past`).
    async fn get_past_due_confirmed_events(&self, now: DateTime<Utc>) -> Result<Vec<Value>>;
    async fn consume_share_token(&self, token: &str) -> Result<Option<Value>>;
}

/// True if `row`'s `timezone` field parses and its local wall-clock hour at `now` is noon.
/// Unparseable or missing timezones never match, rather than falling back to UTC.
fn is_local_noon(row: &Value, now: DateTime<Utc>) -> bool {
    let tz: chrono_tz::Tz = match row
        .get("timezone")
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok())
    {
        Some(tz) => tz,
        None => return false,
    };
    now.with_timezone(&tz).hour() == 12
}

fn parse_datetime(row: &Value, field: &str) -> Option<DateTime<Utc>> {
    row.get(field)?.as_str()?.parse().ok()
}

/// Typed sugar over `Store`'s raw JSON operations. Blanket-implemented, so any `Store` gets it
/// for free; callers never touch `serde_json::Value` directly.
#[async_trait]
pub trait StoreExt: Store {
    async fn get<T: DeserializeOwned>(&self, table: &str, field: &str, value: &str) -> Result<Option<T>> {
        match self.get_raw(table, field, value).await? {
            Some(v) => Ok(Some(serde_json::from_value(v)?)),
            None => Ok(None),
        }
    }

    async fn get_many<T: DeserializeOwned>(&self, table: &str, field: &str, value: &str) -> Result<Vec<T>> {
        self.get_many_raw(table, field, value)
            .await?
            .into_iter()
            .map(|v| serde_json::from_value(v).map_err(Into::into))
            .collect()
    }

    async fn insert<T: Serialize + Sync>(&self, table: &str, row: &T) -> Result<()> {
        self.insert_raw(table, serde_json::to_value(row)?).await
    }

    async fn insert_many<T: Serialize + Sync>(&self, table: &str, rows: &[T]) -> Result<()> {
        let values = rows
            .iter()
            .map(serde_json::to_value)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        self.insert_many_raw(table, values).await
    }
}

impl<T: Store + ?Sized> StoreExt for T {}

// --- Row types -------------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRow {
    pub user_id: Uuid,
    pub chat_identity: String,
    pub display_name: String,
    pub sleep_start: Option<chrono::NaiveTime>,
    pub sleep_end: Option<chrono::NaiveTime>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRow {
    pub event_id: Uuid,
    pub name: String,
    pub description: String,
    pub creator_user_id: Uuid,
    pub window_start_date: NaiveDate,
    pub window_end_date: NaiveDate,
    pub daily_start_time: chrono::NaiveTime,
    pub daily_end_time: chrono::NaiveTime,
    pub min_participants: u32,
    pub min_block_slots: u32,
    pub max_block_slots: u32,
    pub reminders_enabled: bool,
    pub timezone: String,
    pub state: String,
    pub last_availability_nudge_date: Option<NaiveDate>,
    pub last_daily_countdown_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityRow {
    pub event_id: Uuid,
    pub user_id: Uuid,
    pub start_instant: DateTime<Utc>,
    pub end_instant: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmationRow {
    pub event_id: Uuid,
    pub confirmed_start_instant: DateTime<Utc>,
    pub confirmed_end_instant: DateTime<Utc>,
    pub confirmed_at: DateTime<Utc>,
    pub last_imminent_emitted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipRow {
    pub event_id: Uuid,
    pub user_id: Uuid,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventChatRow {
    pub event_id: Uuid,
    pub chat_id: String,
    pub thread_id: Option<String>,
    pub reminders_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareTokenRow {
    pub token: String,
    pub user_id: Uuid,
    pub chat_id: String,
    pub thread_id: Option<String>,
    pub expires_at: DateTime<Utc>,
}

// --- JSON-file-backed driver -------------------------------------------------------------------

async fn open_read_append(path: impl AsRef<Path>) -> Result<File> {
    Ok(OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(&path)
        .await?)
}

struct Table {
    path: PathBuf,
    rows: RwLock<Vec<Value>>,
    // Holds the process-exclusive lock on `path` for the table's lifetime.
    _file: File,
}

/// A `Store` implementation that persists each table as a JSON array in its own file, using the
/// same atomic tempfile-then-rename write and advisory exclusive lock as the original
/// `PersistentStore`, generalized from one whole-collection blob to one file per table.
pub struct JsonFileStore {
    dir: PathBuf,
    tables: HashMap<&'static str, Table>,
}

impl JsonFileStore {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create store dir: {}", dir.display()))?;

        let mut tables = HashMap::new();
        for &name in TABLES {
            let path = dir.join(format!("{}.json", name));
            let file = open_read_append(&path)
                .await
                .with_context(|| format!("Failed to open store file: {}", path.display()))?;
            let std_file = file.try_into_std().expect("no operations in-flight");
            std_file.try_lock_exclusive().with_context(|| {
                format!(
                    "Failed to lock store file ({}) exclusively; is another process running?",
                    path.display()
                )
            })?;
            let mut file = File::from_std(std_file);

            let mut bytes = Vec::new();
            file.read_to_end(&mut bytes).await?;
            let rows: Vec<Value> = if bytes.is_empty() {
                Vec::new()
            } else {
                serde_json::from_slice(&bytes)
                    .with_context(|| format!("Failed to deserialize {}", path.display()))?
            };

            tables.insert(
                name,
                Table {
                    path,
                    rows: RwLock::new(rows),
                    _file: file,
                },
            );
        }

        Ok(JsonFileStore { dir, tables })
    }

    fn table(&self, name: &str) -> Result<&Table> {
        self.tables
            .get(name)
            .ok_or_else(|| anyhow::format_err!("Unknown table: {}", name))
    }

    async fn persist(&self, table: &Table, rows: &[Value]) -> Result<()> {
        let json = serde_json::to_vec(rows)?;
        let (temppath, mut tempfile) = tempfile(&self.dir).await?;
        tempfile.write_all(&json).await?;
        tempfile.flush().await?;
        std::mem::drop(tempfile);
        fs::rename(temppath, &table.path).await?;
        Ok(())
    }
}

fn matches(row: &Value, field: &str, value: &str) -> bool {
    match row.get(field) {
        Some(Value::String(s)) => s == value,
        Some(other) => other.to_string().trim_matches('"') == value,
        None => false,
    }
}

#[async_trait]
impl Store for JsonFileStore {
    async fn get_raw(&self, table: &str, field: &str, value: &str) -> Result<Option<Value>> {
        let table = self.table(table)?;
        let rows = table.rows.read().await;
        Ok(rows.iter().find(|r| matches(r, field, value)).cloned())
    }

    async fn get_many_raw(&self, table: &str, field: &str, value: &str) -> Result<Vec<Value>> {
        let table = self.table(table)?;
        let rows = table.rows.read().await;
        Ok(rows
            .iter()
            .filter(|r| matches(r, field, value))
            .cloned()
            .collect())
    }

    async fn insert_raw(&self, table: &str, row: Value) -> Result<()> {
        let table = self.table(table)?;
        let mut rows = table.rows.write().await;
        rows.push(row);
        self.persist(table, &rows).await
    }

    async fn insert_many_raw(&self, table: &str, new_rows: Vec<Value>) -> Result<()> {
        let table = self.table(table)?;
        let mut rows = table.rows.write().await;
        rows.extend(new_rows);
        self.persist(table, &rows).await
    }

    async fn update_raw(
        &self,
        table: &str,
        key_field: &str,
        key_value: &str,
        patch: Value,
    ) -> Result<bool> {
        let table = self.table(table)?;
        let mut rows = table.rows.write().await;
        let mut found = false;
        for row in rows.iter_mut() {
            if matches(row, key_field, key_value) {
                found = true;
                if let (Value::Object(row_obj), Value::Object(patch_obj)) = (row, &patch) {
                    for (k, v) in patch_obj {
                        row_obj.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        if found {
            self.persist(table, &rows).await?;
        }
        Ok(found)
    }

    async fn delete_raw(
        &self,
        table: &str,
        key_field: &str,
        key_value: &str,
        other_field: &str,
        other_value: &str,
    ) -> Result<()> {
        let table = self.table(table)?;
        let mut rows = table.rows.write().await;
        rows.retain(|r| !(matches(r, key_field, key_value) && matches(r, other_field, other_value)));
        self.persist(table, &rows).await
    }

    async fn delete_many_raw(
        &self,
        table: &str,
        key_field: &str,
        key_value: &str,
        other_field: &str,
        other_values: &[String],
    ) -> Result<()> {
        let table = self.table(table)?;
        let mut rows = table.rows.write().await;
        rows.retain(|r| {
            !(matches(r, key_field, key_value)
                && other_values.iter().any(|v| matches(r, other_field, v)))
        });
        self.persist(table, &rows).await
    }

    async fn get_unconfirmed_active_events_at_local_noon(&self, now: DateTime<Utc>) -> Result<Vec<Value>> {
        let table = self.table("events")?;
        let rows = table.rows.read().await;
        Ok(rows
            .iter()
            .filter(|r| r.get("state").and_then(Value::as_str) == Some("open"))
            .filter(|r| r.get("reminders_enabled").and_then(Value::as_bool) == Some(true))
            .filter(|r| is_local_noon(r, now))
            .cloned()
            .collect())
    }

    async fn get_confirmed_events_at_local_noon(&self, now: DateTime<Utc>) -> Result<Vec<Value>> {
        let table = self.table("events")?;
        let rows = table.rows.read().await;
        Ok(rows
            .iter()
            .filter(|r| r.get("state").and_then(Value::as_str) == Some("confirmed"))
            .filter(|r| is_local_noon(r, now))
            .cloned()
            .collect())
    }

    async fn get_confirmed_events_starting_soon(&self, now: DateTime<Utc>, window: Duration) -> Result<Vec<Value>> {
        let table = self.table("confirmations")?;
        let rows = table.rows.read().await;
        Ok(rows
            .iter()
            .filter(|r| matches!(parse_datetime(r, "confirmed_start_instant"), Some(s) if s >= now && s <= now + window))
            .cloned()
            .collect())
    }

    async fn get_past_due_confirmed_events(&self, now: DateTime<Utc>) -> Result<Vec<Value>> {
        let confirmations = self.table("confirmations")?.rows.read().await;
        let events = self.table("events")?.rows.read().await;
        Ok(confirmations
            .iter()
            .filter(|c| matches!(parse_datetime(c, "confirmed_end_instant"), Some(e) if e <= now))
            .filter(|c| {
                let event_id = c.get("event_id").and_then(Value::as_str);
                let state = event_id
                    .and_then(|id| events.iter().find(|e| matches(e, "event_id", id)))
                    .and_then(|e| e.get("state").and_then(Value::as_str));
                state == Some("confirmed")
            })
            .cloned()
            .collect())
    }

    async fn consume_share_token(&self, token: &str) -> Result<Option<Value>> {
        let table = self.table("share_tokens")?;
        let mut rows = table.rows.write().await;
        let position = rows.iter().position(|r| matches(r, "token", token));
        let row = position.map(|i| rows.remove(i));
        if row.is_some() {
            self.persist(table, &rows).await?;
        }
        Ok(row)
    }
}

/// An in-memory `Store` for unit tests, with no file I/O. Mirrors `JsonFileStore`'s matching
/// semantics exactly so tests exercise the same row-matching logic the real driver uses.
#[derive(Default)]
pub struct InMemoryStore {
    tables: RwLock<HashMap<String, Vec<Value>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn get_raw(&self, table: &str, field: &str, value: &str) -> Result<Option<Value>> {
        let tables = self.tables.read().await;
        Ok(tables
            .get(table)
            .and_then(|rows| rows.iter().find(|r| matches(r, field, value)).cloned()))
    }

    async fn get_many_raw(&self, table: &str, field: &str, value: &str) -> Result<Vec<Value>> {
        let tables = self.tables.read().await;
        Ok(tables
            .get(table)
            .map(|rows| rows.iter().filter(|r| matches(r, field, value)).cloned().collect())
            .unwrap_or_default())
    }

    async fn insert_raw(&self, table: &str, row: Value) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.entry(table.to_owned()).or_default().push(row);
        Ok(())
    }

    async fn insert_many_raw(&self, table: &str, new_rows: Vec<Value>) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.entry(table.to_owned()).or_default().extend(new_rows);
        Ok(())
    }

    async fn update_raw(
        &self,
        table: &str,
        key_field: &str,
        key_value: &str,
        patch: Value,
    ) -> Result<bool> {
        let mut tables = self.tables.write().await;
        let mut found = false;
        if let Some(rows) = tables.get_mut(table) {
            for row in rows.iter_mut() {
                if matches(row, key_field, key_value) {
                    found = true;
                    if let (Value::Object(row_obj), Value::Object(patch_obj)) = (row, &patch) {
                        for (k, v) in patch_obj {
                            row_obj.insert(k.clone(), v.clone());
                        }
                    }
                }
            }
        }
        Ok(found)
    }

    async fn delete_raw(
        &self,
        table: &str,
        key_field: &str,
        key_value: &str,
        other_field: &str,
        other_value: &str,
    ) -> Result<()> {
        let mut tables = self.tables.write().await;
        if let Some(rows) = tables.get_mut(table) {
            rows.retain(|r| {
                !(matches(r, key_field, key_value) && matches(r, other_field, other_value))
            });
        }
        Ok(())
    }

    async fn delete_many_raw(
        &self,
        table: &str,
        key_field: &str,
        key_value: &str,
        other_field: &str,
        other_values: &[String],
    ) -> Result<()> {
        let mut tables = self.tables.write().await;
        if let Some(rows) = tables.get_mut(table) {
            rows.retain(|r| {
                !(matches(r, key_field, key_value)
                    && other_values.iter().any(|v| matches(r, other_field, v)))
            });
        }
        Ok(())
    }

    async fn get_unconfirmed_active_events_at_local_noon(&self, now: DateTime<Utc>) -> Result<Vec<Value>> {
        let tables = self.tables.read().await;
        Ok(tables
            .get("events")
            .map(|rows| {
                rows.iter()
                    .filter(|r| r.get("state").and_then(Value::as_str) == Some("open"))
                    .filter(|r| r.get("reminders_enabled").and_then(Value::as_bool) == Some(true))
                    .filter(|r| is_local_noon(r, now))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_confirmed_events_at_local_noon(&self, now: DateTime<Utc>) -> Result<Vec<Value>> {
        let tables = self.tables.read().await;
        Ok(tables
            .get("events")
            .map(|rows| {
                rows.iter()
                    .filter(|r| r.get("state").and_then(Value::as_str) == Some("confirmed"))
                    .filter(|r| is_local_noon(r, now))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_confirmed_events_starting_soon(&self, now: DateTime<Utc>, window: Duration) -> Result<Vec<Value>> {
        let tables = self.tables.read().await;
        Ok(tables
            .get("confirmations")
            .map(|rows| {
                rows.iter()
                    .filter(|r| matches!(parse_datetime(r, "confirmed_start_instant"), Some(s) if s >= now && s <= now + window))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_past_due_confirmed_events(&self, now: DateTime<Utc>) -> Result<Vec<Value>> {
        let tables = self.tables.read().await;
        let confirmations = tables.get("confirmations").cloned().unwrap_or_default();
        let events = tables.get("events").cloned().unwrap_or_default();
        Ok(confirmations
            .iter()
            .filter(|c| matches!(parse_datetime(c, "confirmed_end_instant"), Some(e) if e <= now))
            .filter(|c| {
                let event_id = c.get("event_id").and_then(Value::as_str);
                let state = event_id
                    .and_then(|id| events.iter().find(|e| matches(e, "event_id", id)))
                    .and_then(|e| e.get("state").and_then(Value::as_str));
                state == Some("confirmed")
            })
            .cloned()
            .collect())
    }

    async fn consume_share_token(&self, token: &str) -> Result<Option<Value>> {
        let mut tables = self.tables.write().await;
        if let Some(rows) = tables.get_mut("share_tokens") {
            let position = rows.iter().position(|r| matches(r, "token", token));
            return Ok(position.map(|i| rows.remove(i)));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    #[tokio::test]
    async fn insert_and_get_roundtrip() {
        let store = InMemoryStore::new();
        let user = UserRow {
            user_id: Uuid::new_v4(),
            chat_identity: "tg:123".to_owned(),
            display_name: "Alice".to_owned(),
            sleep_start: None,
            sleep_end: None,
        };
        store.insert("users", &user).await.unwrap();
        let fetched: Option<UserRow> = store
            .get("users", "chat_identity", "tg:123")
            .await
            .unwrap();
        assert_eq!(fetched, Some(user));
    }

    #[tokio::test]
    async fn update_reports_whether_a_row_was_found() {
        let store = InMemoryStore::new();
        let found = store
            .update_raw("events", "event_id", "missing", serde_json::json!({}))
            .await
            .unwrap();
        assert!(!found);
    }

    #[tokio::test]
    async fn delete_many_removes_only_matching_rows() {
        let store = InMemoryStore::new();
        let event_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();
        let rows = vec![
            AvailabilityRow {
                event_id,
                user_id,
                start_instant: Utc::now(),
                end_instant: Utc::now(),
            },
            AvailabilityRow {
                event_id,
                user_id: Uuid::new_v4(),
                start_instant: Utc::now(),
                end_instant: Utc::now(),
            },
        ];
        store.insert_many("availability", &rows).await.unwrap();
        store
            .delete_many_raw(
                "availability",
                "event_id",
                &event_id.to_string(),
                "user_id",
                &[user_id.to_string()],
            )
            .await
            .unwrap();
        let remaining: Vec<AvailabilityRow> = store
            .get_many("availability", "event_id", &event_id.to_string())
            .await
            .unwrap();
        assert_eq!(remaining.len(), 1);
        assert_ne!(remaining[0].user_id, user_id);
    }

    #[tokio::test]
    async fn json_file_store_persists_across_reopen() {
        let tempdir = TempDir::new("JsonFileStore_test").unwrap();
        let store = JsonFileStore::open(tempdir.path()).await.unwrap();
        let user = UserRow {
            user_id: Uuid::new_v4(),
            chat_identity: "tg:456".to_owned(),
            display_name: "Bob".to_owned(),
            sleep_start: None,
            sleep_end: None,
        };
        store.insert("users", &user).await.unwrap();
        drop(store);

        let store = JsonFileStore::open(tempdir.path()).await.unwrap();
        let fetched: Option<UserRow> = store
            .get("users", "chat_identity", "tg:456")
            .await
            .unwrap();
        assert_eq!(fetched, Some(user));
    }
}
