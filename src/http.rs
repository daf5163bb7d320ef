//! The HTTP Boundary: a thin axum router demultiplexing JSON requests straight into Orchestrator
//! operations. No business logic lives here beyond (de)serialization and error translation,
//! matching the spec's framing of the HTTP API as a boundary layer, not a core component.

use crate::{
    chat::InboundRouter,
    error::CoreError,
    event::{CreateEventRequest, EventId, EventWindow, Orchestrator},
    reminder::ReminderDispatcher,
    selector::BlockCandidate,
    share::ShareLinks,
    user::{Authorizer, UserId},
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct Deps {
    pub orchestrator: Arc<Orchestrator>,
    pub authorizer: Arc<Authorizer>,
    pub share_links: Arc<ShareLinks>,
    pub dispatcher: Arc<ReminderDispatcher>,
    pub inbound: Arc<InboundRouter>,
    pub webhook_secret: String,
}

pub fn router(deps: Deps) -> Router {
    Router::new()
        .route("/api/event/create", post(create_event))
        .route("/api/event/confirm", post(confirm_event))
        .route("/api/event/get-best-time", post(get_best_time))
        .route("/api/share", post(share))
        .route("/api/reminders", post(trigger_reminders))
        .route("/webhook/:secret", post(webhook))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(deps)
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        let status = match self.kind() {
            "invalid_input" => StatusCode::BAD_REQUEST,
            "not_found" => StatusCode::NOT_FOUND,
            "conflict" => StatusCode::CONFLICT,
            "unauthorized" => StatusCode::FORBIDDEN,
            "invalid_state" => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let message = if self.user_facing() {
            self.to_string()
        } else {
            "internal error".to_owned()
        };
        (
            status,
            Json(ErrorBody {
                error: self.kind(),
                message,
            }),
        )
            .into_response()
    }
}

#[derive(Debug, Deserialize)]
struct CreateEventBody {
    creator: UserId,
    event_name: String,
    event_details: String,
    window_start_date: NaiveDate,
    window_end_date: NaiveDate,
    daily_start_time: NaiveTime,
    daily_end_time: NaiveTime,
    #[serde(default = "default_min_participants")]
    min_participants: u32,
    #[serde(default = "default_min_block_slots")]
    min_block_slots: u32,
    #[serde(default = "default_max_block_slots")]
    max_block_slots: u32,
    #[serde(default = "default_timezone")]
    timezone: String,
}

fn default_min_participants() -> u32 {
    2
}
fn default_min_block_slots() -> u32 {
    2
}
fn default_max_block_slots() -> u32 {
    4
}
fn default_timezone() -> String {
    "UTC".to_owned()
}

#[derive(Debug, Serialize)]
struct CreateEventResponse {
    ok: bool,
    event_id: EventId,
}

async fn create_event(
    State(deps): State<Deps>,
    Json(body): Json<CreateEventBody>,
) -> Result<Json<CreateEventResponse>, CoreError> {
    let timezone: chrono_tz::Tz = body
        .timezone
        .parse()
        .map_err(|_| CoreError::InvalidInput(format!("Unknown timezone: {}", body.timezone)))?;
    let event_id = deps
        .orchestrator
        .create_event(CreateEventRequest {
            creator_user_id: body.creator,
            name: body.event_name,
            description: body.event_details,
            window: EventWindow {
                window_start_date: body.window_start_date,
                window_end_date: body.window_end_date,
                daily_start_time: body.daily_start_time,
                daily_end_time: body.daily_end_time,
            },
            min_participants: body.min_participants,
            min_block_slots: body.min_block_slots,
            max_block_slots: body.max_block_slots,
            timezone,
        })
        .await?;
    Ok(Json(CreateEventResponse { ok: true, event_id }))
}

#[derive(Debug, Deserialize)]
struct ConfirmEventBody {
    event_id: EventId,
    best_start_time: DateTime<Utc>,
    best_end_time: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct ConfirmEventResponse {
    ok: bool,
}

async fn confirm_event(
    State(deps): State<Deps>,
    Json(body): Json<ConfirmEventBody>,
) -> Result<Json<ConfirmEventResponse>, CoreError> {
    deps.orchestrator
        .confirm_event(body.event_id, body.best_start_time, body.best_end_time)
        .await?;
    Ok(Json(ConfirmEventResponse { ok: true }))
}

#[derive(Debug, Deserialize)]
struct GetBestTimeBody {
    event_id: EventId,
}

#[derive(Debug, Serialize)]
struct GetBestTimeResponse {
    ok: bool,
    blocks: Vec<BlockView>,
}

#[derive(Debug, Serialize)]
struct BlockView {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    participant_count: usize,
}

impl From<&BlockCandidate> for BlockView {
    fn from(block: &BlockCandidate) -> Self {
        BlockView {
            start: block.start,
            end: block.end,
            participant_count: block.participants.len(),
        }
    }
}

async fn get_best_time(
    State(deps): State<Deps>,
    Json(body): Json<GetBestTimeBody>,
) -> Result<Json<GetBestTimeResponse>, CoreError> {
    let blocks = deps.orchestrator.compute_best_time(body.event_id).await?;
    Ok(Json(GetBestTimeResponse {
        ok: true,
        blocks: blocks.iter().map(BlockView::from).collect(),
    }))
}

#[derive(Debug, Deserialize)]
struct ShareBody {
    token: String,
    event_id: EventId,
}

#[derive(Debug, Serialize)]
struct ShareResponse {
    ok: bool,
}

async fn share(
    State(deps): State<Deps>,
    Json(body): Json<ShareBody>,
) -> Result<Json<ShareResponse>, CoreError> {
    let ctx = deps.share_links.consume(&body.token).await?;
    deps.orchestrator
        .set_event_chat(body.event_id, ctx.chat_id, ctx.thread_id)
        .await?;
    Ok(Json(ShareResponse { ok: true }))
}

async fn trigger_reminders(State(deps): State<Deps>) -> impl IntoResponse {
    deps.dispatcher.run_once().await;
    Json(serde_json::json!({ "ok": true }))
}

/// The inbound delivery shape from a chat-platform webhook: either free text (routed through the
/// command parser) or a webapp payload envelope, always scoped to a sending identity and chat.
#[derive(Debug, Deserialize)]
struct WebhookBody {
    chat_identity: String,
    display_name: String,
    chat_id: String,
    thread_id: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    webapp_payload: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct WebhookResponse {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply: Option<String>,
}

/// `POST /webhook/<secret>`: the one inbound entry point a chat-platform integration calls. The
/// path segment is a shared secret, not a per-chat identifier; a mismatch is reported the same
/// way as any other unauthorized request.
async fn webhook(
    State(deps): State<Deps>,
    Path(secret): Path<String>,
    Json(body): Json<WebhookBody>,
) -> Result<Json<WebhookResponse>, CoreError> {
    if secret != deps.webhook_secret {
        return Err(CoreError::Unauthorized {
            user: body.chat_identity,
            action: "webhook",
        });
    }

    if let Some(payload) = body.webapp_payload {
        deps.inbound
            .handle_webapp_payload(&body.chat_identity, &body.display_name, &payload)
            .await?;
        return Ok(Json(WebhookResponse { ok: true, reply: None }));
    }

    if let Some(text) = body.text {
        let reply = deps
            .inbound
            .handle_command(
                &body.chat_identity,
                &body.display_name,
                &body.chat_id,
                body.thread_id.as_deref(),
                &text,
            )
            .await?;
        return Ok(Json(WebhookResponse {
            ok: true,
            reply: Some(reply),
        }));
    }

    Err(CoreError::InvalidInput(
        "webhook body must include either `text` or `webapp_payload`".to_owned(),
    ))
}
