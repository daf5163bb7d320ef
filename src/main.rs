use chat::{InboundRouter, LoggingChatAdapter};
use clock::SystemClock;
use event::Orchestrator;
use http::Deps;
use reminder::{ReminderDispatcher, ReminderDispatcherConfig};
use share::ShareLinks;
use std::sync::Arc;
use store::JsonFileStore;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use user::Authorizer;

mod chat;
mod clock;
mod config;
mod error;
mod event;
mod http;
mod reminder;
mod selector;
mod share;
mod store;
mod user;
mod util;

#[tokio::main]
async fn main() {
    // Load .env if one exists, but not required. (Environment vars could be passed directly)
    dotenv::dotenv().ok();

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to start the logger");

    let config = config::Config::load().expect("Failed to load configuration");

    let store = Arc::new(
        JsonFileStore::open(&config.store_dir)
            .await
            .expect("Failed to open store"),
    );
    let clock = Arc::new(SystemClock);
    let chat: Arc<dyn chat::ChatAdapter> = Arc::new(LoggingChatAdapter::default());

    let authorizer = Arc::new(Authorizer::new(store.clone()));
    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        clock.clone(),
        authorizer.clone(),
    ));
    let share_links = Arc::new(ShareLinks::new(store.clone(), config.share_token_ttl));
    let inbound = Arc::new(InboundRouter::new(
        orchestrator.clone(),
        authorizer.clone(),
        share_links.clone(),
    ));
    let dispatcher = ReminderDispatcher::new(
        store.clone(),
        clock.clone(),
        chat.clone(),
        ReminderDispatcherConfig {
            tick: config.reminder_tick,
            imminent_window: chrono::Duration::from_std(config.imminent_window)
                .expect("imminent_window out of range"),
            imminent_cooldown: chrono::Duration::from_std(config.imminent_cooldown)
                .expect("imminent_cooldown out of range"),
        },
    );
    let _dispatcher_handle = dispatcher.start();

    let deps = Deps {
        orchestrator,
        authorizer,
        share_links,
        dispatcher: dispatcher.clone(),
        inbound,
        webhook_secret: config.webhook_secret.clone(),
    };
    let app = http::router(deps);

    let addr: std::net::SocketAddr = config
        .http_addr
        .parse()
        .expect("HTTP_ADDR is not a valid socket address");
    info!("Listening on {}", addr);
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await
        .expect("HTTP server error");
}
