#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

//! The supervisor daemon: polling, connection monitoring, scheduled
//! reports, the command executor and the live bus, all on one process.

#[macro_use]
extern crate slog_scope;

mod app_state;
mod bus;
mod commands;
mod monitor;
mod poller;
mod reports;
mod routes;
mod settings;
mod ws;

use std::sync::Arc;
use std::time::Duration;

use actix_web::{web, App, HttpServer};
use docopt::Docopt;
use serde::Deserialize;
use tokio::sync::watch;

use nutify_common::logging;

use app_state::AppState;
use settings::Settings;

const USAGE: &str = "
Usage: nutify-server [options]

Options:
    -h, --help                          Show this message.
    --config=CONFIGFILE                 Configuration file path.
";

#[derive(Debug, Deserialize)]
struct Args {
    flag_config: Option<String>,
}

#[actix_web::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args: Args = Docopt::new(USAGE)
        .and_then(|d| d.deserialize())
        .unwrap_or_else(|e| e.exit());
    let mut filenames = Vec::new();
    if let Some(config_filename) = args.flag_config {
        filenames.push(config_filename);
    }
    let settings = Settings::with_env_and_config_files(&filenames)?;
    logging::init_logging(
        !settings.human_logs,
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
    )
    .expect("Logging failed to initialize");
    debug!("Starting up nutify-server...");

    let host = settings.host.clone();
    let port = settings.port;
    let grace = settings.shutdown_grace();

    let state = AppState::from_settings(settings).await?;
    state.check_nut_binaries()?;

    // Populate the static row before the first dynamic sample; a UPS that
    // is unreachable right now is tolerated, the poller self-heals later.
    if let Err(e) = state.poller.initialize_static().await {
        warn!("Static snapshot unavailable at startup: {}", e);
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    state.spawn_loops(stop_rx);

    info!("Starting nutify-server on {}:{}", host, port);
    let server_state = Arc::clone(&state);
    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(Arc::clone(&server_state)))
            .route("/ws", web::get().to(routes::ws_route))
            .route(
                "/internal/ws_event",
                web::post().to(routes::internal_ws_event_route),
            )
            .route("/health", web::get().to(routes::health_route))
            .route(
                "/api/commands",
                web::get().to(routes::list_commands_route),
            )
            .route(
                "/api/commands/execute",
                web::post().to(routes::execute_command_route),
            )
            .route(
                "/api/variables",
                web::get().to(routes::list_variables_route),
            )
            .route(
                "/api/variables/set",
                web::post().to(routes::set_variable_route),
            )
            .route(
                "/api/notifications/test",
                web::post().to(routes::test_notification_route),
            )
    })
    .bind((host.as_str(), port))?
    .run()
    .await?;

    // Signal the loops and give them the grace period to drain.
    info!("Shutting down nutify-server");
    let _ = stop_tx.send(true);
    tokio::time::sleep(grace.min(Duration::from_secs(30))).await;
    logging::reset_logging();
    Ok(())
}
