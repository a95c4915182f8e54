//! HTTP surface: the live-bus WebSocket upgrade, the internal re-emit
//! endpoint and health.

use std::sync::Arc;

use actix_web::{web, HttpRequest, HttpResponse};
use serde_json::json;

use crate::app_state::AppState;
use crate::bus::BusEvent;
use crate::ws::spawn_bus_ws;

/// Upgrade to a live-bus WebSocket session.
pub async fn ws_route(
    req: HttpRequest,
    body: web::Payload,
    state: web::Data<Arc<AppState>>,
) -> Result<HttpResponse, actix_web::Error> {
    let (response, session, msg_stream) = actix_ws::handle(&req, body)?;
    spawn_bus_ws(session, msg_stream, Arc::clone(state.get_ref()));
    Ok(response)
}

/// Internal POST endpoint: re-emit a JSON envelope on the bus. Used by
/// out-of-process helpers (and the monitor when hubless) to inject
/// USB signals.
pub async fn internal_ws_event_route(
    event: web::Json<BusEvent>,
    state: web::Data<Arc<AppState>>,
) -> HttpResponse {
    let event = event.into_inner();
    trace!("internal ws_event: {}", event.kind());
    state.bus.publish(event);
    HttpResponse::Ok().json(json!({ "success": true }))
}

/// Service health plus a connection-state snapshot.
pub async fn health_route(state: web::Data<Arc<AppState>>) -> HttpResponse {
    let connection = state.monitor.snapshot().await;
    let db_ok = state.db.get_initial_setup().await.is_ok();
    let nut = state.nut_config.get().await;
    HttpResponse::Ok().json(json!({
        "status": if db_ok { "ok" } else { "degraded" },
        "version": env!("CARGO_PKG_VERSION"),
        "database": db_ok,
        "connection": connection,
        "ws_clients": state.bus.subscriber_count(),
        "nut_mode": nut.mode.to_string(),
        "ups": nut.target(),
        "encryption_configured": state.secret.is_some(),
    }))
}

/// Command-executor endpoints: success envelopes, never errors.
pub async fn list_commands_route(state: web::Data<Arc<AppState>>) -> HttpResponse {
    HttpResponse::Ok().json(state.executor.list_commands().await)
}

#[derive(serde_derive::Deserialize)]
pub struct ExecuteBody {
    pub command: String,
}

pub async fn execute_command_route(
    body: web::Json<ExecuteBody>,
    state: web::Data<Arc<AppState>>,
) -> HttpResponse {
    HttpResponse::Ok().json(state.executor.execute(&body.command).await)
}

pub async fn list_variables_route(state: web::Data<Arc<AppState>>) -> HttpResponse {
    HttpResponse::Ok().json(state.executor.list_variables().await)
}

#[derive(serde_derive::Deserialize)]
pub struct SetVariableBody {
    pub name: String,
    pub value: String,
}

pub async fn set_variable_route(
    body: web::Json<SetVariableBody>,
    state: web::Data<Arc<AppState>>,
) -> HttpResponse {
    HttpResponse::Ok().json(state.executor.set_variable(&body.name, &body.value).await)
}

#[derive(serde_derive::Deserialize)]
pub struct TestNotificationBody {
    pub channel: String,
    pub config_id: Option<i64>,
}

/// Send a test notification on one channel, bypassing the per-event
/// enablement matrices.
pub async fn test_notification_route(
    body: web::Json<TestNotificationBody>,
    state: web::Data<Arc<AppState>>,
) -> HttpResponse {
    match state
        .pipeline
        .send_test(&body.channel, body.config_id)
        .await
    {
        Ok(summary) if summary.failed() == 0 => HttpResponse::Ok().json(json!({
            "success": true,
            "sent": summary.sent(),
        })),
        Ok(summary) => HttpResponse::Ok().json(json!({
            "success": false,
            "error": summary
                .results
                .first()
                .map(|r| r.message.clone())
                .unwrap_or_else(|| "dispatch failed".to_owned()),
        })),
        Err(e) => HttpResponse::Ok().json(json!({
            "success": false,
            "error": e.to_string(),
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{test, App};

    use crate::app_state::AppState;
    use crate::settings::Settings;
    use nutify_common::nut::{MockCommandRunner, ProcessOutput};
    use tempfile::TempDir;

    async fn test_state(dir: &TempDir) -> Arc<AppState> {
        let mut settings = Settings::test_settings();
        settings.db_path = dir
            .path()
            .join("nutify.db")
            .to_str()
            .unwrap()
            .to_owned();
        settings.nut_conf_dir = dir.path().to_str().unwrap().to_owned();
        std::fs::write(
            dir.path().join("upsmon.conf"),
            "MONITOR myups@localhost 1 mon pw primary\n",
        )
        .unwrap();

        let mut runner = MockCommandRunner::new();
        runner.expect_run().returning(|_, _, _| {
            Ok(ProcessOutput {
                exit_ok: true,
                exit_code: Some(0),
                stdout: "ups.status: OL\n".to_owned(),
                stderr: String::new(),
            })
        });
        AppState::for_tests(settings, Arc::new(runner)).await
    }

    #[actix_rt::test]
    async fn test_internal_ws_event_reemits() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir).await;
        let mut rx = state.bus.subscribe();

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(Arc::clone(&state)))
                .route(
                    "/internal/ws_event",
                    web::post().to(internal_ws_event_route),
                ),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/internal/ws_event")
            .set_json(json!({
                "type": "usb_disconnect",
                "timestamp": "2024-06-01 12:00:00",
                "status": "NOCOMM",
            }))
            .to_request();
        let response: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(response["success"], true);

        match rx.try_recv().unwrap() {
            BusEvent::UsbDisconnect { status, .. } => assert_eq!(status, "NOCOMM"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[actix_rt::test]
    async fn test_health_route_shape() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir).await;
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(Arc::clone(&state)))
                .route("/health", web::get().to(health_route)),
        )
        .await;

        let req = test::TestRequest::get().uri("/health").to_request();
        let response: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(response["status"], "ok");
        assert_eq!(response["connection"]["connected"], true);
        assert!(response["version"].is_string());
    }
}
