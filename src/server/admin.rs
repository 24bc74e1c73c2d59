use super::AppState;
use crate::api::context::{full_body, BoxBody};
use hyper::body::Incoming;
use hyper::{Request, Response};
use serde_json::json;

pub fn handle_admin(req: Request<Incoming>, state: AppState) -> Result<Response<BoxBody>, hyper::Error> {
    match req.uri().path() {
        "/health" | "/healthz" => {
            let body = json!({
                "status": "ok",
                "service": state.settings.service_name,
                "window_seconds": state.settings.window_seconds,
                "api_keys": state.keys.key_count(),
            });
            Ok(Response::builder()
                .status(200)
                .header("content-type", "application/json")
                .body(full_body(body.to_string()))
                .unwrap())
        }

        "/metrics" => {
            let body = state.metrics.render();
            Ok(Response::builder()
                .status(200)
                .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
                .body(full_body(body))
                .unwrap())
        }

        _ => Ok(Response::builder()
            .status(404)
            .body(full_body(r#"{"error":"not found"}"#))
            .unwrap()),
    }
}
