use crate::{error::{AppError, AppResult}, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn get_config(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": {
            "server": {
                "host": config.server.host,
                "port": config.server.port
            },
            "limits": {
                "window_ms": config.limits.window_ms,
                "max_requests": config.limits.max_requests,
                "max_keys": config.limits.max_keys,
                "idle_ttl_secs": config.limits.idle_ttl_secs
            },
            "analysis": {
                "debounce_ms": config.analysis.debounce_ms,
                "sweep_max_age_ms": config.analysis.sweep_max_age_ms,
                "backend_url": config.analysis.backend_url,
                "backend_model": config.analysis.backend_model,
                "backend_timeout_secs": config.analysis.backend_timeout_secs,
                "min_code_len": config.analysis.min_code_len
            },
            "audio": {
                "queue_capacity": config.audio.queue_capacity
            }
        }
    })))
}

pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> AppResult<HttpResponse> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let mut current_config = state.get_config();
    current_config
        .update_from_json(&json_str)
        .map_err(|e| AppError::ValidationError(e.to_string()))?;

    state
        .update_config(current_config.clone())
        .map_err(AppError::ValidationError)?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": {
            "server": {
                "host": current_config.server.host,
                "port": current_config.server.port
            },
            "limits": {
                "window_ms": current_config.limits.window_ms,
                "max_requests": current_config.limits.max_requests
            },
            "analysis": {
                "debounce_ms": current_config.analysis.debounce_ms,
                "backend_url": current_config.analysis.backend_url,
                "backend_model": current_config.analysis.backend_model,
                "backend_timeout_secs": current_config.analysis.backend_timeout_secs
            },
            "audio": {
                "queue_capacity": current_config.audio.queue_capacity
            }
        }
    })))
}
