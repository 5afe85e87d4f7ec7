use crate::config::AppConfig;
use crate::state::{AppMetrics, AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();
    let uptime_seconds = state.get_uptime_seconds();
    let active_sessions = state.sessions.active_count();

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "service": {
            "name": "emotion-stream-backend",
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "metrics": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": if metrics.request_count > 0 {
                metrics.error_count as f64 / metrics.request_count as f64
            } else {
                0.0
            },
            "active_sessions": active_sessions,
            "total_sessions": metrics.total_sessions
        },
        "memory": get_memory_info(),
        "classifier": {
            "backend": state.classifier_info.backend.as_str(),
            "model": state.classifier_info.model,
            "loaded": state.classifier.is_loaded()
        },
        "system": get_system_status(&config, active_sessions)
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();
    let config = state.get_config();
    let sessions = state.sessions.summary();

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "overall": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": if metrics.request_count > 0 {
                metrics.error_count as f64 / metrics.request_count as f64
            } else {
                0.0
            },
            "active_sessions": sessions.active_sessions,
            "total_sessions": metrics.total_sessions,
            "requests_per_second": if uptime_seconds > 0 {
                metrics.request_count as f64 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "endpoints": endpoint_stats(&metrics),
        "sessions": sessions,
        "memory": get_memory_info(),
        "audio": config.audio,
        "performance": config.performance
    }))
}

fn endpoint_stats(metrics: &AppMetrics) -> Vec<serde_json::Value> {
    let mut stats: Vec<_> = metrics
        .endpoint_metrics
        .iter()
        .map(|(endpoint, metric)| {
            json!({
                "endpoint": endpoint,
                "request_count": metric.request_count,
                "error_count": metric.error_count,
                "error_rate": metric.error_rate(),
                "average_duration_ms": metric.average_duration_ms(),
                "total_duration_ms": metric.total_duration_ms
            })
        })
        .collect();
    stats.sort_by(|a, b| a["endpoint"].as_str().cmp(&b["endpoint"].as_str()));
    stats
}

fn get_memory_info() -> serde_json::Value {
    #[cfg(target_os = "linux")]
    {
        let pid = std::process::id();
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", pid)) {
            let read_kb = |prefix: &str| {
                status
                    .lines()
                    .find(|line| line.starts_with(prefix))
                    .and_then(|line| line.split_whitespace().nth(1))
                    .and_then(|kb| kb.parse::<u64>().ok())
                    .unwrap_or(0)
                    * 1024
            };

            return json!({
                "resident_memory_bytes": read_kb("VmRSS:"),
                "virtual_memory_bytes": read_kb("VmSize:"),
                "available": true
            });
        }
    }

    json!({
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false,
        "note": "Memory info not available on this platform"
    })
}

fn get_system_status(config: &AppConfig, active_sessions: usize) -> serde_json::Value {
    let max_sessions = config.performance.max_concurrent_sessions;
    let session_usage = if max_sessions > 0 {
        active_sessions as f64 / max_sessions as f64
    } else {
        0.0
    };

    let status = if session_usage >= 1.0 {
        "full"
    } else if session_usage > 0.7 {
        "moderate_load"
    } else {
        "normal"
    };

    json!({
        "status": status,
        "session_usage_percent": (session_usage * 100.0).round(),
        "max_sessions": max_sessions,
        "current_sessions": active_sessions,
        "load_warnings": if session_usage > 0.8 {
            vec!["Session usage is high; new connections will be refused at the limit"]
        } else {
            vec![]
        }
    })
}
