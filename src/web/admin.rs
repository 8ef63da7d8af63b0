use crate::state::SharedState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde_json::json;
use tracing::{error, info};

type ApiResult = Result<Json<serde_json::Value>, (StatusCode, String)>;

fn internal(e: anyhow::Error) -> (StatusCode, String) {
    error!("Control request failed: {:#}", e);
    (StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", e))
}

/// 获取系统状态 API
/// 返回内存、负载以及各 supervisor 的会话数量与 PID
pub async fn sys_status(State(state): State<SharedState>) -> Json<serde_json::Value> {
    // 获取内存信息，默认值为 0
    let mem = sys_info::mem_info().map(|m| (m.total, m.avail)).unwrap_or((0, 0));
    // 获取负载信息，默认值为 0.0
    let load = sys_info::loadavg().map(|l| l.one).unwrap_or(0.0);

    Json(json!({
        "mem_total": mem.0 / 1024, // 转换为MB
        "mem_avail": mem.1 / 1024, // 转换为MB
        "load_avg": load,
        "sessions": state.session_counts(),
        "pids": state.active_pids(),
    }))
}

/// 列出某个 feed 的录像文件，最新的在前
pub async fn list_recordings(State(state): State<SharedState>, Path(feed_id): Path<i64>) -> ApiResult {
    let recordings = state.list_recordings(feed_id).await.map_err(internal)?;
    Ok(Json(json!({ "feed_id": feed_id, "recordings": recordings })))
}

/// 手动控制 API
/// CRUD 层与管理界面通过它触发 reconcile、重启与停止
pub async fn control(State(state): State<SharedState>, Path(action): Path<String>) -> ApiResult {
    info!("Control action requested: {}", action);
    let body = match action.as_str() {
        "refresh-detectors" => json!({ "report": state.refresh_detectors().await.map_err(internal)? }),
        "refresh-recordings" => json!({ "report": state.refresh_recordings().await.map_err(internal)? }),
        "restart-detectors" => json!({ "report": state.restart_all_detectors().await.map_err(internal)? }),
        "stop-detectors" => {
            state.stop_all_detectors().await;
            json!({ "stopped": true })
        }
        "stop-streams" => {
            state.stop_all_streams().await;
            json!({ "stopped": true })
        }
        "feeds-changed" => {
            state.feeds_changed().await.map_err(internal)?;
            json!({ "sessions": state.session_counts() })
        }
        "sweep" => json!({ "killed": state.sweep_zombies().await }),
        _ => return Err((StatusCode::NOT_FOUND, format!("Unknown action: {}", action))),
    };
    Ok(Json(body))
}
