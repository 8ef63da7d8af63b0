pub mod admin;
pub mod live;
pub mod recordings;

use crate::state::SharedState;
use axum::{
    routing::{get, post},
    Router,
};

/// 注册HTTP路由
pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/sys/status", get(admin::sys_status)) // 系统状态
        .route("/api/recordings/:feed_id", get(admin::list_recordings)) // 录像列表
        .route("/api/control/:action", post(admin::control)) // 手动控制
        .route(
            "/recordings/:feed_id/:file_name",
            get(recordings::serve_recording), // 下载录像文件
        )
        .route("/stream", get(live::live_stream)) // 实时观看 WebSocket
        .with_state(state)
}
