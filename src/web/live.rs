use crate::state::SharedState;
use crate::stream::ViewerFrame;
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::borrow::Cow;
use tracing::{debug, info, warn};

/// Internal error, sent when the stream could not be started
const CLOSE_UNAVAILABLE: u16 = 1011;

#[derive(Debug, Deserialize)]
pub struct LiveQuery {
    pub url: Option<String>,
}

/// 实时观看入口：`GET /stream?url=<source address>`
pub async fn live_stream(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
    Query(query): Query<LiveQuery>,
) -> Response {
    let Some(address) = query.url.filter(|url| !url.trim().is_empty()) else {
        return (StatusCode::BAD_REQUEST, "Missing url parameter").into_response();
    };
    ws.on_upgrade(move |socket| serve_viewer(state, address, socket))
}

fn close_message(code: u16) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: Cow::Borrowed(""),
    }))
}

async fn serve_viewer(state: SharedState, address: String, socket: WebSocket) {
    let (viewer, mut frames) = state.viewer_channel();
    let viewer_id = viewer.id();
    let (mut sink, mut incoming) = socket.split();

    if let Err(e) = state.subscribe_live(&address, viewer).await {
        warn!("Live view of {} refused: {:#}", address, e);
        let code = match frames.try_recv() {
            Ok(ViewerFrame::Close(code)) => code,
            _ => CLOSE_UNAVAILABLE,
        };
        let _ = sink.send(close_message(code)).await;
        return;
    }
    info!("Viewer {} connected to {}", viewer_id, address);

    // 1. 把转码输出写给客户端，直到会话关闭
    let writer = async {
        while let Some(frame) = frames.recv().await {
            match frame {
                ViewerFrame::Chunk(chunk) => {
                    if sink.send(Message::Binary(chunk.to_vec())).await.is_err() {
                        break;
                    }
                }
                ViewerFrame::Close(code) => {
                    let _ = sink.send(close_message(code)).await;
                    break;
                }
            }
        }
    };

    // 2. 客户端只会发送关闭帧，其他消息忽略
    let reader = async {
        while let Some(message) = incoming.next().await {
            match message {
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    };

    tokio::select! {
        _ = writer => debug!("Viewer {} writer finished", viewer_id),
        _ = reader => debug!("Viewer {} disconnected", viewer_id),
    }

    state.unsubscribe_live(&address, viewer_id).await;
    info!("Viewer {} left {}", viewer_id, address);
}
