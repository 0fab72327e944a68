//! actix-ws 会话适配：写端 `FrameSink` 与读循环
//! actix-ws session adapter: the `FrameSink` writer side and the read loop

use crate::domain::Frame;
use crate::error::NotifyError;
use crate::ws::connection::{write_loop, CloseKind, Connection, ConnectionTiming, FrameSink, WriteExit};
use crate::ws::hub::Hub;
use crate::ws::inbound::InboundHandler;
use actix_ws::{CloseCode, CloseReason, Message, MessageStream, ProtocolError, Session};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};

/// actix-ws 会话写端
pub struct ActixSink {
    session: Session,
}

impl ActixSink {
    pub fn new(session: Session) -> Self {
        Self { session }
    }
}

fn close_code(kind: CloseKind) -> CloseCode {
    match kind {
        CloseKind::Normal => CloseCode::Normal,
        CloseKind::Error => CloseCode::Error,
    }
}

#[async_trait]
impl FrameSink for ActixSink {
    async fn send_batch(&mut self, frames: Vec<Frame>) -> Result<(), NotifyError> {
        for frame in frames {
            self.session
                .text(frame.to_string())
                .await
                .map_err(|_| NotifyError::Transport("session closed".to_string()))?;
        }
        Ok(())
    }

    async fn ping(&mut self) -> Result<(), NotifyError> {
        self.session
            .ping(b"")
            .await
            .map_err(|_| NotifyError::Transport("session closed".to_string()))
    }

    async fn close(self, kind: CloseKind) {
        let _ = self
            .session
            .close(Some(CloseReason {
                code: close_code(kind),
                description: None,
            }))
            .await;
    }
}

/// 读循环退出原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadExit {
    ClientClosed,
    Disconnected,
    IdleTimeout,
    Oversize,
    Error(String),
}

/// 读循环：每个文本帧计数并交给上行处理器；收到 pong 时重置读超时
/// Read loop: counts each text frame and hands it to the inbound handler; a pong resets
/// the read deadline.
pub async fn read_loop(
    conn: &Arc<Connection>,
    mut stream: MessageStream,
    mut session: Session,
    timing: ConnectionTiming,
    hub: &Hub,
    handler: &dyn InboundHandler,
) -> ReadExit {
    let mut deadline = Instant::now() + timing.pong_wait;

    loop {
        let msg = match timeout_at(deadline, stream.next()).await {
            Err(_) => return ReadExit::IdleTimeout,
            Ok(None) => return ReadExit::Disconnected,
            Ok(Some(Err(ProtocolError::Overflow))) => {
                close_oversize(session, conn).await;
                return ReadExit::Oversize;
            }
            Ok(Some(Err(e))) => return ReadExit::Error(e.to_string()),
            Ok(Some(Ok(msg))) => msg,
        };

        match msg {
            Message::Text(text) => {
                if text.len() > timing.max_frame_bytes {
                    close_oversize(session, conn).await;
                    return ReadExit::Oversize;
                }
                conn.record_inbound();
                hub.record_inbound();
                handler.on_frame(conn, &text).await;
            }
            Message::Ping(bytes) => {
                conn.touch();
                deadline = Instant::now() + timing.pong_wait;
                if session.pong(&bytes).await.is_err() {
                    return ReadExit::Disconnected;
                }
            }
            Message::Pong(_) => {
                conn.touch();
                deadline = Instant::now() + timing.pong_wait;
            }
            Message::Binary(_) => {
                tracing::debug!(connection_id = %conn.connection_id, "binary frame dropped");
            }
            Message::Close(reason) => {
                tracing::debug!(connection_id = %conn.connection_id, "client requested close: {:?}", reason);
                return ReadExit::ClientClosed;
            }
            _ => {}
        }
    }
}

async fn close_oversize(session: Session, conn: &Connection) {
    tracing::warn!(connection_id = %conn.connection_id, "inbound frame exceeds size limit");
    let _ = session
        .close(Some(CloseReason {
            code: CloseCode::Size,
            description: Some("frame too large".into()),
        }))
        .await;
}

/// 运行一个已注册连接的读写循环，任一方结束后恰好注销一次
/// Drive reader and writer of a registered connection; whichever ends first triggers
/// exactly one unregister.
pub async fn serve(
    conn: Arc<Connection>,
    outbound: mpsc::Receiver<Frame>,
    session: Session,
    stream: MessageStream,
    timing: ConnectionTiming,
    hub: Hub,
    handler: Arc<dyn InboundHandler>,
) {
    let mut writer = actix_web::rt::spawn(write_loop(
        conn.clone(),
        outbound,
        ActixSink::new(session.clone()),
        timing,
    ));

    let reader = read_loop(&conn, stream.max_frame_size(timing.max_frame_bytes), session, timing, &hub, &*handler);

    let writer_done = tokio::select! {
        exit = reader => {
            tracing::info!(user_id = conn.user_id, connection_id = %conn.connection_id, "👋 Client disconnected: {:?}", exit);
            false
        }
        exit = &mut writer => {
            if let Ok(WriteExit::Failed(e)) = exit {
                tracing::warn!(user_id = conn.user_id, connection_id = %conn.connection_id, "writer stopped: {}", e);
            }
            true
        }
    };

    hub.unregister(&conn).await;

    if !writer_done {
        // 出站队列已释放，写端排空后自行退出
        if tokio::time::timeout(timing.write_wait, &mut writer).await.is_err() {
            writer.abort();
        }
    }
}
