//! Shared WebSocket plumbing for the connector and observer endpoints.

use axum::extract::ws::{Message, WebSocket};
use sb_core::error::CoreError;
use sb_protocol::{ErrorBody, Frame, ReplyPayload};
use std::time::Duration;

/// Serialize and send one frame. Returns false when the socket is gone.
pub async fn send_frame(socket: &mut WebSocket, frame: &Frame) -> bool {
    match serde_json::to_string(frame) {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        Err(_) => true,
    }
}

/// Reply to `request` when it carries a `ref`; silently skip otherwise.
/// Returns false when the socket is gone.
pub async fn maybe_reply(socket: &mut WebSocket, request: &Frame, payload: ReplyPayload) -> bool {
    if request.frame_ref.is_none() {
        return true;
    }
    send_frame(socket, &Frame::reply_to(request, payload)).await
}

/// The structured error body for an engine error.
pub fn error_body(err: &CoreError) -> ErrorBody {
    ErrorBody {
        code: err.code().to_owned(),
        message: err.to_string(),
        failed_count: err.failed_count(),
    }
}

/// Wait for the next text frame, bounded by `timeout`.
///
/// `Ok(None)` means the peer closed; `Err(())` means timeout, transport
/// error, or an unparseable frame at the handshake stage.
pub async fn recv_frame_with_timeout(
    socket: &mut WebSocket,
    timeout: Duration,
) -> Result<Option<Frame>, ()> {
    loop {
        match tokio::time::timeout(timeout, socket.recv()).await {
            Ok(Some(Ok(Message::Text(text)))) => {
                return serde_json::from_str(&text).map(Some).map_err(|_| ());
            }
            Ok(Some(Ok(Message::Ping(data)))) => {
                let _ = socket.send(Message::Pong(data)).await;
            }
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) => return Ok(None),
            Ok(Some(Ok(_))) => {}
            Ok(Some(Err(_))) | Err(_) => return Err(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sb_protocol::error_codes;

    #[test]
    fn error_body_carries_code_and_batch_count() {
        let body = error_body(&CoreError::InvalidBatch { failed_count: 4 });
        assert_eq!(body.code, error_codes::INVALID_BATCH);
        assert_eq!(body.failed_count, Some(4));

        let body = error_body(&CoreError::InvalidAttributeId("bogus".to_owned()));
        assert_eq!(body.code, error_codes::INVALID_ATTRIBUTE_ID);
        assert_eq!(body.failed_count, None);
        assert!(body.message.contains("bogus"));
    }
}
