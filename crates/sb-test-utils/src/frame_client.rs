use futures_util::{SinkExt, StreamExt};
use sb_protocol::{Frame, ReplyPayload, ReplyStatus, events};
use tokio_tungstenite::MaybeTlsStream;
use tokio_tungstenite::tungstenite::protocol::Message;

type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// A test WebSocket client speaking the frame protocol.
pub struct FrameClient {
    write: futures_util::stream::SplitSink<WsStream, Message>,
    read: futures_util::stream::SplitStream<WsStream>,
    next_ref: u64,
}

impl FrameClient {
    pub async fn connect(url: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let (ws_stream, _response) = tokio_tungstenite::connect_async(url).await?;
        let (write, read) = ws_stream.split();
        Ok(Self {
            write,
            read,
            next_ref: 1,
        })
    }

    /// Send a fire-and-forget frame (no `ref`).
    pub async fn push(
        &mut self,
        topic: &str,
        event: &str,
        payload: serde_json::Value,
    ) -> Result<(), Box<dyn std::error::Error>> {
        self.send_frame(&Frame::push(topic, event, payload)).await
    }

    /// Send a frame with a fresh `ref` and wait for its reply.
    pub async fn request(
        &mut self,
        topic: &str,
        event: &str,
        payload: serde_json::Value,
    ) -> Result<ReplyPayload, Box<dyn std::error::Error>> {
        let frame_ref = self.next_ref.to_string();
        self.next_ref += 1;
        self.send_frame(&Frame::request(topic, event, payload, frame_ref.clone()))
            .await?;
        self.expect_reply(&frame_ref).await
    }

    /// `request` that must come back `ok`; returns the response body.
    pub async fn request_ok(
        &mut self,
        topic: &str,
        event: &str,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, Box<dyn std::error::Error>> {
        let reply = self.request(topic, event, payload).await?;
        if reply.status != ReplyStatus::Ok {
            return Err(format!("expected ok reply, got error: {}", reply.response).into());
        }
        Ok(reply.response)
    }

    pub async fn send_frame(&mut self, frame: &Frame) -> Result<(), Box<dyn std::error::Error>> {
        let json = serde_json::to_string(frame)?;
        self.write.send(Message::Text(json.into())).await?;
        Ok(())
    }

    /// Receive the next frame, skipping transport pings/pongs.
    pub async fn recv_frame(&mut self) -> Result<Frame, Box<dyn std::error::Error>> {
        loop {
            match self.read.next().await {
                Some(Ok(Message::Text(text))) => {
                    let frame: Frame = serde_json::from_str(&text)?;
                    return Ok(frame);
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) => return Err("connection closed by server".into()),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
                None => return Err("connection stream ended".into()),
            }
        }
    }

    /// Drain frames until the reply carrying `frame_ref` arrives.
    pub async fn expect_reply(
        &mut self,
        frame_ref: &str,
    ) -> Result<ReplyPayload, Box<dyn std::error::Error>> {
        loop {
            let frame = self.recv_frame().await?;
            if frame.event == events::REPLY && frame.frame_ref.as_deref() == Some(frame_ref) {
                return Ok(serde_json::from_value(frame.payload)?);
            }
        }
    }

    /// Drain frames until one with the given event name arrives.
    pub async fn next_event(
        &mut self,
        event: &str,
    ) -> Result<Frame, Box<dyn std::error::Error>> {
        loop {
            let frame = self.recv_frame().await?;
            if frame.event == event {
                return Ok(frame);
            }
        }
    }

    pub async fn close(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.write.send(Message::Close(None)).await?;
        Ok(())
    }
}
