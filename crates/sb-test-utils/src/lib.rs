//! Shared test helpers: a WebSocket client speaking the frame protocol.

mod frame_client;

pub use frame_client::FrameClient;
