//! Shared test utilities: a thin envelope-protocol client used by
//! `services/channel`'s integration tests to drive a real server instance
//! over a real WebSocket, instead of calling handler functions directly.

pub mod mock_ws_client;

pub use mock_ws_client::MockWsClient;
