//! Metric names recorded through the `metrics` facade.
//!
//! Nothing is exported by this crate; the host test binary may install any
//! `metrics` recorder to collect these.

/// WebSocket connections opened total (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "wsmock_connections_total";
/// WebSocket disconnections total (counter).
pub const WS_DISCONNECTIONS_TOTAL: &str = "wsmock_disconnections_total";
/// Active WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "wsmock_connections_active";
/// Connection lifetime seconds (histogram).
pub const WS_CONNECTION_DURATION_SECONDS: &str = "wsmock_connection_duration_seconds";
/// Inbound frames recorded total (counter, labels: opcode).
pub const FRAMES_RECEIVED_TOTAL: &str = "wsmock_frames_received_total";
/// Outbound frames transmitted total (counter, labels: opcode).
pub const FRAMES_SENT_TOTAL: &str = "wsmock_frames_sent_total";
/// Auto-replies produced by reply rules (counter, labels: rule).
pub const AUTO_REPLIES_TOTAL: &str = "wsmock_auto_replies_total";
/// Failed bind attempts during port allocation (counter).
pub const BIND_RETRIES_TOTAL: &str = "wsmock_bind_retries_total";
