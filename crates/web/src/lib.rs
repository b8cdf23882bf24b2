//! vncdesk management server
//!
//! Endpoint registry, liveness prober and the WebSocket-to-VNC session
//! proxy, served over an axum HTTP API.

pub mod activity;
pub mod config;
pub mod installer;
pub mod prober;
pub mod registry;
pub mod server;
pub mod sessions;
pub mod vnc_proxy;

pub use activity::ActivityLog;
pub use config::ServerConfig;
pub use prober::{LivenessProber, ProberConfig, StatusTransition};
pub use registry::{ConnectionRegistry, StatusCounts};
pub use server::WebServer;
pub use sessions::{LiveSessions, SessionGuard, SessionInfo};
pub use vnc_proxy::{ClientFrame, CloseReason, EndedBy, ProxyConfig, SessionOutcome, SessionProxy};
