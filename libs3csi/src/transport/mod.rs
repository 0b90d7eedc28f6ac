//! QUIC transport layer for node messages.
//!
//! This module provides [`CsiClient`] and [`CsiServer`] that communicate
//! [`CsiMessage`] values over QUIC bi-directional streams using `quinn`.
//!
//! [`CsiClient`]: client::CsiClient
//! [`CsiServer`]: server::CsiServer
//! [`CsiMessage`]: crate::message::CsiMessage

pub mod client;
pub mod server;
pub mod tls;

/// Upper bound on a single request or response frame.
pub(crate) const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;
