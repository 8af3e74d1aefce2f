//! Real-time course chat for LearnSphere.
//!
//! Every course has a chat room. Browser clients open a WebSocket, join the
//! rooms of the courses they are viewing, and every message sent to a room is
//! relayed to all of its current members. Nothing is persisted.
//!
//! - [`broker`] keeps room membership and fans messages out through bounded
//!   per-connection queues.
//! - [`message`] defines the JSON events carried in WebSocket text frames and
//!   validates what clients send.
//! - [`server`] is the axum front end: a health check plus the socket route
//!   that feeds the broker.
//! - [`client`] is a terminal client that joins one room and chats from stdin.
//! - [`cli`] parses the `serve` and `client` subcommands.

pub mod broker;
pub mod cli;
pub mod client;
pub mod message;
pub mod server;
