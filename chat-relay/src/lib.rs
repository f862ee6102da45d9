//! Real-time chat relay: every message any client sends is broadcast to
//! every client currently connected.
//!
//! - [`registry`] tracks live connections and hands out snapshots for fan-out.
//! - [`hub`] runs one session per connection and performs the broadcast.
//! - [`message`] defines the chat message and its JSON line framing.
//! - [`server`] accepts TCP connections and wires them into the hub.
//! - [`client`] is a terminal client for talking to a relay.
//! - [`cli`] parses the command line for both modes.

pub mod cli;
pub mod client;
pub mod hub;
pub mod message;
pub mod registry;
pub mod server;
