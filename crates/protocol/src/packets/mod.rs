//! Message definitions for the colorfall protocol.
//!
//! This module contains both client->server intents and server->client events.
//! Every message is a JSON object of the form `{"type": ..., "data": ...}`.

mod client;
mod server;

pub use client::*;
pub use server::*;
