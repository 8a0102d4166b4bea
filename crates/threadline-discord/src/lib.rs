//! Discord implementation of the Threadline gateway client, built on serenity.
//!
//! [`DiscordGatewayFactory`] is handed to the supervisor; every client it
//! builds owns one serenity [`Client`](serenity::Client) and reports its
//! lifecycle through the supervisor's event sink.

pub mod client;
pub mod convert;
mod handler;

pub use client::{DiscordClient, DiscordGatewayFactory};
