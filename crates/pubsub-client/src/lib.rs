//! Publisher/subscriber client for a key-value and pub/sub backend.
//!
//! A [`Client`] holds two connections: one for outbound commands (publish,
//! get, set) and one owned by a background subscriber loop that delivers
//! messages from a fixed channel set to a handler.
//!
//! # Message convention
//! Payloads are `:`-delimited token sequences (see [`codec`]). The handler
//! receives the tokens of each payload, and
//! [`set_and_publish`](Client::set_and_publish) mirrors the last token into a
//! key built from the channel and the preceding tokens.
//!
//! # Example
//! ```no_run
//! # async fn example() -> Result<(), pubsub_client::Error> {
//! use pubsub_client::{Client, ClientConfig};
//!
//! let mut client = Client::connect(ClientConfig::new("localhost", 6379)).await?;
//! client.set_channels(["Tiger", "Bird", "Fish"])?;
//! client.set_handler(|tokens| println!("{tokens:?}"))?;
//! client.start()?;
//!
//! client.set_and_publish("Tiger", "Eats:Fruit").await?;
//!
//! client.stop().await;
//! client.disconnect().await;
//! # Ok(())
//! # }
//! ```

mod client;
pub mod codec;
mod connection;
mod publish;
mod subscribe;
mod types;

pub use client::Client;
pub use publish::{SWITCH_OFF, SWITCH_ON, parse_switch_state};
pub use resp_proto::Frame;
pub use types::{
    ClientConfig, Error, ErrorHandler, MessageHandler, Role, SubscriberState, TimingConfig,
};
