//! Publish path: `PUBLISH`, `SET`, `GET` and raw commands.

use resp_proto::Frame;

use crate::client::Client;
use crate::codec;
use crate::connection::Connection;
use crate::types::{Error, Role};

/// Stored value of a switch that is on.
pub const SWITCH_ON: &str = "ON";
/// Stored value of a switch that is off, written when the key is missing.
pub const SWITCH_OFF: &str = "OFF";

/// `true` only for [`SWITCH_ON`].
pub fn parse_switch_state(value: &str) -> bool {
    value == SWITCH_ON
}

fn command_name<A: AsRef<[u8]>>(args: &[A]) -> String {
    args.first()
        .map(|a| String::from_utf8_lossy(a.as_ref()).to_ascii_uppercase())
        .unwrap_or_default()
}

impl Client {
    fn publisher(&mut self) -> Result<&mut Connection, Error> {
        self.publisher
            .as_mut()
            .ok_or_else(|| Error::Publish(Error::Disconnected(Role::Publish).to_string()))
    }

    /// Send one command on the publish path and return the reply.
    ///
    /// An error reply leaves the connection usable. A transport failure or
    /// timeout drops it; later calls fail with [`Error::Publish`].
    async fn command<A: AsRef<[u8]>>(&mut self, args: &[A]) -> Result<Frame, Error> {
        let timeout = self.config().timing.command_timeout;
        let result = self.publisher()?.request_timeout(args, timeout).await;
        match result {
            Ok(Frame::Error(message)) => Err(Error::Command {
                command: command_name(args),
                message,
            }),
            Ok(reply) => Ok(reply),
            Err(e) => {
                tracing::warn!("Publish-path connection lost: {e}");
                self.publisher = None;
                Err(Error::Publish(e.to_string()))
            }
        }
    }

    /// Publish `message` on `channel`.
    ///
    /// Succeeds whether or not anyone is subscribed; delivery is not
    /// acknowledged.
    pub async fn publish(&mut self, channel: &str, message: &str) -> Result<(), Error> {
        let reply = self.command(&["PUBLISH", channel, message]).await?;
        tracing::trace!(channel, receivers = ?reply.as_integer(), "Published");
        Ok(())
    }

    /// Publish `channel:message` on `channel` and store the message's last
    /// token under `channel` plus its preceding tokens.
    ///
    /// `set_and_publish("sensors", "kitchen:temp:21")` publishes
    /// `sensors:kitchen:temp:21` and sets `sensors:kitchen:temp` to `21`.
    /// An empty message is rejected with [`Error::InvalidMessageFormat`]
    /// before anything is sent.
    pub async fn set_and_publish(&mut self, channel: &str, message: &str) -> Result<(), Error> {
        let entry = codec::key_value(channel, message)?;
        self.publish(channel, &codec::channel_payload(channel, message))
            .await?;
        self.set(&entry.key, &entry.value).await
    }

    /// Read a key. `None` when the key does not exist.
    ///
    /// Invalid UTF-8 in the stored value is replaced with U+FFFD.
    pub async fn get(&mut self, key: &str) -> Result<Option<String>, Error> {
        match self.command(&["GET", key]).await? {
            Frame::Null => Ok(None),
            reply => match reply.as_bytes() {
                Some(bytes) => Ok(Some(codec::lossy_text(bytes, "stored value"))),
                None => Err(Error::Command {
                    command: "GET".to_string(),
                    message: format!("unexpected reply: {reply:?}"),
                }),
            },
        }
    }

    pub async fn set(&mut self, key: &str, value: &str) -> Result<(), Error> {
        self.command(&["SET", key, value]).await?;
        Ok(())
    }

    /// Send an arbitrary command on the publish path and return the raw reply.
    pub async fn execute<A: AsRef<[u8]>>(&mut self, args: &[A]) -> Result<Frame, Error> {
        if args.is_empty() {
            return Err(Error::InvalidMessageFormat("empty command".to_string()));
        }
        self.command(args).await
    }

    /// Read an on/off switch stored under `key`.
    ///
    /// A missing key is initialised to [`SWITCH_OFF`] and reads as off. A
    /// stored value reads as on only when it is [`SWITCH_ON`], and is never
    /// overwritten, even when it is not valid UTF-8.
    pub async fn switch_state(&mut self, key: &str) -> Result<bool, Error> {
        if let Some(value) = self.get(key).await? {
            return Ok(parse_switch_state(&value));
        }
        tracing::debug!(key, "Switch not set, initialising to {SWITCH_OFF}");
        self.set(key, SWITCH_OFF).await?;
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn switch_state_parsing() {
        assert!(parse_switch_state("ON"));
        assert!(!parse_switch_state("OFF"));
        assert!(!parse_switch_state("on"));
        assert!(!parse_switch_state(""));
    }

    #[test]
    fn command_name_is_upper_cased_first_argument() {
        assert_eq!(command_name(&["publish", "c", "m"]), "PUBLISH");
        let none: [&str; 0] = [];
        assert_eq!(command_name(&none), "");
    }
}
