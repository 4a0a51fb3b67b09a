//! Colon-delimited token convention used by message payloads and by the
//! durable keys written in [`Client::set_and_publish`](crate::Client::set_and_publish).
//!
//! Tokens are not escaped. A token that itself contains `:` comes back as
//! several tokens, so [`decode`] inverts [`encode`] only for tokens free of
//! the delimiter.

use crate::types::Error;

/// Token separator.
pub const DELIMITER: char = ':';

/// Join tokens with `:`. No tokens yield the empty string.
pub fn encode<S: AsRef<str>>(tokens: &[S]) -> String {
    let mut out = String::with_capacity(tokens.iter().map(|t| t.as_ref().len() + 1).sum());
    for (i, token) in tokens.iter().enumerate() {
        if i > 0 {
            out.push(DELIMITER);
        }
        out.push_str(token.as_ref());
    }
    out
}

/// Split a payload on `:`, keeping empty tokens.
///
/// `""` yields `[""]` and a trailing delimiter yields a trailing empty token.
pub fn decode(raw: &str) -> Vec<String> {
    raw.split(DELIMITER).map(str::to_string).collect()
}

/// A durable write derived from a published message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

/// Payload published by `set_and_publish`: the channel joined in front of the
/// message so subscribers can recover it from the payload alone.
pub fn channel_payload(channel: &str, message: &str) -> String {
    encode(&[channel, message])
}

/// Split `message` into the key/value pair stored by `set_and_publish`.
///
/// ```text
/// channel | section:section:value   →   channel:section:section | value
/// ```
///
/// The last token is the value and every preceding token extends the key
/// after `channel`. An empty message carries no value and is rejected.
pub fn key_value(channel: &str, message: &str) -> Result<KeyValue, Error> {
    if message.is_empty() {
        return Err(Error::InvalidMessageFormat(
            "message must contain at least a value token".to_string(),
        ));
    }
    let (key, value) = match message.rsplit_once(DELIMITER) {
        Some((path, value)) => (encode(&[channel, path]), value),
        None => (channel.to_string(), message),
    };
    Ok(KeyValue {
        key,
        value: value.to_string(),
    })
}

/// Decode backend bytes as UTF-8, replacing invalid sequences with U+FFFD.
///
/// Replacement is logged at debug level; `what` names the decoded value.
pub(crate) fn lossy_text(bytes: &[u8], what: &str) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(e) => {
            tracing::debug!("Invalid UTF-8 in {what} after byte {}, replacing", e.valid_up_to());
            String::from_utf8_lossy(bytes).into_owned()
        }
    }
}
