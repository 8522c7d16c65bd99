//! Wire encoding of cloud-to-device messages.
//!
//! Messages are encoded as a sequence of AMQP 1.0 message sections:
//!
//! - **properties** (`0x73`): message-id, user-id, to, correlation-id,
//!   absolute-expiry-time
//! - **application-properties** (`0x74`): only when the message carries at
//!   least one property, as a map of string keys to string values
//! - **data** (`0x75`): the message body as a single binary value
//!
//! Encoding writes into a fixed-size buffer and fails with
//! [`EncodeError::Overflow`] when the buffer is too small.
//! [`encode_message`] recovers from that by doubling the buffer and encoding
//! again until the message fits or the configured ceiling is reached.

use std::fmt;

use crate::{Message, MessageHeaders};

/// Size of the first encode buffer.
pub const DEFAULT_INITIAL_BUFFER_SIZE: usize = 1024;

/// Largest buffer [`encode_message`] will grow to.
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 256 * 1024 * 1024;

const DESCRIBED: u8 = 0x00;
const SMALL_ULONG: u8 = 0x53;
const NULL: u8 = 0x40;
const VBIN8: u8 = 0xa0;
const VBIN32: u8 = 0xb0;
const STR8: u8 = 0xa1;
const STR32: u8 = 0xb1;
const TIMESTAMP: u8 = 0x83;
const LIST0: u8 = 0x45;
const LIST8: u8 = 0xc0;
const LIST32: u8 = 0xd0;
const MAP8: u8 = 0xc1;
const MAP32: u8 = 0xd1;

const PROPERTIES: u8 = 0x73;
const APPLICATION_PROPERTIES: u8 = 0x74;
const DATA: u8 = 0x75;

/// Errors raised while encoding a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// The output buffer cannot hold the encoded message.
    Overflow { needed: usize, available: usize },
    /// The message does not fit even in the largest allowed buffer.
    TooLarge { limit: usize },
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncodeError::Overflow { needed, available } => write!(
                f,
                "encode buffer overflow: need at least {needed} bytes, have {available}"
            ),
            EncodeError::TooLarge { limit } => {
                write!(f, "message does not fit in the maximum encode buffer of {limit} bytes")
            }
        }
    }
}

impl std::error::Error for EncodeError {}

/// Result of a successful [`encode_message`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encoded {
    /// Encoded message, exactly as long as the encoding.
    pub bytes: Vec<u8>,
    /// Number of encode calls needed, including the successful one.
    pub attempts: u32,
}

/// Encode `message` addressed to `address`, growing the buffer as needed.
///
/// The first attempt uses `initial_buffer_size` bytes; every overflow doubles
/// the buffer, capped at `max_buffer_size`. A message that overflows the
/// capped buffer yields [`EncodeError::TooLarge`].
pub fn encode_message(
    message: &Message,
    address: &str,
    initial_buffer_size: usize,
    max_buffer_size: usize,
) -> Result<Encoded, EncodeError> {
    let mut size = initial_buffer_size.clamp(1, max_buffer_size.max(1));
    let mut attempts = 0;

    loop {
        attempts += 1;
        let mut buf = vec![0u8; size];
        match encode_into(message, address, &mut buf) {
            Ok(len) => {
                buf.truncate(len);
                return Ok(Encoded {
                    bytes: buf,
                    attempts,
                });
            }
            Err(EncodeError::Overflow { .. }) if size < max_buffer_size => {
                size = size.saturating_mul(2).min(max_buffer_size);
                tracing::trace!(size, attempts, "Encode buffer too small, growing");
            }
            Err(EncodeError::Overflow { .. }) => {
                return Err(EncodeError::TooLarge {
                    limit: max_buffer_size,
                });
            }
            Err(err) => return Err(err),
        }
    }
}

/// Encode `message` into `buf`, returning the number of bytes written.
pub fn encode_into(message: &Message, address: &str, buf: &mut [u8]) -> Result<usize, EncodeError> {
    let mut writer = Writer { buf, pos: 0 };

    properties_section(&message.headers, address).write(&mut writer)?;
    if let Some(section) = application_properties_section(&message.headers) {
        section.write(&mut writer)?;
    }
    Value::Described(DATA, Box::new(Value::Binary(&message.message))).write(&mut writer)?;

    Ok(writer.pos)
}

fn properties_section<'a>(headers: &'a MessageHeaders, address: &'a str) -> Value<'a> {
    let opt_str = |s: &'a Option<String>| s.as_deref().map_or(Value::Null, Value::Str);

    // Field order: message-id, user-id, to, subject, reply-to, correlation-id,
    // content-type, content-encoding, absolute-expiry-time.
    let mut fields = vec![
        opt_str(&headers.message_id),
        headers
            .user_id
            .as_deref()
            .map_or(Value::Null, |user| Value::Binary(user.as_bytes())),
        Value::Str(address),
        Value::Null,
        Value::Null,
        opt_str(&headers.correlation_id),
        Value::Null,
        Value::Null,
        headers
            .expiry_time
            .map_or(Value::Null, |t| Value::Timestamp(t.timestamp_millis())),
    ];
    while matches!(fields.last(), Some(Value::Null)) {
        fields.pop();
    }

    Value::Described(PROPERTIES, Box::new(Value::List(fields)))
}

fn application_properties_section(headers: &MessageHeaders) -> Option<Value<'_>> {
    if headers.properties.is_empty() {
        return None;
    }

    let entries = headers
        .properties
        .iter()
        .map(|(k, v)| (Value::Str(k), Value::Str(v)))
        .collect();

    Some(Value::Described(
        APPLICATION_PROPERTIES,
        Box::new(Value::Map(entries)),
    ))
}

/// The subset of AMQP types a cloud-to-device message needs.
enum Value<'a> {
    Null,
    Str(&'a str),
    Binary(&'a [u8]),
    Timestamp(i64),
    List(Vec<Value<'a>>),
    Map(Vec<(Value<'a>, Value<'a>)>),
    Described(u8, Box<Value<'a>>),
}

impl Value<'_> {
    fn encoded_len(&self) -> usize {
        match self {
            Value::Null => 1,
            Value::Str(s) => variable_len(s.len()),
            Value::Binary(b) => variable_len(b.len()),
            Value::Timestamp(_) => 9,
            Value::List(items) if items.is_empty() => 1,
            Value::List(items) => {
                compound_len(items.len(), items.iter().map(Value::encoded_len).sum())
            }
            Value::Map(entries) => compound_len(
                entries.len() * 2,
                entries
                    .iter()
                    .map(|(k, v)| k.encoded_len() + v.encoded_len())
                    .sum(),
            ),
            Value::Described(_, inner) => 3 + inner.encoded_len(),
        }
    }

    fn write(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        match self {
            Value::Null => w.put_u8(NULL),
            Value::Str(s) => w.put_variable(STR8, STR32, s.as_bytes()),
            Value::Binary(b) => w.put_variable(VBIN8, VBIN32, b),
            Value::Timestamp(millis) => {
                w.put_u8(TIMESTAMP)?;
                w.put(&millis.to_be_bytes())
            }
            Value::List(items) if items.is_empty() => w.put_u8(LIST0),
            Value::List(items) => {
                let body = items.iter().map(Value::encoded_len).sum();
                w.put_compound_header(LIST8, LIST32, items.len(), body)?;
                items.iter().try_for_each(|item| item.write(w))
            }
            Value::Map(entries) => {
                let body = entries
                    .iter()
                    .map(|(k, v)| k.encoded_len() + v.encoded_len())
                    .sum();
                w.put_compound_header(MAP8, MAP32, entries.len() * 2, body)?;
                entries.iter().try_for_each(|(k, v)| {
                    k.write(w)?;
                    v.write(w)
                })
            }
            Value::Described(code, inner) => {
                w.put(&[DESCRIBED, SMALL_ULONG, *code])?;
                inner.write(w)
            }
        }
    }
}

fn variable_len(len: usize) -> usize {
    if len <= u8::MAX as usize { 2 + len } else { 5 + len }
}

fn is_compact(count: usize, body: usize) -> bool {
    count <= u8::MAX as usize && body < u8::MAX as usize
}

fn compound_len(count: usize, body: usize) -> usize {
    if is_compact(count, body) { 3 + body } else { 9 + body }
}

struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl Writer<'_> {
    fn put(&mut self, bytes: &[u8]) -> Result<(), EncodeError> {
        let end = self.pos + bytes.len();
        if end > self.buf.len() {
            return Err(EncodeError::Overflow {
                needed: end,
                available: self.buf.len(),
            });
        }
        self.buf[self.pos..end].copy_from_slice(bytes);
        self.pos = end;
        Ok(())
    }

    fn put_u8(&mut self, byte: u8) -> Result<(), EncodeError> {
        self.put(&[byte])
    }

    fn put_variable(&mut self, small: u8, large: u8, bytes: &[u8]) -> Result<(), EncodeError> {
        if bytes.len() <= u8::MAX as usize {
            self.put(&[small, bytes.len() as u8])?;
        } else {
            self.put_u8(large)?;
            self.put(&(bytes.len() as u32).to_be_bytes())?;
        }
        self.put(bytes)
    }

    // The size field counts the count field plus the encoded elements.
    fn put_compound_header(
        &mut self,
        small: u8,
        large: u8,
        count: usize,
        body: usize,
    ) -> Result<(), EncodeError> {
        if is_compact(count, body) {
            self.put(&[small, (body + 1) as u8, count as u8])
        } else {
            self.put_u8(large)?;
            self.put(&((body + 4) as u32).to_be_bytes())?;
            self.put(&(count as u32).to_be_bytes())
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::Target;

    fn described(code: u8) -> Vec<u8> {
        vec![DESCRIBED, SMALL_ULONG, code]
    }

    #[test]
    fn encodes_minimal_message_byte_exact() {
        let address = Target::device("d").address();
        let msg = Message::new("hi").with_message_id("1");

        let encoded = encode_message(&msg, &address, 1024, DEFAULT_MAX_BUFFER_SIZE).unwrap();

        let mut expected = described(PROPERTIES);
        // message-id, user-id (null), to
        let body_len = 3 + 1 + 2 + address.len();
        expected.extend_from_slice(&[LIST8, (body_len + 1) as u8, 3]);
        expected.extend_from_slice(&[STR8, 1, b'1', NULL, STR8, address.len() as u8]);
        expected.extend_from_slice(address.as_bytes());
        expected.extend(described(DATA));
        expected.extend_from_slice(&[VBIN8, 2, b'h', b'i']);

        assert_eq!(encoded.bytes, expected);
        assert_eq!(encoded.attempts, 1);
    }

    #[test]
    fn encodes_all_properties_and_application_properties() {
        let expiry = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
        let msg = Message::new(Vec::new())
            .with_message_id("m")
            .with_user_id("u")
            .with_correlation_id("c")
            .with_expiry_time(expiry)
            .with_property("b", "2")
            .with_property("a", "1");

        let encoded = encode_message(&msg, "/x", 1024, DEFAULT_MAX_BUFFER_SIZE).unwrap();

        let mut expected = described(PROPERTIES);
        let fields: Vec<u8> = [
            vec![STR8, 1, b'm'],
            vec![VBIN8, 1, b'u'],
            vec![STR8, 2, b'/', b'x'],
            vec![NULL, NULL],
            vec![STR8, 1, b'c'],
            vec![NULL, NULL],
            [vec![TIMESTAMP], 1_700_000_000_000i64.to_be_bytes().to_vec()].concat(),
        ]
        .concat();
        expected.extend_from_slice(&[LIST8, (fields.len() + 1) as u8, 9]);
        expected.extend(fields);

        expected.extend(described(APPLICATION_PROPERTIES));
        // keys are sorted
        let entries = [STR8, 1, b'a', STR8, 1, b'1', STR8, 1, b'b', STR8, 1, b'2'];
        expected.extend_from_slice(&[MAP8, (entries.len() + 1) as u8, 4]);
        expected.extend_from_slice(&entries);

        expected.extend(described(DATA));
        expected.extend_from_slice(&[VBIN8, 0]);

        assert_eq!(encoded.bytes, expected);
    }

    #[test]
    fn omits_application_properties_when_empty() {
        let msg = Message::new("x");
        let encoded = encode_message(&msg, "/x", 1024, DEFAULT_MAX_BUFFER_SIZE).unwrap();

        let app_props = described(APPLICATION_PROPERTIES);
        assert!(!encoded.bytes.windows(3).any(|w| w == app_props.as_slice()));
    }

    #[test]
    fn large_body_uses_wide_encodings() {
        let body = vec![7u8; 300];
        let msg = Message::new(body.clone());
        let encoded = encode_message(&msg, "/x", 64, DEFAULT_MAX_BUFFER_SIZE).unwrap();

        let tail_len = 1 + 4 + body.len();
        let tail = &encoded.bytes[encoded.bytes.len() - tail_len..];
        assert_eq!(tail[0], VBIN32);
        assert_eq!(&tail[1..5], &300u32.to_be_bytes());
        assert_eq!(&tail[5..], body.as_slice());
    }

    #[test]
    fn overflow_reports_needed_size() {
        let msg = Message::new(vec![0u8; 100]);
        let mut buf = [0u8; 16];
        let err = encode_into(&msg, "/x", &mut buf).unwrap_err();
        assert!(matches!(err, EncodeError::Overflow { available: 16, .. }));
    }

    #[test]
    fn growth_terminates_within_log2_attempts() {
        let initial = 1024;
        for body_len in [10usize, 1500, 3000, 9000, 70_000] {
            let msg = Message::new(vec![1u8; body_len]).with_message_id("id");
            let address = "/devices/d/messages/devicebound";
            let encoded =
                encode_message(&msg, address, initial, DEFAULT_MAX_BUFFER_SIZE).unwrap();

            let len = encoded.bytes.len();
            let expected = if len <= initial {
                1
            } else {
                (len as f64 / initial as f64).log2().ceil() as u32 + 1
            };
            assert_eq!(encoded.attempts, expected, "body of {body_len} bytes");
        }
    }

    #[test]
    fn encoded_length_matches_direct_encoding() {
        let msg = Message::new(vec![3u8; 5000]).with_property("k", "v");
        let encoded = encode_message(&msg, "/x", 16, DEFAULT_MAX_BUFFER_SIZE).unwrap();

        let mut buf = vec![0u8; 8192];
        let len = encode_into(&msg, "/x", &mut buf).unwrap();
        assert_eq!(&buf[..len], encoded.bytes.as_slice());
    }

    #[test]
    fn gives_up_past_max_buffer() {
        let msg = Message::new(vec![0u8; 3000]);
        let err = encode_message(&msg, "/x", 1024, 2048).unwrap_err();
        assert_eq!(err, EncodeError::TooLarge { limit: 2048 });
    }
}
