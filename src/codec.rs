//! Conversion between raw characteristic payloads and protocol text.
//!
//! The device speaks plain ASCII, but fault-status tokens can carry an
//! embedded binary byte (see `cdclose`/`fdclose` handling in the decoder), so
//! a strict UTF-8 decode can fail mid-packet. When it does, each byte is
//! mapped to the code point of the same value, which keeps the embedded byte
//! recoverable via `char as u32`.

/// Decode an inbound chunk to text, falling back to a byte-for-byte mapping
/// when the chunk is not valid UTF-8.
pub fn decode(data: &[u8]) -> String {
    match std::str::from_utf8(data) {
        Ok(s) => s.to_owned(),
        Err(_) => data.iter().map(|&b| b as char).collect(),
    }
}

/// Encode an outbound command string.
///
/// Commands are ASCII, so this is a plain byte copy.
pub fn encode(text: &str) -> Vec<u8> {
    text.as_bytes().to_vec()
}
