//! Wire framing
//!
//! ```text
//! +----------+------------------+
//! | len (4B) | serde_json bytes |
//! +----------+------------------+
//! ```

use coralfs_common::{Error, Result};
use coralfs_msg::Envelope;

/// Upper bound on a single frame; anything larger is a protocol error.
pub const MAX_FRAME: usize = 16 * 1024 * 1024;

/// Serialize one envelope into a framed buffer.
pub fn encode(env: &Envelope) -> Result<Vec<u8>> {
    let body =
        serde_json::to_vec(env).map_err(|e| Error::transport(format!("encode failed: {e}")))?;
    if body.len() > MAX_FRAME {
        return Err(Error::transport(format!(
            "frame too large: {} bytes",
            body.len()
        )));
    }
    let mut buf = Vec::with_capacity(4 + body.len());
    buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
    buf.extend_from_slice(&body);
    Ok(buf)
}

/// Parse a frame body back into an envelope.
pub fn decode(body: &[u8]) -> Result<Envelope> {
    serde_json::from_slice(body).map_err(|e| Error::transport(format!("decode failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use coralfs_common::{EntityName, Inst};
    use coralfs_msg::Message;

    #[test]
    fn test_roundtrip() {
        let env = Envelope::new(
            EntityName::Client(7),
            Inst::new("127.0.0.1:1234".parse().unwrap(), 9),
            Message::CacheExpire {
                data: Bytes::from_static(b"x"),
            },
        );
        let framed = encode(&env).unwrap();
        let len = u32::from_le_bytes(framed[0..4].try_into().unwrap()) as usize;
        assert_eq!(len, framed.len() - 4);
        let out = decode(&framed[4..]).unwrap();
        assert_eq!(out, env);
    }

    #[test]
    fn test_decode_garbage() {
        assert!(decode(b"{not json").is_err());
    }
}
