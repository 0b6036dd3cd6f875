//! Minimal MQTT 3.1.1 framing: just enough to send CONNECT and read CONNACK.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::types::Credential;

const CONNECT: u8 = 0x10;
const CONNACK: u8 = 0x20;
const PROTOCOL_NAME: &[u8] = b"MQTT";
const PROTOCOL_LEVEL_311: u8 = 0x04;
const FLAG_USERNAME: u8 = 0x80;
const FLAG_PASSWORD: u8 = 0x40;
const FLAG_CLEAN_SESSION: u8 = 0x02;
const KEEP_ALIVE_SECS: u16 = 60;

/// DISCONNECT packet, sent after an accepted session.
pub const DISCONNECT: [u8; 2] = [0xE0, 0x00];

/// CONNACK return code for an accepted session.
pub const CONNACK_ACCEPTED: u8 = 0x00;

#[derive(Debug, Error)]
pub enum MqttError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("tls error: {0}")]
    Tls(#[from] native_tls::Error),
    #[error("expected CONNACK (0x20), got 0x{0:02x}")]
    UnexpectedPacket(u8),
    #[error("malformed CONNACK: remaining length {0}")]
    BadConnAckLength(u8),
    #[error("{field} is {len} bytes, limit is 65535")]
    FieldTooLong { field: &'static str, len: usize },
    #[error("packet too large to encode: {0} bytes")]
    PacketTooLarge(usize),
}

/// Encode a CONNECT packet. With a credential both the username and password
/// flags are set, even for empty strings.
pub fn encode_connect(
    client_id: &str,
    credential: Option<&Credential>,
) -> Result<Vec<u8>, MqttError> {
    let mut flags = FLAG_CLEAN_SESSION;
    if credential.is_some() {
        flags |= FLAG_USERNAME | FLAG_PASSWORD;
    }

    let mut body = Vec::with_capacity(32);
    put_str(&mut body, "protocol name", PROTOCOL_NAME)?;
    body.push(PROTOCOL_LEVEL_311);
    body.push(flags);
    body.extend_from_slice(&KEEP_ALIVE_SECS.to_be_bytes());
    put_str(&mut body, "client id", client_id.as_bytes())?;
    if let Some(c) = credential {
        put_str(&mut body, "username", c.username.as_bytes())?;
        put_str(&mut body, "password", c.password.as_bytes())?;
    }

    let mut packet = Vec::with_capacity(body.len() + 5);
    packet.push(CONNECT);
    encode_remaining_length(&mut packet, body.len())?;
    packet.extend_from_slice(&body);
    Ok(packet)
}

fn put_str(buf: &mut Vec<u8>, field: &'static str, bytes: &[u8]) -> Result<(), MqttError> {
    let len = u16::try_from(bytes.len()).map_err(|_| MqttError::FieldTooLong {
        field,
        len: bytes.len(),
    })?;
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(bytes);
    Ok(())
}

/// MQTT variable-length integer, at most four bytes.
fn encode_remaining_length(buf: &mut Vec<u8>, len: usize) -> Result<(), MqttError> {
    if len > 268_435_455 {
        return Err(MqttError::PacketTooLarge(len));
    }
    let mut x = len;
    loop {
        let mut byte = (x % 128) as u8;
        x /= 128;
        if x > 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if x == 0 {
            return Ok(());
        }
    }
}

/// Parsed CONNACK variable header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnAck {
    pub session_present: bool,
    pub return_code: u8,
}

impl ConnAck {
    pub fn is_accepted(&self) -> bool {
        self.return_code == CONNACK_ACCEPTED
    }
}

/// Read exactly one CONNACK (four bytes) from the stream.
pub async fn read_connack<R: AsyncRead + Unpin>(reader: &mut R) -> Result<ConnAck, MqttError> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf[..2]).await?;
    if buf[0] != CONNACK {
        return Err(MqttError::UnexpectedPacket(buf[0]));
    }
    if buf[1] != 0x02 {
        return Err(MqttError::BadConnAckLength(buf[1]));
    }
    reader.read_exact(&mut buf[2..]).await?;
    Ok(ConnAck {
        session_present: buf[2] & 0x01 == 0x01,
        return_code: buf[3],
    })
}

/// Send CONNECT and wait for the broker's CONNACK.
pub async fn handshake<S>(
    stream: &mut S,
    client_id: &str,
    credential: Option<&Credential>,
) -> Result<ConnAck, MqttError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let packet = encode_connect(client_id, credential)?;
    stream.write_all(&packet).await?;
    stream.flush().await?;
    let ack = read_connack(stream).await?;
    if ack.is_accepted() {
        // Best effort; the session is torn down either way.
        let _ = stream.write_all(&DISCONNECT).await;
        let _ = stream.flush().await;
    }
    Ok(ack)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymous_connect_layout() {
        let p = encode_connect("test", None).unwrap();
        assert_eq!(
            p,
            vec![
                0x10, 0x10, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0x02, 0x00, 0x3c, 0x00,
                0x04, b't', b'e', b's', b't',
            ]
        );
    }

    #[test]
    fn credential_sets_both_flags_even_when_empty() {
        let p = encode_connect("c", Some(&Credential::new("", ""))).unwrap();
        assert_eq!(p[9], 0xC2);
        // client id (2+1) then two empty strings (2+2)
        assert_eq!(&p[p.len() - 4..], &[0, 0, 0, 0]);
    }

    #[test]
    fn remaining_length_uses_continuation_bytes() {
        let mut buf = Vec::new();
        encode_remaining_length(&mut buf, 321).unwrap();
        assert_eq!(buf, vec![0xC1, 0x02]);
        let mut buf = Vec::new();
        encode_remaining_length(&mut buf, 127).unwrap();
        assert_eq!(buf, vec![0x7F]);
    }

    #[test]
    fn oversized_field_rejected() {
        let long = "x".repeat(70_000);
        let err = encode_connect(&long, None).unwrap_err();
        assert!(matches!(err, MqttError::FieldTooLong { field: "client id", .. }));
    }

    #[tokio::test]
    async fn connack_parsing() {
        let mut ok: &[u8] = &[0x20, 0x02, 0x01, 0x00];
        let ack = read_connack(&mut ok).await.unwrap();
        assert!(ack.is_accepted());
        assert!(ack.session_present);

        let mut denied: &[u8] = &[0x20, 0x02, 0x00, 0x05];
        assert_eq!(read_connack(&mut denied).await.unwrap().return_code, 5);

        let mut http: &[u8] = b"HTTP/1.1 400";
        assert!(matches!(
            read_connack(&mut http).await,
            Err(MqttError::UnexpectedPacket(b'H'))
        ));

        let mut short: &[u8] = &[0x20, 0x02, 0x00];
        assert!(matches!(read_connack(&mut short).await, Err(MqttError::Io(_))));
    }

    #[test]
    fn credential_payload_follows_client_id() {
        let cred = Credential::new("anonymous", "");
        let p = encode_connect("scanner-1", Some(&cred)).unwrap();
        let payload = &p[12..];
        assert_eq!(&payload[..2], &[0x00, 0x09]);
        assert_eq!(&payload[2..11], b"scanner-1");
        assert_eq!(&payload[11..13], &[0x00, 0x09]);
        assert_eq!(&payload[13..22], b"anonymous");
        assert_eq!(&payload[22..], &[0x00, 0x00]);
    }
}
