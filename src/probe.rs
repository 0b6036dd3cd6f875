use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time;
use tokio_native_tls::TlsConnector;
use tracing::debug;

use crate::mqtt::{self, ConnAck, MqttError};
use crate::types::{Credential, Target};

static CLIENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Plain TCP connect check. No payload is sent and the socket is closed right away.
///
/// Any failure (refused, unreachable, DNS, timeout) yields `false`.
pub async fn is_reachable(host: &str, port: u16, timeout: Duration) -> bool {
    match time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => {
            drop(stream);
            true
        }
        Ok(Err(e)) => {
            debug!(host, port, error = %e, "tcp connect failed");
            false
        }
        Err(_) => {
            debug!(host, port, ?timeout, "tcp connect timed out");
            false
        }
    }
}

/// Build a connector for MQTT over TLS. Brokers under audit rarely have
/// trusted certificates, so verification is disabled.
pub fn insecure_tls_connector() -> Result<TlsConnector, native_tls::Error> {
    let inner = native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(true)
        .danger_accept_invalid_hostnames(true)
        .build()?;
    Ok(TlsConnector::from(inner))
}

/// Unique client identifier for one session.
pub fn next_client_id(prefix: &str) -> String {
    let n = CLIENT_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}-{}-{n}", process::id())
}

/// One MQTT session attempt against `target`.
///
/// `timeout` bounds the whole exchange: TCP connect, optional TLS, CONNECT
/// and the wait for CONNACK. Returns the CONNACK return code, or `None` when
/// no acknowledgement arrived (timeout, transport error, malformed reply).
pub async fn try_login(
    target: &Target,
    timeout: Duration,
    client_id: &str,
    credential: Option<&Credential>,
    tls: Option<&TlsConnector>,
) -> Option<u8> {
    let attempt = open_session(target, client_id, credential, tls);
    match time::timeout(timeout, attempt).await {
        Ok(Ok(ack)) => {
            debug!(
                target = %target,
                user = credential.map(|c| c.username.as_str()),
                code = ack.return_code,
                "connack received"
            );
            Some(ack.return_code)
        }
        Ok(Err(e)) => {
            debug!(target = %target, error = %e, "handshake failed");
            None
        }
        Err(_) => {
            debug!(target = %target, ?timeout, "handshake timed out");
            None
        }
    }
}

async fn open_session(
    target: &Target,
    client_id: &str,
    credential: Option<&Credential>,
    tls: Option<&TlsConnector>,
) -> Result<ConnAck, MqttError> {
    let tcp = TcpStream::connect((target.host.as_str(), target.port)).await?;
    match tls {
        Some(connector) => {
            let stream = connector.connect(&target.host, tcp).await?;
            session(stream, client_id, credential).await
        }
        None => session(tcp, client_id, credential).await,
    }
}

async fn session<S>(
    mut stream: S,
    client_id: &str,
    credential: Option<&Credential>,
) -> Result<ConnAck, MqttError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ack = mqtt::handshake(&mut stream, client_id, credential).await;
    let _ = stream.shutdown().await;
    ack
}
