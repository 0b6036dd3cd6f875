#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use mqtt_scan_rs::types::{Credential, Target};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_native_tls::TlsAcceptor;

/// CONNACK "not authorized".
pub const NOT_AUTHORIZED: u8 = 0x05;

/// Largest CONNECT body the test broker will buffer.
const MAX_CONNECT_LEN: usize = 4096;

const TEST_CERT: &[u8] = include_bytes!("../fixtures/broker.crt");
const TEST_KEY: &[u8] = include_bytes!("../fixtures/broker.key");

type AcceptFn = Arc<dyn Fn(Option<&Credential>) -> bool + Send + Sync>;

/// In-process MQTT broker that answers CONNECT according to a predicate and
/// records every credential it was offered (`None` = anonymous).
pub struct FakeBroker {
    pub port: u16,
    pub attempts: Arc<Mutex<Vec<Option<Credential>>>>,
}

impl FakeBroker {
    pub fn target(&self) -> Target {
        Target::new("127.0.0.1", self.port)
    }

    pub fn attempts(&self) -> Vec<Option<Credential>> {
        self.attempts.lock().unwrap().clone()
    }
}

pub async fn spawn_broker<F>(accept: F) -> FakeBroker
where
    F: Fn(Option<&Credential>) -> bool + Send + Sync + 'static,
{
    start_broker(Arc::new(accept), None).await
}

/// Same broker behind TLS with a self-signed certificate for `localhost`.
pub async fn spawn_tls_broker<F>(accept: F) -> FakeBroker
where
    F: Fn(Option<&Credential>) -> bool + Send + Sync + 'static,
{
    let identity = native_tls::Identity::from_pkcs8(TEST_CERT, TEST_KEY).unwrap();
    let acceptor = TlsAcceptor::from(native_tls::TlsAcceptor::new(identity).unwrap());
    start_broker(Arc::new(accept), Some(acceptor)).await
}

async fn start_broker(accept: AcceptFn, tls: Option<TlsAcceptor>) -> FakeBroker {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let attempts = Arc::new(Mutex::new(Vec::new()));

    let recorded = attempts.clone();
    tokio::spawn(async move {
        loop {
            let Ok((sock, _)) = listener.accept().await else {
                return;
            };
            let recorded = recorded.clone();
            let accept = accept.clone();
            let tls = tls.clone();
            tokio::spawn(async move {
                match tls {
                    // Reachability checks close before the TLS handshake completes.
                    Some(acceptor) => {
                        if let Ok(stream) = acceptor.accept(sock).await {
                            answer_connect(stream, &accept, &recorded).await;
                        }
                    }
                    None => answer_connect(sock, &accept, &recorded).await,
                }
            });
        }
    });

    FakeBroker { port, attempts }
}

async fn answer_connect<S>(
    mut stream: S,
    accept: &AcceptFn,
    recorded: &Mutex<Vec<Option<Credential>>>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Reachability checks close without sending anything.
    let Some(credential) = read_connect(&mut stream).await else {
        return;
    };
    let ok = accept(credential.as_ref());
    recorded.lock().unwrap().push(credential);
    let code = if ok { 0x00 } else { NOT_AUTHORIZED };
    let _ = stream.write_all(&[0x20, 0x02, 0x00, code]).await;
    let _ = stream.flush().await;
}

/// Read one MQTT 3.1.1 CONNECT and return the credential it carries.
/// `None` on EOF, a non-CONNECT packet or a body over the size cap.
pub async fn read_connect<R: AsyncRead + Unpin>(reader: &mut R) -> Option<Option<Credential>> {
    let kind = reader.read_u8().await.ok()?;
    if kind & 0xF0 != 0x10 {
        return None;
    }
    let mut remaining = 0usize;
    for shift in 0..4 {
        let b = reader.read_u8().await.ok()?;
        remaining |= ((b & 0x7F) as usize) << (7 * shift);
        if b & 0x80 == 0 {
            break;
        }
    }
    if remaining > MAX_CONNECT_LEN {
        return None;
    }
    let mut body = vec![0u8; remaining];
    reader.read_exact(&mut body).await.ok()?;

    if body.get(2..6)? != b"MQTT" {
        return None;
    }
    // name (6), level, flags, keep-alive (2)
    let flags = *body.get(7)?;
    let mut pos = 10;
    let _client_id = take_field(&body, &mut pos)?;
    let username = if flags & 0x80 != 0 { Some(take_field(&body, &mut pos)?) } else { None };
    let password = if flags & 0x40 != 0 { Some(take_field(&body, &mut pos)?) } else { None };
    Some(username.map(|u| Credential::new(u, password.unwrap_or_default())))
}

fn take_field(body: &[u8], pos: &mut usize) -> Option<String> {
    let len = u16::from_be_bytes([*body.get(*pos)?, *body.get(*pos + 1)?]) as usize;
    let bytes = body.get(*pos + 2..*pos + 2 + len)?;
    *pos += 2 + len;
    Some(String::from_utf8_lossy(bytes).into_owned())
}

/// Accepts TCP connections and never replies.
pub async fn spawn_silent_listener() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((sock, _)) = listener.accept().await {
            held.push(sock);
        }
    });
    port
}

/// A port on localhost with nothing listening.
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

pub fn short_timeout() -> Duration {
    Duration::from_secs(2)
}
