use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::call::inbound::InboundCall;
use crate::config::ChannelConfig;
use crate::connection::{Connection, PeerInfo};
use crate::error::CallError;
use crate::handler::{FnHandler, Handler, HandlerMap};

const ACCEPT_BACKOFF_INITIAL: Duration = Duration::from_millis(5);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// A channel is one process endpoint: it accepts connections from peers,
///  dials out to them, and hosts the handlers for incoming calls. Every
///  connection it owns is bidirectional, so a channel that only dials can
///  still serve calls.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    config: Arc<ChannelConfig>,
    handlers: Arc<HandlerMap>,
    host_port: RwLock<Option<String>>,
    connections: Mutex<Vec<Connection>>,
}

impl Channel {
    pub fn new(config: ChannelConfig) -> anyhow::Result<Channel> {
        config.validate()?;
        Ok(Channel {
            inner: Arc::new(ChannelInner {
                config: Arc::new(config),
                handlers: Arc::new(HandlerMap::new()),
                host_port: RwLock::new(None),
                connections: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Binds a listener and starts accepting peer connections. A port of 0
    ///  lets the OS pick one; the effective address is returned.
    pub async fn listen(&self, bind_addr: &str) -> anyhow::Result<SocketAddr> {
        let listener = TcpListener::bind(bind_addr).await?;
        let local_addr = listener.local_addr()?;
        *self.inner.host_port.write().unwrap() = Some(local_addr.to_string());

        info!("{} listening on {}", self.inner.config.process_name, local_addr);
        tokio::spawn(accept_loop(self.inner.clone(), listener));
        Ok(local_addr)
    }

    /// The address peers can reach this channel on, once listening.
    pub fn host_port(&self) -> Option<String> {
        self.inner.host_port.read().unwrap().clone()
    }

    /// Registers a handler for a service + operation pair.
    pub async fn register(&self, service: &str, operation: &str, handler: Arc<dyn Handler>) {
        self.inner.handlers.register(service, operation.as_bytes(), handler).await;
    }

    /// Registers an async closure as the handler for a service + operation
    ///  pair.
    pub async fn register_fn<F, Fut>(&self, service: &str, operation: &str, f: F)
    where
        F: Fn(InboundCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), CallError>> + Send + 'static,
    {
        self.register(service, operation, Arc::new(FnHandler::new(f))).await;
    }

    /// Dials a peer and completes the init handshake.
    pub async fn connect(&self, host_port: &str) -> anyhow::Result<Connection> {
        let stream = TcpStream::connect(host_port).await?;

        let local_host_port = match self.host_port() {
            Some(host_port) => host_port,
            None => stream.local_addr()?.to_string(),
        };
        let local_peer = PeerInfo {
            host_port: local_host_port,
            process_name: self.inner.config.process_name.clone(),
        };

        debug!("dialing {}", host_port);
        let conn = Connection::outbound(
            stream,
            self.inner.config.clone(),
            self.inner.handlers.clone(),
            local_peer,
        )
        .await?;

        self.inner.connections.lock().unwrap().push(conn.clone());
        Ok(conn)
    }

    /// Calls a peer and waits for the complete response. Returns the ok
    ///  flag (false for application errors) and the response's arg2/arg3.
    pub async fn round_trip(
        &self,
        conn: &Connection,
        service: &str,
        operation: &str,
        arg2: &[u8],
        arg3: &[u8],
        ttl: Duration,
    ) -> Result<(bool, Vec<u8>, Vec<u8>), CallError> {
        let mut call = conn.begin_call(service, operation.as_bytes(), ttl).await?;
        call.write_arg2(arg2).await?;
        call.write_arg3(arg3).await?;

        let mut response = call.into_response();
        let ok = response.ok().await?;
        let res_arg2 = response.read_arg2().await?;
        let res_arg3 = response.read_arg3().await?;
        Ok((ok, res_arg2, res_arg3))
    }

    /// Begins a graceful close of every connection this channel owns.
    pub fn close(&self) {
        let connections = self.inner.connections.lock().unwrap().clone();
        for conn in connections {
            conn.close();
        }
    }
}

/// Accepts peer connections, backing off on transient accept errors.
async fn accept_loop(inner: Arc<ChannelInner>, listener: TcpListener) {
    let mut backoff = Duration::ZERO;

    loop {
        match listener.accept().await {
            Ok((stream, remote_addr)) => {
                backoff = Duration::ZERO;
                debug!("accepted connection from {}", remote_addr);

                let local_peer = PeerInfo {
                    host_port: inner.host_port.read().unwrap().clone().unwrap_or_default(),
                    process_name: inner.config.process_name.clone(),
                };
                let conn = Connection::inbound(
                    stream,
                    inner.config.clone(),
                    inner.handlers.clone(),
                    local_peer,
                );
                inner.connections.lock().unwrap().push(conn);
            }
            Err(e) => {
                backoff = if backoff.is_zero() {
                    ACCEPT_BACKOFF_INITIAL
                } else {
                    (backoff * 2).min(ACCEPT_BACKOFF_MAX)
                };
                warn!("accept error: {} - retrying in {:?}", e, backoff);
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameHeader, FrameType, FRAME_HEADER_LEN};
    use crate::messages::{ErrorBody, ErrorCode, InitFields};
    use rand::RngCore;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::Instant;

    async fn echo_server() -> (Channel, String) {
        let server = Channel::new(ChannelConfig::new("echo-server")).unwrap();
        server
            .register_fn("testing", "echo", |mut call| async move {
                let arg2 = call.read_arg2().await?;
                let arg3 = call.read_arg3().await?;
                call.response().write_arg2(&arg2).await?;
                call.response().write_arg3(&arg3).await?;
                Ok(())
            })
            .await;
        let addr = server.listen("127.0.0.1:0").await.unwrap();
        (server, addr.to_string())
    }

    #[tokio::test]
    async fn test_echo_round_trip() {
        let (_server, addr) = echo_server().await;

        let client = Channel::new(ChannelConfig::new("client")).unwrap();
        let conn = client.connect(&addr).await.unwrap();

        let (ok, arg2, arg3) = client
            .round_trip(&conn, "testing", "echo", b"hello", b" world", Duration::from_secs(1))
            .await
            .unwrap();

        assert!(ok);
        assert_eq!(arg2, b"hello");
        assert_eq!(arg3, b" world");
    }

    #[tokio::test]
    async fn test_missing_handler_is_a_transport_error() {
        let (_server, addr) = echo_server().await;

        let client = Channel::new(ChannelConfig::new("client")).unwrap();
        let conn = client.connect(&addr).await.unwrap();

        let result = client
            .round_trip(&conn, "testing", "missing", b"", b"", Duration::from_secs(1))
            .await;

        match result {
            Err(CallError::Remote { code, message }) => {
                assert_eq!(code, ErrorCode::BadRequest);
                assert!(message.contains("no handler"), "unexpected message: {}", message);
            }
            other => panic!("expected a remote BadRequest, got {:?}", other.map(|_| ())),
        }

        // the connection survives the failed call
        let (ok, _, _) = client
            .round_trip(&conn, "testing", "echo", b"x", b"y", Duration::from_secs(1))
            .await
            .unwrap();
        assert!(ok);
    }

    #[tokio::test]
    async fn test_large_body_spans_fragments() {
        let server = Channel::new(ChannelConfig::new("server")).unwrap();
        server
            .register_fn("testing", "length", |mut call| async move {
                let _arg2 = call.read_arg2().await?;
                let arg3 = call.read_arg3().await?;
                call.response().write_arg2(arg3.len().to_string().as_bytes()).await?;
                call.response().write_arg3(&arg3).await?;
                Ok(())
            })
            .await;
        let addr = server.listen("127.0.0.1:0").await.unwrap();

        let client = Channel::new(ChannelConfig::new("client")).unwrap();
        let conn = client.connect(&addr.to_string()).await.unwrap();

        let mut body = vec![0u8; 200_000];
        rand::thread_rng().fill_bytes(&mut body);

        let (ok, arg2, arg3) = client
            .round_trip(&conn, "testing", "length", b"", &body, Duration::from_secs(5))
            .await
            .unwrap();

        assert!(ok);
        assert_eq!(arg2, b"200000");
        assert_eq!(arg3, body);
    }

    #[tokio::test]
    async fn test_application_error_flag() {
        let server = Channel::new(ChannelConfig::new("server")).unwrap();
        server
            .register_fn("testing", "reject", |mut call| async move {
                let _arg2 = call.read_arg2().await?;
                let _arg3 = call.read_arg3().await?;
                call.response().set_application_error()?;
                call.response().write_arg2(b"reason").await?;
                call.response().write_arg3(b"details").await?;
                Ok(())
            })
            .await;
        let addr = server.listen("127.0.0.1:0").await.unwrap();

        let client = Channel::new(ChannelConfig::new("client")).unwrap();
        let conn = client.connect(&addr.to_string()).await.unwrap();

        let (ok, arg2, arg3) = client
            .round_trip(&conn, "testing", "reject", b"", b"", Duration::from_secs(1))
            .await
            .unwrap();

        assert!(!ok, "application errors surface as ok=false, not as transport errors");
        assert_eq!(arg2, b"reason");
        assert_eq!(arg3, b"details");
    }

    #[tokio::test]
    async fn test_old_protocol_version_is_rejected() {
        let (_server, addr) = echo_server().await;

        let mut stream = TcpStream::connect(&addr).await.unwrap();

        // hand-rolled InitReq carrying version 0x01
        let mut payload = Vec::new();
        InitFields { version: 0x01, ..InitFields::new("1.2.3.4:5", "old-peer") }.ser(&mut payload);
        let mut frame = Vec::new();
        FrameHeader { id: 1, frame_type: FrameType::InitReq, size: payload.len() as u16 }.ser(&mut frame);
        frame.extend_from_slice(&payload);
        stream.write_all(&frame).await.unwrap();

        // the peer answers with a connection-fatal error frame and closes
        let mut header_buf = [0u8; FRAME_HEADER_LEN];
        stream.read_exact(&mut header_buf).await.unwrap();
        let header = FrameHeader::deser(&mut header_buf.as_slice()).unwrap();
        assert_eq!(header.frame_type, FrameType::Error);

        let mut body = vec![0u8; header.size as usize];
        stream.read_exact(&mut body).await.unwrap();
        let body = ErrorBody::deser(&mut body.as_slice()).unwrap();
        assert_eq!(body.code, ErrorCode::ProtocolError);
        assert_eq!(body.id, 0);

        let mut rest = [0u8; 1];
        match stream.read(&mut rest).await {
            Ok(0) => {}
            Ok(n) => panic!("expected the connection to close, read {} more bytes", n),
            Err(_) => {}
        }
    }

    #[tokio::test]
    async fn test_concurrent_calls_complete_out_of_order() {
        let server = Channel::new(ChannelConfig::new("server")).unwrap();
        server
            .register_fn("testing", "delay", |mut call| async move {
                let arg2 = call.read_arg2().await?;
                let arg3 = call.read_arg3().await?;
                let delay: u64 = String::from_utf8_lossy(&arg2).parse().unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(delay)).await;
                call.response().write_arg2(&arg2).await?;
                call.response().write_arg3(&arg3).await?;
                Ok(())
            })
            .await;
        let addr = server.listen("127.0.0.1:0").await.unwrap();

        let client = Channel::new(ChannelConfig::new("client")).unwrap();
        let conn = client.connect(&addr.to_string()).await.unwrap();

        let started = Instant::now();
        let slow = client.round_trip(&conn, "testing", "delay", b"100", b"slow-body", Duration::from_secs(2));
        let fast = client.round_trip(&conn, "testing", "delay", b"0", b"fast-body", Duration::from_secs(2));

        let (slow_result, fast_result) = tokio::join!(
            async {
                let result = slow.await;
                (result, started.elapsed())
            },
            async {
                let result = fast.await;
                (result, started.elapsed())
            }
        );

        let (ok, _, body) = fast_result.0.unwrap();
        assert!(ok);
        assert_eq!(body, b"fast-body");

        let (ok, _, body) = slow_result.0.unwrap();
        assert!(ok);
        assert_eq!(body, b"slow-body");

        assert!(
            fast_result.1 < slow_result.1,
            "the undelayed call must complete first ({:?} vs {:?})",
            fast_result.1,
            slow_result.1
        );
    }

    #[tokio::test]
    async fn test_many_interleaved_calls_stay_independent() {
        let (_server, addr) = echo_server().await;

        let client = Channel::new(ChannelConfig::new("client")).unwrap();
        let conn = client.connect(&addr).await.unwrap();

        let mut tasks = Vec::new();
        for i in 0..16u32 {
            let client = client.clone();
            let conn = conn.clone();
            tasks.push(tokio::spawn(async move {
                let arg2 = format!("head-{}", i).into_bytes();
                let arg3 = vec![i as u8; 10_000 + i as usize];
                let (ok, res2, res3) = client
                    .round_trip(&conn, "testing", "echo", &arg2, &arg3, Duration::from_secs(5))
                    .await
                    .unwrap();
                assert!(ok);
                assert_eq!(res2, arg2);
                assert_eq!(res3, arg3);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_deadline_cancels_call_and_releases_id() {
        let server = Channel::new(ChannelConfig::new("server")).unwrap();
        server
            .register_fn("testing", "stall", |mut call| async move {
                let _arg2 = call.read_arg2().await?;
                let _arg3 = call.read_arg3().await?;
                tokio::time::sleep(Duration::from_millis(500)).await;
                call.response().write_arg2(b"").await?;
                call.response().write_arg3(b"late").await?;
                Ok(())
            })
            .await;
        server
            .register_fn("testing", "echo", |mut call| async move {
                let arg2 = call.read_arg2().await?;
                let arg3 = call.read_arg3().await?;
                call.response().write_arg2(&arg2).await?;
                call.response().write_arg3(&arg3).await?;
                Ok(())
            })
            .await;
        let addr = server.listen("127.0.0.1:0").await.unwrap();

        let client = Channel::new(ChannelConfig::new("client")).unwrap();
        let conn = client.connect(&addr.to_string()).await.unwrap();

        let result = client
            .round_trip(&conn, "testing", "stall", b"", b"", Duration::from_millis(50))
            .await;
        match result {
            // the local deadline and the server's timeout frame race
            Err(CallError::TimedOut) => {}
            Err(CallError::Remote { code: ErrorCode::Timeout, .. }) => {}
            other => panic!("expected a timeout, got {:?}", other.map(|_| ())),
        }

        // the timed-out id is gone; later traffic for it is dropped and the
        // connection keeps serving other calls
        let (ok, _, arg3) = client
            .round_trip(&conn, "testing", "echo", b"", b"still-alive", Duration::from_secs(1))
            .await
            .unwrap();
        assert!(ok);
        assert_eq!(arg3, b"still-alive");
    }

    #[tokio::test]
    async fn test_channel_close_closes_connections() {
        let (_server, addr) = echo_server().await;

        let client = Channel::new(ChannelConfig::new("client")).unwrap();
        let conn = client.connect(&addr).await.unwrap();

        client.close();
        assert!(conn.is_closed());

        let result = client
            .round_trip(&conn, "testing", "echo", b"", b"", Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(CallError::ConnectionClosed)));
    }
}
