//! TLS push server.
//!
//! One task per connection; one connection carries exactly one push. The
//! connection task reads frames and forwards fragments to an assembler task
//! over a single-slot channel, so an assembly error is observed before the
//! next fragment is accepted, and at end-of-stream at the latest. The
//! handler is invoked exactly once with the assembled diff and its outcome
//! is sent back as the single terminal response.

use std::{future::Future, net::SocketAddr, sync::Arc};

use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    net::TcpListener,
    sync::mpsc,
    task::JoinSet,
};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::{
    errors::{ProtocolError, ServerError},
    protocol::{
        decode_push_frame, encode_response, read_frame, AssemblyError, DiffAssembler,
        DiffFragment, KeyDiff, PushFrame, PushResponse,
    },
};

pub type Result<T> = std::result::Result<T, ServerError>;
pub type ShutdownTx = mpsc::Sender<()>;

pub struct Server<F, Fut>
where
    F: Fn(KeyDiff) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = PushResponse> + Send,
{
    listener: TcpListener,
    local_addr: SocketAddr,
    acceptor: TlsAcceptor,
    handler: Arc<F>,
    shutdown_tx: mpsc::Sender<()>,
    shutdown_rx: mpsc::Receiver<()>,
}

impl<F, Fut> Server<F, Fut>
where
    F: Fn(KeyDiff) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = PushResponse> + Send,
{
    /// Bind the listener and wrap it with the TLS acceptor.
    pub async fn bind(
        addr: SocketAddr,
        tls: Arc<rustls::ServerConfig>,
        handler: F,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind { addr, source: e })?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| ServerError::Bind { addr, source: e })?;
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        Ok(Self {
            listener,
            local_addr,
            acceptor: TlsAcceptor::from(tls),
            handler: Arc::new(handler),
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// The bound address (resolves port 0 for tests).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Handle used to request a graceful stop: the accept loop exits and
    /// in-flight pushes run to completion before `run` returns.
    pub fn shutdown_handle(&self) -> ShutdownTx {
        self.shutdown_tx.clone()
    }

    pub async fn run(mut self) -> Result<()> {
        let mut connections: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((tcp, peer)) => {
                            let acceptor = self.acceptor.clone();
                            let handler = Arc::clone(&self.handler);

                            connections.spawn(async move {
                                let stream = match acceptor.accept(tcp).await {
                                    Ok(stream) => stream,
                                    Err(e) => {
                                        warn!("TLS handshake with {} failed: {}", peer, e);
                                        return;
                                    }
                                };
                                debug!("Client {} connected", peer);
                                if let Err(e) = handle_push(handler, stream).await {
                                    debug!("Push from {} failed: {}", peer, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = self.shutdown_rx.recv() => {
                    info!("Server shutdown requested, draining in-flight pushes");
                    break;
                }
            }
        }

        while connections.join_next().await.is_some() {}
        Ok(())
    }
}

/// Run one push over an established stream: assemble, apply, respond.
///
/// Generic over the stream so tests can drive it with `tokio::io::duplex`.
pub async fn handle_push<F, Fut, S>(handler: Arc<F>, stream: S) -> Result<()>
where
    F: Fn(KeyDiff) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = PushResponse> + Send,
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);

    let (fragment_tx, fragment_rx) = mpsc::channel::<DiffFragment>(1);
    let assembler = tokio::spawn(assemble_diff(fragment_rx));

    // Read until Done/EOF, or until the stream itself misbehaves. An early
    // assembler exit stops the loop; its error is collected below.
    let mut stream_failure: Option<PushResponse> = None;
    loop {
        let payload = match read_frame(&mut reader).await {
            Ok(Some(payload)) => payload,
            Ok(None) => break,
            Err(ProtocolError::MessageTooLarge { size }) => {
                stream_failure = Some(PushResponse::invalid_argument(format!(
                    "push frame of {} bytes exceeds the message size limit",
                    size
                )));
                break;
            }
            Err(e) => {
                stream_failure = Some(PushResponse::internal(e.to_string()));
                break;
            }
        };

        match decode_push_frame(&payload) {
            Ok(PushFrame::Done) => break,
            Ok(PushFrame::Fragment(fragment)) => {
                if assembler.is_finished() {
                    // Assembly already failed; stop accepting fragments
                    break;
                }
                if fragment_tx.send(fragment).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!("Failed to decode push frame: {}", e);
                stream_failure = Some(PushResponse::invalid_argument(format!(
                    "malformed push frame: {}",
                    e
                )));
                break;
            }
        }
    }

    // End of stream: close the handoff and collect the assembly result
    drop(fragment_tx);
    let assembled = match assembler.await {
        Ok(result) => result,
        Err(e) => {
            let response = PushResponse::internal(format!("assembler task failed: {}", e));
            return send_response(&mut writer, &response).await;
        }
    };

    let response = match (assembled, stream_failure) {
        (Err(e), _) => PushResponse::invalid_argument(e.to_string()),
        (Ok(_), Some(failure)) => failure,
        (Ok(diff), None) => handler(diff).await,
    };

    send_response(&mut writer, &response).await
}

async fn assemble_diff(
    mut fragments: mpsc::Receiver<DiffFragment>,
) -> std::result::Result<KeyDiff, AssemblyError> {
    let mut assembler = DiffAssembler::new();
    while let Some(fragment) = fragments.recv().await {
        assembler.push(fragment)?;
    }
    Ok(assembler.finish())
}

async fn send_response<W>(writer: &mut W, response: &PushResponse) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = encode_response(response)?;
    writer.write_all(&bytes).await.map_err(ServerError::Send)?;
    writer.shutdown().await.map_err(ServerError::Send)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{decode_response, encode_push_frame, ErrorCategory};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio::io::AsyncReadExt;

    type SeenDiffs = Arc<Mutex<Vec<KeyDiff>>>;

    async fn drive(frames: Vec<PushFrame>) -> (Vec<KeyDiff>, PushResponse) {
        drive_raw(
            frames
                .iter()
                .flat_map(|frame| encode_push_frame(frame).unwrap())
                .collect(),
        )
        .await
    }

    /// Feed raw bytes to the connection handler, half-close, and read the
    /// terminal response back.
    async fn drive_raw(bytes: Vec<u8>) -> (Vec<KeyDiff>, PushResponse) {
        let seen: SeenDiffs = Arc::new(Mutex::new(Vec::new()));
        let handler_seen = Arc::clone(&seen);
        let handler = Arc::new(move |diff: KeyDiff| {
            let seen = Arc::clone(&handler_seen);
            async move {
                seen.lock().unwrap().push(diff);
                PushResponse::Ok
            }
        });

        let (mut client, server_side) = tokio::io::duplex(64 * 1024);
        let server = tokio::spawn(handle_push(handler, server_side));

        // The server may respond and hang up before consuming everything we
        // send (early assembly failure), so write errors are expected
        let _ = client.write_all(&bytes).await;
        let _ = client.shutdown().await;

        let mut raw = Vec::new();
        client.read_to_end(&mut raw).await.unwrap();
        server.await.unwrap().unwrap();

        let payload = {
            let mut cursor: &[u8] = &raw;
            read_frame(&mut cursor).await.unwrap().expect("a response frame")
        };
        let response = decode_response(&payload).unwrap();
        let seen = Arc::try_unwrap(seen).unwrap().into_inner().unwrap();
        (seen, response)
    }

    fn fragment_with_insert(name: &str, content: &str) -> PushFrame {
        PushFrame::Fragment(DiffFragment {
            inserts: HashMap::from([(name.to_string(), content.to_string())]),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn push_assembles_fragments_and_invokes_handler_once() {
        let (seen, response) = drive(vec![
            fragment_with_insert("a.service", "A"),
            fragment_with_insert("b.timer", "B"),
            PushFrame::Done,
        ])
        .await;

        assert!(response.is_ok());
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].inserts.len(), 2);
    }

    #[tokio::test]
    async fn push_without_done_marker_ends_at_eof() {
        let (seen, response) = drive(vec![fragment_with_insert("a.service", "A")]).await;
        assert!(response.is_ok());
        assert_eq!(seen.len(), 1);
    }

    #[tokio::test]
    async fn conflicting_key_yields_invalid_argument_and_skips_handler() {
        let (seen, response) = drive(vec![
            fragment_with_insert("a.service", "A"),
            PushFrame::Fragment(DiffFragment {
                deletions: vec!["a.service".to_string()],
                ..Default::default()
            }),
            PushFrame::Done,
        ])
        .await;

        assert!(seen.is_empty());
        match response {
            PushResponse::Error { category, message } => {
                assert_eq!(category, ErrorCategory::InvalidArgument);
                assert!(message.contains("a.service"));
            }
            PushResponse::Ok => panic!("expected Error"),
        }
    }

    #[tokio::test]
    async fn empty_push_applies_empty_diff() {
        let (seen, response) = drive(vec![PushFrame::Done]).await;
        assert!(response.is_ok());
        assert_eq!(seen.len(), 1);
        assert!(seen[0].is_empty());
    }

    #[tokio::test]
    async fn oversized_frame_yields_invalid_argument() {
        // Hand-rolled header announcing an absurd frame size
        let header = ((crate::protocol::MAX_MESSAGE_SIZE + 1) as u32).to_be_bytes();
        let (seen, response) = drive_raw(header.to_vec()).await;
        match response {
            PushResponse::Error { category, .. } => {
                assert_eq!(category, ErrorCategory::InvalidArgument)
            }
            PushResponse::Ok => panic!("expected Error"),
        }
        assert!(seen.is_empty());
    }
}
