//! Controller-side push client.
//!
//! Opens one mTLS connection per push, streams the diff fragments, sends the
//! end-of-stream marker and waits for the terminal response. No retries: if
//! a push fails, deciding whether to resend is the controller's call.

use std::sync::Arc;

use rustls::ServerName;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::errors::ClientError;
use crate::protocol::{
    decode_response, encode_push_frame, read_frame, DiffFragment, PushFrame, PushResponse,
};

pub struct PushClient {
    addr: String,
    server_name: ServerName,
    connector: TlsConnector,
}

impl PushClient {
    /// `addr` is `host:port`; `server_name` must match the server
    /// certificate's subject.
    pub fn new(
        addr: impl Into<String>,
        server_name: &str,
        tls: Arc<rustls::ClientConfig>,
    ) -> Result<Self, ClientError> {
        let server_name = ServerName::try_from(server_name)
            .map_err(|_| ClientError::InvalidServerName(server_name.to_string()))?;
        Ok(Self {
            addr: addr.into(),
            server_name,
            connector: TlsConnector::from(tls),
        })
    }

    /// Push one diff, pre-split into fragments, and return the server's
    /// terminal response.
    pub async fn push(&self, fragments: Vec<DiffFragment>) -> Result<PushResponse, ClientError> {
        let tcp = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| ClientError::Connect {
                addr: self.addr.clone(),
                source: e,
            })?;
        let mut stream = self
            .connector
            .connect(self.server_name.clone(), tcp)
            .await
            .map_err(ClientError::Handshake)?;

        debug!("Pushing {} diff fragment(s) to {}", fragments.len(), self.addr);

        for fragment in &fragments {
            let frame = encode_push_frame(&PushFrame::Fragment(fragment.clone()))?;
            stream.write_all(&frame).await.map_err(ClientError::Send)?;
        }
        let done = encode_push_frame(&PushFrame::Done)?;
        stream.write_all(&done).await.map_err(ClientError::Send)?;
        stream.flush().await.map_err(ClientError::Send)?;

        let payload = read_frame(&mut stream)
            .await?
            .ok_or(ClientError::ConnectionClosed)?;
        Ok(decode_response(&payload)?)
    }
}
