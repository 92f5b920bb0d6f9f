use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Side channel the disaggregated pipeline waits on for KV-transfer-complete
/// signals. The original project uses a ZeroMQ PULL socket
/// (`services/request_service/zmq_proxy.py`); no ZeroMQ crate exists in the
/// dependency corpus, so this implements the same "simple PULL socket
/// abstraction" as a length-prefixed framed TCP listener: each message is a
/// 4-byte big-endian length followed by a UTF-8 `req_id`.
pub struct KvReadySidecar {
    finished: Arc<Mutex<HashSet<String>>>,
}

impl KvReadySidecar {
    pub fn new() -> Self {
        Self { finished: Arc::new(Mutex::new(HashSet::new())) }
    }

    pub fn is_ready(&self, req_id: &str) -> bool {
        self.finished.lock().remove(req_id)
    }

    #[cfg(test)]
    pub fn finished_for_test(&self, req_id: &str) {
        self.finished.lock().insert(req_id.to_string());
    }

    /// Binds `addr` and accepts connections until `cancel` fires. Each
    /// connection is expected to send one or more framed `req_id` messages.
    pub async fn run(
        &self,
        addr: std::net::SocketAddr,
        cancel: tokio_util::sync::CancellationToken,
    ) -> anyhow::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "kv-ready sidecar listening");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("kv-ready sidecar shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (socket, _peer) = accepted?;
                    let finished = self.finished.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(socket, finished).await {
                            warn!(error = %e, "kv-ready sidecar connection error");
                        }
                    });
                }
            }
        }
    }
}

impl Default for KvReadySidecar {
    fn default() -> Self {
        Self::new()
    }
}

async fn handle_connection(
    mut socket: tokio::net::TcpStream,
    finished: Arc<Mutex<HashSet<String>>>,
) -> anyhow::Result<()> {
    loop {
        let mut len_buf = [0u8; 4];
        if socket.read_exact(&mut len_buf).await.is_err() {
            return Ok(());
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        if len == 0 || len > 1 << 20 {
            anyhow::bail!("invalid kv-ready frame length {len}");
        }
        let mut payload = vec![0u8; len];
        socket.read_exact(&mut payload).await?;
        let req_id = String::from_utf8(payload)?;
        finished.lock().insert(req_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn receives_framed_req_id_and_marks_ready() {
        let sidecar = Arc::new(KvReadySidecar::new());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let cancel = tokio_util::sync::CancellationToken::new();
        let sidecar_clone = sidecar.clone();
        let cancel_clone = cancel.clone();
        let server = tokio::spawn(async move {
            sidecar_clone.run(addr, cancel_clone).await.unwrap();
        });

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let req_id = b"req-42";
        stream.write_all(&(req_id.len() as u32).to_be_bytes()).await.unwrap();
        stream.write_all(req_id).await.unwrap();
        stream.flush().await.unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(1), async {
            loop {
                if sidecar.is_ready("req-42") {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("kv-ready signal never arrived");

        cancel.cancel();
        let _ = server.await;
    }
}
