use tokio::net::TcpListener;

use super::dialer::DialedConn;
use crate::config::EndpointConfig;
use crate::error::TransportError;

pub(crate) enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(tokio::net::UnixListener, std::path::PathBuf),
}

impl Listener {
    /// Binds per `config`. Returns the listener and the address it ended up on.
    pub(crate) async fn bind(config: &EndpointConfig) -> Result<(Self, String), TransportError> {
        let addr = config.listen_address.as_str();
        match config.network.as_str() {
            "tcp" | "tcp4" | "tcp6" => {
                let listener = TcpListener::bind(addr)
                    .await
                    .map_err(|e| TransportError::ConnectionFailed(format!("listen {addr}: {e}")))?;
                let bound = listener
                    .local_addr()
                    .map(|a| a.to_string())
                    .unwrap_or_else(|_| addr.to_string());
                Ok((Listener::Tcp(listener), bound))
            }
            #[cfg(unix)]
            "unix" => {
                let path = std::path::PathBuf::from(addr);
                // A stale socket file from an earlier run blocks bind.
                if path.exists() {
                    let _ = std::fs::remove_file(&path);
                }
                let listener = tokio::net::UnixListener::bind(&path)
                    .map_err(|e| TransportError::ConnectionFailed(format!("listen {addr}: {e}")))?;
                Ok((Listener::Unix(listener, path), addr.to_string()))
            }
            other => Err(TransportError::UnsupportedNetwork(other.to_string())),
        }
    }

    pub(crate) async fn accept(&self) -> std::io::Result<DialedConn> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                let _ = stream.set_nodelay(true);
                let local_addr = stream.local_addr().ok().map(|a| a.to_string());
                Ok(DialedConn {
                    stream: Box::new(stream),
                    local_addr,
                    remote_addr: Some(peer.to_string()),
                })
            }
            #[cfg(unix)]
            Listener::Unix(listener, path) => {
                let (stream, _) = listener.accept().await?;
                Ok(DialedConn {
                    stream: Box::new(stream),
                    local_addr: Some(path.display().to_string()),
                    // Unix peers are usually unnamed; let the socket pick an id.
                    remote_addr: None,
                })
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Listener::Unix(_, path) = self {
            let _ = std::fs::remove_file(path);
        }
    }
}
