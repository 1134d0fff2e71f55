use std::net::SocketAddr;
use tokio::net::{TcpSocket, TcpStream};

use super::EndpointCore;
use crate::config::EndpointConfig;
use crate::error::TransportError;
use crate::socket::IoStream;
use crate::status::Status;

/// A freshly connected stream with the addresses to record on the socket.
pub(crate) struct DialedConn {
    pub(crate) stream: Box<dyn IoStream>,
    pub(crate) local_addr: Option<String>,
    pub(crate) remote_addr: Option<String>,
}

/// Runs `before_dial` and opens one connection, bounded by the dial timeout.
pub(crate) async fn dial_stream(
    core: &EndpointCore,
    addr: &str,
    is_redial: bool,
) -> Result<DialedConn, Status> {
    core.plugins.before_dial(addr, is_redial).await?;

    let connecting = connect(&core.config, addr);
    let dialed = match core.config.dial_timeout() {
        Some(limit) => tokio::time::timeout(limit, connecting)
            .await
            .map_err(|_| TransportError::DialTimeout(core.config.dial_timeout_ms))
            .and_then(|r| r),
        None => connecting.await,
    };
    dialed.map_err(|e| Status::dial_failed(e.to_string()))
}

fn wants(network: &str, target: &SocketAddr) -> bool {
    match network {
        "tcp4" => target.is_ipv4(),
        "tcp6" => target.is_ipv6(),
        _ => true,
    }
}

async fn connect_tcp(
    target: SocketAddr,
    local: Option<SocketAddr>,
) -> std::io::Result<TcpStream> {
    match local {
        Some(local) => {
            let socket = if target.is_ipv4() {
                TcpSocket::new_v4()?
            } else {
                TcpSocket::new_v6()?
            };
            socket.bind(local)?;
            socket.connect(target).await
        }
        None => TcpStream::connect(target).await,
    }
}

async fn connect(config: &EndpointConfig, addr: &str) -> Result<DialedConn, TransportError> {
    match config.network.as_str() {
        "tcp" | "tcp4" | "tcp6" => {
            let local = config
                .local_address
                .as_deref()
                .map(str::parse::<SocketAddr>)
                .transpose()
                .map_err(|e| TransportError::ConnectionFailed(format!("local address: {e}")))?;
            let targets = tokio::net::lookup_host(addr)
                .await
                .map_err(|e| TransportError::ConnectionFailed(format!("{addr}: {e}")))?;

            let mut last_err = format!("{addr}: no {} address", config.network);
            for target in targets.filter(|t| wants(&config.network, t)) {
                match connect_tcp(target, local).await {
                    Ok(stream) => {
                        // Small frames dominate; do not batch them.
                        let _ = stream.set_nodelay(true);
                        let local_addr = stream.local_addr().ok().map(|a| a.to_string());
                        return Ok(DialedConn {
                            stream: Box::new(stream),
                            local_addr,
                            remote_addr: Some(target.to_string()),
                        });
                    }
                    Err(e) => last_err = format!("{target}: {e}"),
                }
            }
            Err(TransportError::ConnectionFailed(last_err))
        }
        #[cfg(unix)]
        "unix" => {
            let stream = tokio::net::UnixStream::connect(addr)
                .await
                .map_err(|e| TransportError::ConnectionFailed(format!("{addr}: {e}")))?;
            Ok(DialedConn {
                stream: Box::new(stream),
                local_addr: None,
                remote_addr: Some(addr.to_string()),
            })
        }
        other => Err(TransportError::UnsupportedNetwork(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_refused_is_connection_failed() {
        // Bind then drop to get a port nobody listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = connect(&EndpointConfig::default(), &addr).await.err().unwrap();
        assert!(matches!(err, TransportError::ConnectionFailed(_)));
    }

    #[tokio::test]
    async fn test_network_family_filter() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let v6_only = EndpointConfig {
            network: "tcp6".into(),
            ..Default::default()
        };
        assert!(connect(&v6_only, &addr).await.is_err());
        let dialed = connect(&EndpointConfig::default(), &addr).await.unwrap();
        assert_eq!(dialed.remote_addr.as_deref(), Some(addr.as_str()));
    }

    #[tokio::test]
    async fn test_unsupported_network() {
        let config = EndpointConfig {
            network: "sctp".into(),
            ..Default::default()
        };
        let err = connect(&config, "127.0.0.1:1").await.err().unwrap();
        assert!(matches!(err, TransportError::UnsupportedNetwork(_)));
    }
}
