//! Startup reachability checks for telemetry destinations.

use std::time::Duration;

use reqwest::Url;
use thiserror::Error;
use tokio::net::TcpStream;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("{0} has no host or port")]
    NoAddress(String),

    #[error("timed out connecting to {0}")]
    TimedOut(String),

    #[error("cannot connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Open (and immediately close) a TCP connection to `url`'s host and port.
pub async fn reachable(url: &Url, timeout: Duration) -> Result<(), ProbeError> {
    let (Some(host), Some(port)) = (url.host_str(), url.port_or_known_default()) else {
        return Err(ProbeError::NoAddress(url.to_string()));
    };
    let addr = format!("{host}:{port}");
    match tokio::time::timeout(timeout, TcpStream::connect(addr.as_str())).await {
        Ok(Ok(_stream)) => Ok(()),
        Ok(Err(source)) => Err(ProbeError::Connect { addr, source }),
        Err(_) => Err(ProbeError::TimedOut(addr)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn listening_port_is_reachable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url: Url = format!("http://{}", listener.local_addr().unwrap())
            .parse()
            .unwrap();
        reachable(&url, Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn closed_port_is_an_error() {
        let addr = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let url: Url = format!("http://{addr}").parse().unwrap();
        let err = reachable(&url, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, ProbeError::Connect { .. } | ProbeError::TimedOut(_)));
    }
}
