//! TCP endpoint handling.
//!
//! Backend addresses use the `tcp://host:port` form of the deployment
//! configuration; a bare `host:port` is accepted as well.

use std::io;
use std::time::Duration;

use tokio::net::TcpStream;

use crate::error::{GatewayError, Result};

/// Default backend endpoint.
pub const DEFAULT_SERVER_ADDRESS: &str = "tcp://datafed.ornl.gov:7513";

/// Strip the transport scheme and return a `host:port` pair.
///
/// ```
/// use core_gateway::transport::parse_endpoint;
///
/// assert_eq!(parse_endpoint("tcp://core.local:7513").unwrap(), "core.local:7513");
/// assert_eq!(parse_endpoint("127.0.0.1:9000").unwrap(), "127.0.0.1:9000");
/// assert!(parse_endpoint("ipc:///tmp/core").is_err());
/// ```
pub fn parse_endpoint(address: &str) -> Result<String> {
    let rest = match address.split_once("://") {
        Some(("tcp", rest)) => rest,
        Some((scheme, _)) => {
            return Err(GatewayError::Protocol(format!(
                "Unsupported transport '{}' in {}",
                scheme, address
            )))
        }
        None => address,
    };

    match rest.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && host != "*" && port.parse::<u16>().is_ok() => {
            Ok(rest.to_string())
        }
        _ => Err(GatewayError::Protocol(format!(
            "Backend address {} is not host:port",
            address
        ))),
    }
}

/// Open a TCP connection to the backend.
pub async fn connect(address: &str, connect_timeout: Duration) -> Result<TcpStream> {
    let endpoint = parse_endpoint(address)?;

    let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(&endpoint))
        .await
        .map_err(|_| {
            GatewayError::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect to {} timed out after {:?}", endpoint, connect_timeout),
            ))
        })??;
    stream.set_nodelay(true)?;

    tracing::info!(endpoint = %endpoint, "connected to backend");
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_parse_endpoint_rejects_bad_forms() {
        assert!(parse_endpoint("tcp://*:7513").is_err());
        assert!(parse_endpoint("tcp://host").is_err());
        assert!(parse_endpoint("tcp://host:notaport").is_err());
        assert_eq!(
            parse_endpoint(DEFAULT_SERVER_ADDRESS).unwrap(),
            "datafed.ornl.gov:7513"
        );
    }

    #[tokio::test]
    async fn test_connect_to_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = format!("tcp://{}", listener.local_addr().unwrap());

        let accept = tokio::spawn(async move { listener.accept().await });
        let stream = connect(&addr, Duration::from_secs(1)).await.unwrap();

        assert!(stream.nodelay().unwrap());
        accept.await.unwrap().unwrap();
    }
}
