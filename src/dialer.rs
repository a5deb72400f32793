//! A thin shim to the OS dialer and (optionally) TLS, matching the `Dialer` collaborator
//! contract described in the design document's §6: TCP vs. UNIX domain socket selection by
//! address shape, TCP_NODELAY, platform-capped keepalive, and TLS layered on top when
//! configured.

use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
};

#[cfg(unix)]
use tokio::net::UnixStream;

use crate::{
    collab::{BoxFuture, Dialer, StreamHealth},
    error::{Error, Result},
    options::Address,
};

/// Platform-capped keepalive parameters applied to every TCP socket this dialer opens.
const KEEPALIVE_IDLE: Duration = Duration::from_secs(120);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);
const KEEPALIVE_RETRIES: u32 = 9;

/// The stream type produced by [`TcpUnixDialer`]: either a plain TCP socket, a UNIX domain
/// socket, or a TCP socket wrapped in TLS.
pub enum PoolStream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
    #[cfg(feature = "rustls-tls")]
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for PoolStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            PoolStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(unix)]
            PoolStream::Unix(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(feature = "rustls-tls")]
            PoolStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for PoolStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            PoolStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(unix)]
            PoolStream::Unix(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(feature = "rustls-tls")]
            PoolStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            PoolStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            #[cfg(unix)]
            PoolStream::Unix(s) => Pin::new(s).poll_flush(cx),
            #[cfg(feature = "rustls-tls")]
            PoolStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            PoolStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(unix)]
            PoolStream::Unix(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(feature = "rustls-tls")]
            PoolStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

impl StreamHealth for PoolStream {
    fn is_closed(&self) -> bool {
        let mut probe = [0u8; 1];
        let result = match self {
            PoolStream::Tcp(s) => s.try_read(&mut probe),
            #[cfg(unix)]
            PoolStream::Unix(s) => s.try_read(&mut probe),
            #[cfg(feature = "rustls-tls")]
            PoolStream::Tls(s) => s.get_ref().0.try_read(&mut probe),
        };
        match result {
            Ok(0) => true,
            Ok(_) => false,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => false,
            Err(_) => true,
        }
    }
}

/// Dials TCP or UNIX domain sockets (selected by [`Address::is_unix_socket`]) and optionally
/// layers TLS on top of a TCP connection.
pub struct TcpUnixDialer {
    #[cfg(feature = "rustls-tls")]
    tls_config: Option<std::sync::Arc<rustls::ClientConfig>>,
}

impl Default for TcpUnixDialer {
    fn default() -> Self {
        Self {
            #[cfg(feature = "rustls-tls")]
            tls_config: None,
        }
    }
}

impl TcpUnixDialer {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(feature = "rustls-tls")]
    pub fn with_tls(mut self, config: std::sync::Arc<rustls::ClientConfig>) -> Self {
        self.tls_config = Some(config);
        self
    }

    /// Layers TLS on top of this dialer using the Mozilla root store shipped by
    /// `webpki-roots`, the recommended default for production use absent a caller-supplied CA.
    #[cfg(feature = "rustls-tls")]
    pub fn with_system_roots_tls(self) -> Result<Self> {
        Ok(self.with_tls(std::sync::Arc::new(default_tls_config()?)))
    }

    fn configure_tcp(stream: &TcpStream) -> Result<()> {
        stream.set_nodelay(true).map_err(|e| Error::connection_failure(e, false))?;

        #[cfg(not(windows))]
        {
            use socket2::{SockRef, TcpKeepalive};

            let keepalive = TcpKeepalive::new()
                .with_time(KEEPALIVE_IDLE)
                .with_interval(KEEPALIVE_INTERVAL);
            #[cfg(not(any(target_os = "windows", target_os = "openbsd")))]
            let keepalive = keepalive.with_retries(KEEPALIVE_RETRIES);

            SockRef::from(stream)
                .set_tcp_keepalive(&keepalive)
                .map_err(|e| Error::connection_failure(e, false))?;
        }

        Ok(())
    }

    async fn dial_tcp(&self, address: &Address) -> Result<TcpStream> {
        let host_port = format!("{}:{}", address.host, address.port.unwrap_or(0));
        let stream = TcpStream::connect(host_port)
            .await
            .map_err(|e| Error::connection_failure(e, false))?;
        Self::configure_tcp(&stream)?;
        Ok(stream)
    }
}

/// Builds a `rustls::ClientConfig` trusting the Mozilla root store shipped by `webpki-roots`,
/// for callers who don't want to assemble their own `RootCertStore`.
#[cfg(feature = "rustls-tls")]
fn default_tls_config() -> Result<rustls::ClientConfig> {
    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config = rustls::ClientConfig::builder_with_provider(rustls::crypto::ring::default_provider().into())
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::invalid_argument(format!("unsupported TLS protocol versions: {e}")))?
        .with_root_certificates(root_store)
        .with_no_client_auth();

    Ok(config)
}

impl Dialer for TcpUnixDialer {
    type Stream = PoolStream;

    fn dial<'a>(&'a self, address: &'a Address, timeout: Duration) -> BoxFuture<'a, Result<Self::Stream>> {
        Box::pin(async move {
            let connect = async {
                #[cfg(unix)]
                if address.is_unix_socket() {
                    let stream = UnixStream::connect(&address.host)
                        .await
                        .map_err(|e| Error::connection_failure(e, false))?;
                    return Ok(PoolStream::Unix(stream));
                }

                let tcp = self.dial_tcp(address).await?;

                #[cfg(feature = "rustls-tls")]
                if let Some(tls_config) = &self.tls_config {
                    let connector = tokio_rustls::TlsConnector::from(tls_config.clone());
                    let server_name = rustls::pki_types::ServerName::try_from(address.host.clone())
                        .map_err(|e| Error::certificate_error(e.to_string()))?;
                    let tls_stream = connector
                        .connect(server_name, tcp)
                        .await
                        .map_err(|e| Error::connection_failure(e, false))?;
                    return Ok(PoolStream::Tls(Box::new(tls_stream)));
                }

                Ok(PoolStream::Tcp(tcp))
            };

            match tokio::time::timeout(timeout, connect).await {
                Ok(result) => result,
                Err(_) => Err(Error::connection_failure(
                    io::Error::new(io::ErrorKind::TimedOut, "timed out dialing connection"),
                    true,
                )),
            }
        })
    }
}
