//! Transport plumbing between the fuzzer and the target.
//!
//! One [`TargetConnection`] lives for exactly one test case: open, a few
//! sends and receives with per-operation timeouts, close. A zero-byte read
//! means the peer closed the connection and is classified like a receive
//! timeout so the session can weigh it against target health.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use derive_more::Display;
use derive_new::new as New;
use rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rustls::crypto::{WebPkiSupportedAlgorithms, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, ClientConnection, DigitallySignedStruct, SignatureScheme, StreamOwned};

use crate::error::{Error, Result};

/// Upper bound for a single receive.
pub const MAX_RECV: usize = 65_536;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Transport {
    #[display("tcp")]
    Tcp,
    #[display("udp")]
    Udp,
    /// TCP with a TLS client session on top. Certificate verification is
    /// disabled — the peer is the system under test.
    #[display("tcp+tls")]
    TcpTls,
}

impl FromStr for Transport {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Transport::Tcp),
            "udp" => Ok(Transport::Udp),
            "tcp+tls" => Ok(Transport::TcpTls),
            other => Err(format!("unknown transport `{other}` (tcp, udp, tcp+tls)")),
        }
    }
}

enum Stream {
    Tcp(TcpStream),
    Udp(UdpSocket),
    Tls(Box<StreamOwned<ClientConnection, TcpStream>>),
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stream::Tcp(tcp) => f.debug_tuple("Tcp").field(tcp).finish(),
            Stream::Udp(udp) => f.debug_tuple("Udp").field(udp).finish(),
            Stream::Tls(tls) => f.debug_tuple("Tls").field(&tls.sock).finish(),
        }
    }
}

#[derive(Debug, New)]
pub struct TargetConnection {
    #[new(into)]
    host: String,
    port: u16,
    transport: Transport,
    send_timeout: Duration,
    recv_timeout: Duration,
    #[new(default)]
    stream: Option<Stream>,
}

impl TargetConnection {
    fn resolve(&self) -> Result<SocketAddr> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(Error::ConnectionFailed)?
            .next()
            .ok_or_else(|| {
                Error::ConnectionFailed(std::io::Error::other(format!(
                    "no address for {}:{}",
                    self.host, self.port
                )))
            })
    }

    /// Open the connection. Failures here mean the target is unreachable.
    pub fn open(&mut self) -> Result<()> {
        let addr = self.resolve()?;
        let stream = match self.transport {
            Transport::Tcp => Stream::Tcp(self.open_tcp(addr)?),
            Transport::Udp => {
                let socket = UdpSocket::bind(("0.0.0.0", 0)).map_err(Error::ConnectionFailed)?;
                socket.connect(addr).map_err(Error::ConnectionFailed)?;
                socket
                    .set_write_timeout(Some(self.send_timeout))
                    .map_err(Error::ConnectionFailed)?;
                socket
                    .set_read_timeout(Some(self.recv_timeout))
                    .map_err(Error::ConnectionFailed)?;
                Stream::Udp(socket)
            }
            Transport::TcpTls => {
                let tcp = self.open_tcp(addr)?;
                let server_name = ServerName::try_from(self.host.clone())
                    .map_err(|e| Error::ConnectionFailed(std::io::Error::other(e)))?;
                let connection = ClientConnection::new(insecure_tls_config(), server_name)?;
                Stream::Tls(Box::new(StreamOwned::new(connection, tcp)))
            }
        };
        self.stream = Some(stream);
        Ok(())
    }

    fn open_tcp(&self, addr: SocketAddr) -> Result<TcpStream> {
        let stream =
            TcpStream::connect_timeout(&addr, self.send_timeout).map_err(Error::ConnectionFailed)?;
        stream
            .set_write_timeout(Some(self.send_timeout))
            .map_err(Error::ConnectionFailed)?;
        stream
            .set_read_timeout(Some(self.recv_timeout))
            .map_err(Error::ConnectionFailed)?;
        stream.set_nodelay(true).map_err(Error::ConnectionFailed)?;
        Ok(stream)
    }

    pub fn send(&mut self, data: &[u8]) -> Result<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| Error::TestCaseAborted("send on closed connection".to_owned()))?;
        let result = match stream {
            Stream::Tcp(tcp) => tcp.write_all(data),
            Stream::Udp(udp) => udp.send(data).map(|_| ()),
            Stream::Tls(tls) => tls.write_all(data).and_then(|()| tls.flush()),
        };
        result.map_err(|e| classify_io("send", e))
    }

    /// Receive up to `max_bytes`. An empty read is reported as
    /// [`Error::RecvTimeout`]: the peer either said nothing in time or
    /// closed the connection.
    pub fn recv(&mut self, max_bytes: usize) -> Result<Vec<u8>> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| Error::TestCaseAborted("recv on closed connection".to_owned()))?;
        let mut buffer = vec![0u8; max_bytes];
        let received = match stream {
            Stream::Tcp(tcp) => tcp.read(&mut buffer),
            Stream::Udp(udp) => udp.recv(&mut buffer),
            Stream::Tls(tls) => tls.read(&mut buffer),
        };
        match received {
            Ok(0) => Err(Error::RecvTimeout),
            Ok(n) => {
                buffer.truncate(n);
                Ok(buffer)
            }
            Err(e) => Err(classify_io("recv", e)),
        }
    }

    pub fn close(&mut self) {
        self.stream = None;
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }
}

fn classify_io(op: &str, err: std::io::Error) -> Error {
    use std::io::ErrorKind;
    match err.kind() {
        ErrorKind::TimedOut | ErrorKind::WouldBlock => Error::RecvTimeout,
        ErrorKind::ConnectionReset | ErrorKind::BrokenPipe => Error::ConnectionReset(err),
        ErrorKind::ConnectionAborted => Error::ConnectionAborted(err),
        _ => Error::TestCaseAborted(format!("{op}: {err}")),
    }
}

/// Client config that accepts whatever certificate the target presents.
fn insecure_tls_config() -> Arc<ClientConfig> {
    static CONFIG: std::sync::OnceLock<Arc<ClientConfig>> = std::sync::OnceLock::new();
    CONFIG
        .get_or_init(|| {
            let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
            let verifier = AcceptAnyCertificate {
                algorithms: provider.signature_verification_algorithms,
            };
            let config = ClientConfig::builder_with_provider(provider)
                .with_safe_default_protocol_versions()
                .expect("default protocol versions are supported")
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(verifier))
                .with_no_client_auth();
            Arc::new(config)
        })
        .clone()
}

#[derive(Debug)]
struct AcceptAnyCertificate {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}
