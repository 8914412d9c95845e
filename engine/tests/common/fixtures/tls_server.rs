//! In-process TLS server for transport tests
//!
//! Mints a self-signed certificate with rcgen, accepts any number of
//! connections on a loopback port and answers each request through a
//! handler. The response framing is selectable so tests can exercise
//! responses that arrive in pieces or without a length.

use std::io::{BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rustls::crypto::ring;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::{ServerConfig, ServerConnection, StreamOwned};

use engine::transport::framing;

use super::mock_session::Responder;

#[derive(Debug, Clone, Copy)]
pub enum ResponseMode {
    /// `Content-Length` header, body in one write
    ContentLength,
    /// `Content-Length` header, body dribbled out in small delayed writes
    Trickle { chunk: usize, delay: Duration },
    /// No length; the body ends when the server closes the connection
    CloseDelimited,
    /// An interim `100 Continue` precedes the real response
    Continue,
}

pub struct TlsTestServer {
    pub port: u16,
    pub certificate: CertificateDer<'static>,
    connections: Arc<AtomicUsize>,
}

impl TlsTestServer {
    pub fn start(handler: Responder, mode: ResponseMode) -> Self {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
            .expect("certificate generation");
        let certificate = certified.cert.der().clone();
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
            certified.key_pair.serialize_der(),
        ));

        let config = ServerConfig::builder_with_provider(Arc::new(ring::default_provider()))
            .with_safe_default_protocol_versions()
            .expect("protocol versions")
            .with_no_client_auth()
            .with_single_cert(vec![certificate.clone()], key)
            .expect("server certificate");
        let config = Arc::new(config);

        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("local addr").port();
        let connections = Arc::new(AtomicUsize::new(0));

        let accepted = connections.clone();
        thread::spawn(move || {
            for sock in listener.incoming() {
                let Ok(sock) = sock else { break };
                accepted.fetch_add(1, Ordering::SeqCst);
                let config = config.clone();
                let handler = handler.clone();
                thread::spawn(move || serve(sock, config, handler, mode));
            }
        });

        Self {
            port,
            certificate,
            connections,
        }
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

fn serve(sock: TcpStream, config: Arc<ServerConfig>, handler: Responder, mode: ResponseMode) {
    let Ok(conn) = ServerConnection::new(config) else {
        return;
    };
    let mut reader = BufReader::new(StreamOwned::new(conn, sock));

    while let Ok(request) = framing::read_message(&mut reader) {
        let body = handler(&request.body);
        let stream = reader.get_mut();
        let written = match mode {
            ResponseMode::ContentLength => write_whole(stream, &body),
            ResponseMode::Continue => stream
                .write_all(b"HTTP/1.1 100 Continue\r\n\r\n")
                .and_then(|_| write_whole(stream, &body)),
            ResponseMode::Trickle { chunk, delay } => write_trickled(stream, &body, chunk, delay),
            ResponseMode::CloseDelimited => {
                let _ = stream
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\n\r\n")
                    .and_then(|_| stream.write_all(&body));
                // One response per connection; the close marks its end
                stream.conn.send_close_notify();
                let _ = stream.flush();
                return;
            }
        };
        if written.is_err() {
            return;
        }
    }
}

fn head(length: usize) -> String {
    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n",
        length
    )
}

fn write_whole<W: Write>(stream: &mut W, body: &[u8]) -> std::io::Result<()> {
    stream.write_all(head(body.len()).as_bytes())?;
    stream.write_all(body)?;
    stream.flush()
}

fn write_trickled<W: Write>(
    stream: &mut W,
    body: &[u8],
    chunk: usize,
    delay: Duration,
) -> std::io::Result<()> {
    stream.write_all(head(body.len()).as_bytes())?;
    stream.flush()?;
    for piece in body.chunks(chunk.max(1)) {
        thread::sleep(delay);
        stream.write_all(piece)?;
        stream.flush()?;
    }
    Ok(())
}
