// ABOUTME: Local stream transport connecting the codec service to its client
// ABOUTME: UNIX-domain socket or Windows named pipe with bounded-time reads and sticky close

use std::io;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time;
use tracing::{debug, warn};

#[cfg(unix)]
use std::path::PathBuf;
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};

#[cfg(unix)]
type Stream = UnixStream;

#[cfg(windows)]
use tokio::net::windows::named_pipe::{ClientOptions, NamedPipeClient, NamedPipeServer, ServerOptions};

/// A bidirectional byte stream identified by an instance name.
///
/// The service side calls [`Transport::create`], which listens under the
/// instance name and accepts exactly one peer; the client side calls
/// [`Transport::open`]. On UNIX the endpoint is a SOCK_STREAM socket at
/// `/tmp/<name>`; on Windows it is the named pipe `\\.\pipe\<name>` in
/// byte mode with a single instance.
///
/// ## Failure semantics
///
/// Any OS-level write failure, read failure, or peer disconnect closes
/// the transport. Closed is sticky: every subsequent `read` and `write`
/// returns 0. The server side removes the socket path when the transport
/// is closed or dropped, including on the error paths of `create`.
#[derive(Debug)]
pub struct Transport {
    stream: Option<Stream>,
    #[cfg(unix)]
    guard: Option<PathGuard>,
}

/// Owns the bound socket path; removal runs on drop so every exit path
/// of `create` cleans up the filesystem artifact.
#[cfg(unix)]
#[derive(Debug)]
struct PathGuard {
    path: PathBuf,
}

#[cfg(unix)]
impl Drop for PathGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(unix)]
fn endpoint_path(name: &str) -> PathBuf {
    PathBuf::from(format!("/tmp/{name}"))
}

#[cfg(unix)]
impl Transport {
    /// Listen under `name` and block until one peer connects.
    ///
    /// `buffer_bytes` sizes the pipe buffers on Windows; the UNIX socket
    /// keeps its kernel defaults.
    pub async fn create(name: &str, buffer_bytes: usize) -> io::Result<Transport> {
        let _ = buffer_bytes;
        let path = endpoint_path(name);

        // A stale path from a crashed service would make bind fail.
        let _ = std::fs::remove_file(&path);

        let listener = UnixListener::bind(&path)?;
        let guard = PathGuard { path };

        let (stream, _) = listener.accept().await?;
        debug!(name, "transport peer accepted");

        Ok(Transport { stream: Some(stream), guard: Some(guard) })
    }

    /// Connect to an existing listener under `name`.
    pub async fn open(name: &str) -> io::Result<Transport> {
        let stream = UnixStream::connect(endpoint_path(name)).await?;
        Ok(Transport { stream: Some(stream), guard: None })
    }
}

#[cfg(windows)]
impl Transport {
    pub async fn create(name: &str, buffer_bytes: usize) -> io::Result<Transport> {
        let server = ServerOptions::new()
            .first_pipe_instance(true)
            .max_instances(1)
            .in_buffer_size(buffer_bytes as u32)
            .out_buffer_size(buffer_bytes as u32)
            .create(format!(r"\\.\pipe\{name}"))?;
        server.connect().await?;
        debug!(name, "transport peer accepted");
        Ok(Transport { stream: Some(Stream::Server(server)) })
    }

    pub async fn open(name: &str) -> io::Result<Transport> {
        // All instances busy: poll with a bounded deadline, the way the
        // WaitNamedPipe API is used.
        const ERROR_PIPE_BUSY: i32 = 231;
        let path = format!(r"\\.\pipe\{name}");
        let deadline = time::Instant::now() + Duration::from_secs(20);
        let client = loop {
            match ClientOptions::new().open(&path) {
                Ok(client) => break client,
                Err(e) if e.raw_os_error() == Some(ERROR_PIPE_BUSY) => {
                    if time::Instant::now() >= deadline {
                        return Err(e);
                    }
                    time::sleep(Duration::from_millis(50)).await;
                }
                Err(e) => return Err(e),
            }
        };
        Ok(Transport { stream: Some(Stream::Client(client)) })
    }
}

impl Transport {
    /// Whether the transport is still usable. Once closed it stays
    /// closed.
    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// Release the OS handles and, on the server side, remove the socket
    /// path. Idempotent.
    pub fn close(&mut self) {
        self.stream = None;
        self.drop_guard();
    }

    #[cfg(unix)]
    fn drop_guard(&mut self) {
        self.guard = None;
    }

    #[cfg(windows)]
    fn drop_guard(&mut self) {}

    /// Write all of `data`, returning the number of bytes written.
    ///
    /// A short or failed write means the peer is gone: the transport
    /// closes and 0 is returned.
    pub async fn write(&mut self, data: &[u8]) -> usize {
        if data.is_empty() {
            return 0;
        }
        let Some(stream) = self.stream.as_mut() else {
            return 0;
        };
        match stream.write_all(data).await {
            Ok(()) => data.len(),
            Err(e) => {
                warn!(error = %e, "transport write failed");
                self.close();
                0
            }
        }
    }

    /// Read exactly `buf.len()` bytes, waiting up to `timeout` for each
    /// chunk to arrive. `None` waits indefinitely.
    ///
    /// Returns `buf.len()` on success and the count received so far on
    /// timeout. A read error or peer disconnect closes the transport and
    /// returns 0.
    pub async fn read(&mut self, buf: &mut [u8], timeout: Option<Duration>) -> usize {
        if buf.is_empty() {
            return 0;
        }
        let mut total = 0;
        while total < buf.len() {
            let Some(stream) = self.stream.as_mut() else {
                return 0;
            };
            let read = match timeout {
                Some(dur) => match time::timeout(dur, stream.read(&mut buf[total..])).await {
                    Ok(res) => res,
                    Err(_) => return total,
                },
                None => stream.read(&mut buf[total..]).await,
            };
            match read {
                Ok(0) => {
                    debug!("transport peer disconnected");
                    self.close();
                    return 0;
                }
                Ok(n) => total += n,
                Err(e) => {
                    warn!(error = %e, "transport read failed");
                    self.close();
                    return 0;
                }
            }
        }
        total
    }
}

/// The server and client halves of a named pipe do not share a type;
/// reads and writes dispatch over this pair.
#[cfg(windows)]
#[derive(Debug)]
enum Stream {
    Server(NamedPipeServer),
    Client(NamedPipeClient),
}

#[cfg(windows)]
mod pipe_io {
    use super::Stream;
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

    impl AsyncRead for Stream {
        fn poll_read(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            match self.get_mut() {
                Stream::Server(s) => Pin::new(s).poll_read(cx, buf),
                Stream::Client(c) => Pin::new(c).poll_read(cx, buf),
            }
        }
    }

    impl AsyncWrite for Stream {
        fn poll_write(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            data: &[u8],
        ) -> Poll<io::Result<usize>> {
            match self.get_mut() {
                Stream::Server(s) => Pin::new(s).poll_write(cx, data),
                Stream::Client(c) => Pin::new(c).poll_write(cx, data),
            }
        }

        fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            match self.get_mut() {
                Stream::Server(s) => Pin::new(s).poll_flush(cx),
                Stream::Client(c) => Pin::new(c).poll_flush(cx),
            }
        }

        fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            match self.get_mut() {
                Stream::Server(s) => Pin::new(s).poll_shutdown(cx),
                Stream::Client(c) => Pin::new(c).poll_shutdown(cx),
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn unique_name(tag: &str) -> String {
        format!("avpipe-transport-{tag}-{}", std::process::id())
    }

    async fn pair(name: &str) -> (Transport, Transport) {
        let (server, client) = tokio::join!(Transport::create(name, 4096), async {
            Transport::open(name).await
        });
        (server.unwrap(), client.unwrap())
    }

    #[tokio::test]
    async fn exact_read_after_write() {
        let name = unique_name("rw");
        let (mut server, mut client) = pair(&name).await;

        assert_eq!(server.write(b"hello").await, 5);

        let mut buf = [0u8; 5];
        let n = client.read(&mut buf, Some(Duration::from_secs(1))).await;
        assert_eq!(n, 5);
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn read_returns_short_count_on_timeout() {
        let name = unique_name("timeout");
        let (mut server, mut client) = pair(&name).await;

        let mut buf = [0u8; 4];
        assert_eq!(client.read(&mut buf, Some(Duration::from_millis(50))).await, 0);
        assert!(client.is_open());

        // A partial write yields a partial count, and the transport
        // stays open for the rest.
        assert_eq!(server.write(b"ab").await, 2);
        let n = client.read(&mut buf, Some(Duration::from_millis(100))).await;
        assert_eq!(n, 2);
        assert_eq!(&buf[..2], b"ab");
        assert!(client.is_open());
    }

    #[tokio::test]
    async fn close_is_sticky_and_removes_socket_path() {
        let name = unique_name("close");
        let path = endpoint_path(&name);
        let (mut server, _client) = pair(&name).await;
        assert!(path.exists());

        server.close();
        server.close();
        assert!(!server.is_open());
        assert!(!path.exists());

        assert_eq!(server.write(b"x").await, 0);
        let mut buf = [0u8; 1];
        assert_eq!(server.read(&mut buf, Some(Duration::from_millis(10))).await, 0);
    }

    #[tokio::test]
    async fn peer_disconnect_closes_reader() {
        let name = unique_name("hangup");
        let (mut server, client) = pair(&name).await;

        drop(client);
        let mut buf = [0u8; 8];
        assert_eq!(server.read(&mut buf, Some(Duration::from_secs(1))).await, 0);
        assert!(!server.is_open());
    }

    #[tokio::test]
    async fn open_without_listener_fails() {
        assert!(Transport::open(&unique_name("nobody")).await.is_err());
    }
}
