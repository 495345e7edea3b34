//! Transport abstraction over the capture byte stream.
//!
//! Two backends: [`TcpTransport`] over `std::net` for real sessions, and
//! the in-memory [`PairTransport`] for tests and same-process wiring. The
//! protocol layer only sees blocking `Read`/`Write`.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

pub trait Transport: Read + Write + Send {
    /// Bound the next blocking reads; `None` blocks forever.
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()>;
}

pub trait Acceptor: Send {
    type Transport: Transport;

    /// Block until the next connection arrives.
    fn accept(&self) -> io::Result<Self::Transport>;
}

pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    pub fn connect(addr: impl ToSocketAddrs) -> io::Result<Self> {
        Ok(TcpTransport {
            stream: TcpStream::connect(addr)?,
        })
    }

    pub fn from_stream(stream: TcpStream) -> Self {
        TcpTransport { stream }
    }
}

impl Read for TcpTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for TcpTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

impl Transport for TcpTransport {
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.stream.set_read_timeout(timeout)
    }
}

pub struct TcpAcceptor {
    listener: TcpListener,
}

impl TcpAcceptor {
    pub fn bind(addr: impl ToSocketAddrs) -> io::Result<Self> {
        Ok(TcpAcceptor {
            listener: TcpListener::bind(addr)?,
        })
    }

    pub fn local_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }
}

impl Acceptor for TcpAcceptor {
    type Transport = TcpTransport;

    fn accept(&self) -> io::Result<TcpTransport> {
        let (stream, _) = self.listener.accept()?;
        Ok(TcpTransport::from_stream(stream))
    }
}

struct Pipe {
    inner: Mutex<PipeInner>,
    readable: Condvar,
}

struct PipeInner {
    buf: VecDeque<u8>,
    closed: bool,
}

impl Pipe {
    fn new() -> Arc<Self> {
        Arc::new(Pipe {
            inner: Mutex::new(PipeInner {
                buf: VecDeque::new(),
                closed: false,
            }),
            readable: Condvar::new(),
        })
    }

    fn close(&self) {
        self.inner.lock().closed = true;
        self.readable.notify_all();
    }
}

/// In-memory duplex byte stream; one half of a connected pair.
pub struct PairTransport {
    rx: Arc<Pipe>,
    tx: Arc<Pipe>,
    read_timeout: Option<Duration>,
}

/// Create two connected in-memory transports.
pub fn pair_transport() -> (PairTransport, PairTransport) {
    let a = Pipe::new();
    let b = Pipe::new();
    (
        PairTransport {
            rx: a.clone(),
            tx: b.clone(),
            read_timeout: None,
        },
        PairTransport {
            rx: b,
            tx: a,
            read_timeout: None,
        },
    )
}

impl Read for PairTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut inner = self.rx.inner.lock();
        while inner.buf.is_empty() && !inner.closed {
            match self.read_timeout {
                Some(timeout) => {
                    if self
                        .rx
                        .readable
                        .wait_for(&mut inner, timeout)
                        .timed_out()
                    {
                        return Err(io::Error::from(io::ErrorKind::TimedOut));
                    }
                }
                None => self.rx.readable.wait(&mut inner),
            }
        }
        if inner.buf.is_empty() {
            return Ok(0); // peer gone
        }
        let n = buf.len().min(inner.buf.len());
        for byte in buf.iter_mut().take(n) {
            *byte = inner.buf.pop_front().expect("checked non-empty");
        }
        Ok(n)
    }
}

impl Write for PairTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut inner = self.tx.inner.lock();
        if inner.closed {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }
        inner.buf.extend(buf);
        self.tx.readable.notify_all();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Transport for PairTransport {
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.read_timeout = timeout;
        Ok(())
    }
}

impl Drop for PairTransport {
    fn drop(&mut self) {
        self.rx.close();
        self.tx.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::thread;
    use std::time::Duration;

    #[rstest]
    fn test_pair_transport_round_trip() {
        let (mut a, mut b) = pair_transport();
        a.write_all(b"ping").unwrap();

        let mut buf = [0u8; 4];
        b.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[rstest]
    fn test_pair_transport_blocking_read() {
        let (mut a, mut b) = pair_transport();
        let handle = thread::spawn(move || {
            let mut buf = [0u8; 5];
            b.read_exact(&mut buf).unwrap();
            buf
        });
        thread::sleep(Duration::from_millis(20));
        a.write_all(b"hello").unwrap();
        assert_eq!(&handle.join().unwrap(), b"hello");
    }

    #[rstest]
    fn test_pair_transport_eof_on_drop() {
        let (a, mut b) = pair_transport();
        drop(a);
        let mut buf = [0u8; 1];
        assert_eq!(b.read(&mut buf).unwrap(), 0);
    }

    #[rstest]
    fn test_pair_transport_read_timeout() {
        let (_a, mut b) = pair_transport();
        b.set_read_timeout(Some(Duration::from_millis(10))).unwrap();
        let mut buf = [0u8; 1];
        let err = b.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
