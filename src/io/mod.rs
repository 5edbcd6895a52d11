//! Readiness-based socket I/O.
//!
//! Every operation here is a [`wait_ready`](EventLoop::wait_ready) around a
//! non-blocking step: the step is retried each time the descriptor becomes
//! ready until it completes or fails with something other than
//! `WouldBlock`.
//!
//! The socket passed to `sock_recv`/`sock_sendall` is only borrowed for its
//! descriptor; it must stay open until the returned future resolves.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};

use nix::sys::socket::{self, MsgFlags};

use crate::error::Error;
use crate::event_loop::EventLoop;
use crate::native::IoCondition;

pub mod future;

pub use future::IoFuture;

#[cfg(target_os = "linux")]
const SEND_FLAGS: MsgFlags = MsgFlags::MSG_NOSIGNAL;
#[cfg(not(target_os = "linux"))]
const SEND_FLAGS: MsgFlags = MsgFlags::empty();

/// Switch `fd` to non-blocking mode.
pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    use nix::fcntl::{fcntl, FcntlArg, OFlag};

    let flags = fcntl(fd, FcntlArg::F_GETFL)?;
    let mut flags = OFlag::from_bits_truncate(flags);
    flags.insert(OFlag::O_NONBLOCK);
    fcntl(fd, FcntlArg::F_SETFL(flags))?;
    Ok(())
}

fn recv(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    Ok(socket::recv(fd, buf, MsgFlags::empty())?)
}

fn send(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    Ok(socket::send(fd, buf, SEND_FLAGS)?)
}

impl EventLoop {
    /// Receive up to `nbytes` from `sock`. An empty vector means the peer
    /// closed the connection.
    pub fn sock_recv<S: AsRawFd>(&self, sock: &S, nbytes: usize) -> IoFuture<Vec<u8>> {
        let fd = sock.as_raw_fd();
        self.wait_ready(fd, IoCondition::IN, move || {
            let mut buf = vec![0u8; nbytes];
            let n = recv(fd, &mut buf)?;
            buf.truncate(n);
            Ok(Some(buf))
        })
    }

    /// Send all of `data` on `sock`.
    ///
    /// The first attempt is made right away; if it drains the buffer the
    /// returned future is already resolved and no readiness wait is armed.
    pub fn sock_sendall<S: AsRawFd>(&self, sock: &S, data: &[u8]) -> IoFuture<()> {
        if let Err(err) = self.check_closed() {
            return IoFuture::ready(self, Err(err));
        }
        let fd = sock.as_raw_fd();
        let sent = match send(fd, data) {
            Ok(n) => n,
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                0
            }
            Err(err) => return IoFuture::ready(self, Err(Error::Io(err))),
        };
        if sent == data.len() {
            self.bump_stats(|stats| stats.fast_path_sends += 1);
            return IoFuture::ready(self, Ok(()));
        }

        let mut remaining = data[sent..].to_vec();
        self.wait_ready(fd, IoCondition::OUT, move || {
            let n = send(fd, &remaining)?;
            remaining.drain(..n);
            Ok(if remaining.is_empty() { Some(()) } else { None })
        })
    }

    /// Accept a connection on `listener`.
    ///
    /// The wait holds its own duplicate of the listening socket, which is
    /// closed when the wait completes or is cancelled. The listener is put
    /// in non-blocking mode; accepted streams are non-blocking as well.
    pub fn sock_accept(&self, listener: &TcpListener) -> IoFuture<(TcpStream, SocketAddr)> {
        let listener = match listener.try_clone() {
            Ok(listener) => listener,
            Err(err) => return IoFuture::ready(self, Err(Error::Io(err))),
        };
        if let Err(err) = set_nonblocking(listener.as_raw_fd()) {
            return IoFuture::ready(self, Err(Error::Io(err)));
        }
        let fd = listener.as_raw_fd();
        self.wait_ready(fd, IoCondition::IN, move || {
            let (stream, addr) = listener.accept()?;
            set_nonblocking(stream.as_raw_fd())?;
            Ok(Some((stream, addr)))
        })
    }

    /// Open a non-blocking TCP connection to `addr`.
    pub fn sock_connect(&self, addr: SocketAddr) -> IoFuture<TcpStream> {
        let stream = match mio::net::TcpStream::connect(addr) {
            Ok(stream) => stream,
            Err(err) => return IoFuture::ready(self, Err(Error::Io(err))),
        };
        let fd = stream.as_raw_fd();
        let mut stream = Some(stream);
        self.wait_ready(fd, IoCondition::OUT, move || {
            let pending = match stream.as_ref() {
                Some(pending) => pending,
                None => return Ok(None),
            };
            if let Some(err) = pending.take_error()? {
                return Err(err);
            }
            match pending.peer_addr() {
                Ok(_) => {}
                // Writable without being connected: wait again.
                Err(err) if err.kind() == io::ErrorKind::NotConnected => return Ok(None),
                Err(err) => return Err(err),
            }
            match stream.take() {
                // SAFETY: the descriptor comes straight out of a connected socket.
                Some(connected) => Ok(Some(unsafe { TcpStream::from_raw_fd(connected.into_raw_fd()) })),
                None => Ok(None),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;

    fn local_listener() -> TcpListener {
        TcpListener::bind("127.0.0.1:0").unwrap()
    }

    #[test]
    fn test_sendall_fast_path() {
        let event_loop = EventLoop::new().unwrap();
        let (left, mut right) = UnixStream::pair().unwrap();
        left.set_nonblocking(true).unwrap();

        let send = event_loop.sock_sendall(&left, b"hello");
        assert!(send.is_done());
        event_loop.run_until_complete(send).unwrap().unwrap();

        let stats = event_loop.stats();
        assert_eq!(stats.fast_path_sends, 1);
        assert_eq!(stats.readiness_waits, 0);
        let mut buf = [0u8; 5];
        right.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn test_sendall_large_buffer_waits_for_writability() {
        let event_loop = EventLoop::new().unwrap();
        let (left, right) = UnixStream::pair().unwrap();
        left.set_nonblocking(true).unwrap();
        right.set_nonblocking(true).unwrap();
        let payload: Vec<u8> = (0..4 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
        let expected = payload.len();

        let reader = event_loop.clone();
        let receive = event_loop.spawn(async move {
            let mut received = Vec::with_capacity(expected);
            while received.len() < expected {
                let chunk = reader.sock_recv(&right, 65536).await.unwrap();
                assert!(!chunk.is_empty(), "peer closed early");
                received.extend_from_slice(&chunk);
            }
            received
        });
        let writer = event_loop.clone();
        let received = event_loop
            .run_until_complete(async move {
                writer.sock_sendall(&left, &payload).await.unwrap();
                let received = receive.await.unwrap();
                (received, payload)
            })
            .unwrap();

        assert_eq!(received.0, received.1);
        assert!(event_loop.stats().readiness_waits >= 2);
        assert_eq!(event_loop.stats().fast_path_sends, 0);
    }

    #[test]
    fn test_accept_and_connect() {
        let event_loop = EventLoop::new().unwrap();
        let listener = local_listener();
        let addr = listener.local_addr().unwrap();

        let accept = event_loop.sock_accept(&listener);
        let connect = event_loop.sock_connect(addr);
        let (accepted, connected) = event_loop
            .run_until_complete(async move { futures::join!(accept, connect) })
            .unwrap();
        let (mut server, peer) = accepted.unwrap();
        let mut client = connected.unwrap();
        assert_eq!(peer, client.local_addr().unwrap());

        client.set_nonblocking(false).unwrap();
        client.write_all(b"ping").unwrap();
        let received = event_loop
            .run_until_complete({
                let event_loop = event_loop.clone();
                let server = server.try_clone().unwrap();
                async move { event_loop.sock_recv(&server, 16).await }
            })
            .unwrap()
            .unwrap();
        assert_eq!(received, b"ping");

        drop(client);
        server.set_nonblocking(false).unwrap();
        let mut rest = Vec::new();
        server.read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty());
    }

    #[test]
    fn test_connect_refused_has_os_code() {
        let event_loop = EventLoop::new().unwrap();
        let addr = {
            let listener = local_listener();
            listener.local_addr().unwrap()
        };
        let err = event_loop
            .run_until_complete(event_loop.sock_connect(addr))
            .unwrap()
            .unwrap_err();
        assert_eq!(err.os_code(), Some(libc::ECONNREFUSED));
    }

    #[test]
    fn test_cancelled_accept_releases_its_socket() {
        let event_loop = EventLoop::new().unwrap();
        let listener = local_listener();
        let accept = event_loop.sock_accept(&listener);
        assert_eq!(event_loop.live_handles(), 1);
        drop(accept);
        assert_eq!(event_loop.live_handles(), 0);
        assert_eq!(event_loop.context().source_count(), 0);
        // The caller's listener is untouched.
        assert!(listener.local_addr().is_ok());
    }

    #[test]
    fn test_recv_eof() {
        let event_loop = EventLoop::new().unwrap();
        let (left, right) = UnixStream::pair().unwrap();
        drop(right);
        let chunk = event_loop
            .run_until_complete(event_loop.sock_recv(&left, 8))
            .unwrap()
            .unwrap();
        assert!(chunk.is_empty());
    }

    #[test]
    fn test_set_nonblocking() {
        let file = tempfile::tempfile().unwrap();
        set_nonblocking(file.as_raw_fd()).unwrap();
        let flags = nix::fcntl::fcntl(file.as_raw_fd(), nix::fcntl::FcntlArg::F_GETFL).unwrap();
        assert!(nix::fcntl::OFlag::from_bits_truncate(flags).contains(nix::fcntl::OFlag::O_NONBLOCK));
    }
}
