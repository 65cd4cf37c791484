use std::io::{self, IoSlice, IoSliceMut, Error, ErrorKind};
use std::mem;
use std::time::{Duration, Instant};
use std::cmp;
use std::net::{Shutdown, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};

use libc::{self, c_int, c_void, sockaddr, socklen_t, MSG_PEEK, SOCK_CLOEXEC};

use super::fd::FileDesc;

pub fn setsockopt<T>(sock: &Socket, opt: c_int, val: c_int, payload: T) -> io::Result<()> {
    let payload = &payload as *const T as *const c_void;
    syscall!(setsockopt(
        sock.as_raw_fd(),
        opt,
        val,
        payload,
        mem::size_of::<T>() as libc::socklen_t
    ))?;
    Ok(())
}

pub fn getsockopt<T: Copy>(sock: &Socket, opt: c_int, val: c_int) -> io::Result<T> {
    let mut slot: T = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<T>() as libc::socklen_t;
    syscall!(getsockopt(
        sock.as_raw_fd(),
        opt,
        val,
        &mut slot as *mut _ as *mut _,
        &mut len
    ))?;
    assert_eq!(len as usize, mem::size_of::<T>());
    Ok(slot)
}

fn addr_into_raw(addr: &SocketAddr) -> (*const libc::sockaddr, libc::socklen_t) {
    match *addr {
        SocketAddr::V4(ref a) => (a as *const _ as *const _, mem::size_of_val(a) as libc::socklen_t),
        SocketAddr::V6(ref a) => (a as *const _ as *const _, mem::size_of_val(a) as libc::socklen_t),
    }
}

pub fn sockaddr_to_addr(storage: &libc::sockaddr_storage, len: usize) -> io::Result<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            assert!(len >= mem::size_of::<libc::sockaddr_in>());
            let sa: libc::sockaddr_in = unsafe { *(storage as *const _ as *const libc::sockaddr_in) };
            let ip = sa.sin_addr.s_addr.to_ne_bytes();
            let port = u16::from_be(sa.sin_port);
            Ok(SocketAddr::V4(SocketAddrV4::new(
                std::net::Ipv4Addr::new(ip[0], ip[1], ip[2], ip[3]),
                port,
            )))
        }
        libc::AF_INET6 => {
            assert!(len >= mem::size_of::<libc::sockaddr_in6>());
            let sa: libc::sockaddr_in6 = unsafe { *(storage as *const _ as *const libc::sockaddr_in6) };
            let port = u16::from_be(sa.sin6_port);
            Ok(SocketAddr::V6(SocketAddrV6::new(
                std::net::Ipv6Addr::from(sa.sin6_addr.s6_addr),
                port,
                sa.sin6_flowinfo,
                sa.sin6_scope_id,
            )))
        }
        _ => Err(Error::new(ErrorKind::InvalidInput, "invalid address family")),
    }
}

pub fn sockname<F>(f: F) -> io::Result<SocketAddr>
where
    F: FnOnce(*mut libc::sockaddr, *mut libc::socklen_t) -> c_int,
{
    unsafe {
        let mut storage: libc::sockaddr_storage = mem::zeroed();
        let mut len = mem::size_of_val(&storage) as libc::socklen_t;
        super::cvt(f(&mut storage as *mut _ as *mut _, &mut len))?;
        sockaddr_to_addr(&storage, len as usize)
    }
}

/// A non-blocking, close-on-exec socket, built directly on [`FileDesc`].
///
/// Every descriptor this crate hands upward — listening, accepted, or
/// connecting — is produced through this type, so "always non-blocking,
/// always CLOEXEC" is enforced in one place rather than at each call site
/// that opens a socket.
pub struct Socket(FileDesc);

impl Socket {
    pub fn new(addr: &SocketAddr, ty: c_int) -> io::Result<Socket> {
        let fam = match *addr {
            SocketAddr::V4(..) => libc::AF_INET,
            SocketAddr::V6(..) => libc::AF_INET6,
        };
        Socket::new_raw(fam, ty)
    }

    pub fn new_raw(fam: c_int, ty: c_int) -> io::Result<Socket> {
        match syscall!(socket(fam, ty | SOCK_CLOEXEC, 0)) {
            Ok(fd) => return Ok(Socket(unsafe { FileDesc::new(fd) })),
            Err(ref e) if e.raw_os_error() == Some(libc::EINVAL) => {}
            Err(e) => return Err(e),
        }

        let fd = syscall!(socket(fam, ty, 0))?;
        let fd = unsafe { FileDesc::new(fd) };
        fd.set_cloexec()?;
        Ok(Socket(fd))
    }

    pub fn new_pair(fam: c_int, ty: c_int) -> io::Result<(Socket, Socket)> {
        let mut fds = [0, 0];

        match syscall!(socketpair(fam, ty | SOCK_CLOEXEC, 0, fds.as_mut_ptr())) {
            Ok(_) => {
                return Ok((
                    Socket(unsafe { FileDesc::new(fds[0]) }),
                    Socket(unsafe { FileDesc::new(fds[1]) }),
                ));
            }
            Err(ref e) if e.raw_os_error() == Some(libc::EINVAL) => {}
            Err(e) => return Err(e),
        }

        syscall!(socketpair(fam, ty, 0, fds.as_mut_ptr()))?;
        let a = unsafe { FileDesc::new(fds[0]) };
        let b = unsafe { FileDesc::new(fds[1]) };
        a.set_cloexec()?;
        b.set_cloexec()?;
        Ok((Socket(a), Socket(b)))
    }

    pub fn connect(&self, addr: &SocketAddr) -> io::Result<()> {
        let (addrp, len) = addr_into_raw(addr);
        syscall!(connect(self.0.as_raw_fd(), addrp, len))?;
        Ok(())
    }

    /// Blocking connect with a timeout. The reactor's own [`crate::net::connector`]
    /// never calls this — it issues a non-blocking connect and waits for the
    /// fd to become writable through the Poller instead. This exists for
    /// tests and one-shot tooling that want a synchronous connect.
    pub fn connect_timeout(&self, addr: &SocketAddr, timeout: Duration) -> io::Result<()> {
        self.set_nonblocking(true)?;
        match self.connect(addr) {
            Ok(_) => return Ok(()),
            Err(ref e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(e) => return Err(e),
        }

        let mut pollfd = libc::pollfd {
            fd: self.0.as_raw_fd(),
            events: libc::POLLOUT,
            revents: 0,
        };

        if timeout.is_zero() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "cannot set a 0 duration timeout"));
        }

        let start = Instant::now();
        loop {
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "connection timed out"));
            }

            let remaining = timeout - elapsed;
            let mut ms = remaining
                .as_secs()
                .saturating_mul(1_000)
                .saturating_add(remaining.subsec_nanos() as u64 / 1_000_000);
            if ms == 0 {
                ms = 1;
            }
            let ms = cmp::min(ms, c_int::max_value() as u64) as c_int;

            match unsafe { libc::poll(&mut pollfd, 1, ms) } {
                -1 => {
                    let err = io::Error::last_os_error();
                    if err.kind() != io::ErrorKind::Interrupted {
                        return Err(err);
                    }
                }
                0 => {}
                _ => {
                    // Linux reports POLLOUT|POLLERR|POLLHUP for refused connections, so
                    // POLLHUP rather than write-readiness is what signals failure here.
                    if pollfd.revents & libc::POLLHUP != 0 {
                        let e = self
                            .take_error()?
                            .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "no error set after POLLHUP"));
                        return Err(e);
                    }
                    return Ok(());
                }
            }
        }
    }

    pub fn accept(&self) -> io::Result<(Socket, SocketAddr)> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of_val(&storage) as socklen_t;

        let res = loop {
            match syscall!(accept4(
                self.0.as_raw_fd(),
                &mut storage as *mut _ as *mut sockaddr,
                &mut len,
                SOCK_CLOEXEC
            )) {
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                other => break other,
            }
        };

        let fd = match res {
            Ok(fd) => fd,
            Err(ref e) if e.raw_os_error() == Some(libc::ENOSYS) => loop {
                match syscall!(accept(
                    self.0.as_raw_fd(),
                    &mut storage as *mut _ as *mut sockaddr,
                    &mut len
                )) {
                    Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                    other => {
                        let fd = other?;
                        let fd_desc = unsafe { FileDesc::new(fd) };
                        fd_desc.set_cloexec()?;
                        break fd_desc.into_raw_fd();
                    }
                }
            },
            Err(e) => return Err(e),
        };

        let addr = sockaddr_to_addr(&storage, len as usize)?;
        let socket = Socket(unsafe { FileDesc::new(fd) });
        socket.set_nonblocking(true)?;
        Ok((socket, addr))
    }

    pub fn duplicate(&self) -> io::Result<Socket> {
        self.0.duplicate().map(Socket)
    }

    fn recv_with_flags(&self, buf: &mut [u8], flags: c_int) -> io::Result<usize> {
        let ret = syscall!(recv(
            self.0.as_raw_fd(),
            buf.as_mut_ptr() as *mut c_void,
            buf.len(),
            flags
        ))?;
        Ok(ret as usize)
    }

    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.recv_with_flags(buf, 0)
    }

    pub fn peek(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.recv_with_flags(buf, MSG_PEEK)
    }

    pub fn read_vectored(&self, bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
        self.0.read_vectored(bufs)
    }

    fn recv_from_with_flags(&self, buf: &mut [u8], flags: c_int) -> io::Result<(usize, SocketAddr)> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut addrlen = mem::size_of_val(&storage) as libc::socklen_t;

        let n = syscall!(recvfrom(
            self.0.as_raw_fd(),
            buf.as_mut_ptr() as *mut c_void,
            buf.len(),
            flags,
            &mut storage as *mut _ as *mut _,
            &mut addrlen
        ))?;
        Ok((n as usize, sockaddr_to_addr(&storage, addrlen as usize)?))
    }

    pub fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.recv_from_with_flags(buf, 0)
    }

    pub fn peek_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.recv_from_with_flags(buf, MSG_PEEK)
    }

    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        syscall!(write(self.0.as_raw_fd(), buf.as_ptr() as *const c_void, buf.len())).map(|n| n as usize)
    }

    pub fn write_vectored(&self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        self.0.write_vectored(bufs)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        let fd = self.0.as_raw_fd();
        sockname(|addr, len| unsafe { libc::getsockname(fd, addr, len) })
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        let fd = self.0.as_raw_fd();
        sockname(|addr, len| unsafe { libc::getpeername(fd, addr, len) })
    }

    pub fn set_timeout(&self, dur: Option<Duration>, kind: libc::c_int) -> io::Result<()> {
        let timeout = match dur {
            Some(dur) => {
                if dur.is_zero() {
                    return Err(io::Error::new(io::ErrorKind::InvalidInput, "cannot set a 0 duration timeout"));
                }
                let secs = if dur.as_secs() > libc::time_t::max_value() as u64 {
                    libc::time_t::max_value()
                } else {
                    dur.as_secs() as libc::time_t
                };
                let mut timeout = libc::timeval {
                    tv_sec: secs,
                    tv_usec: (dur.subsec_nanos() / 1000) as libc::suseconds_t,
                };
                if timeout.tv_sec == 0 && timeout.tv_usec == 0 {
                    timeout.tv_usec = 1;
                }
                timeout
            }
            None => libc::timeval { tv_sec: 0, tv_usec: 0 },
        };
        setsockopt(self, libc::SOL_SOCKET, kind, timeout)
    }

    pub fn timeout(&self, kind: libc::c_int) -> io::Result<Option<Duration>> {
        let raw: libc::timeval = getsockopt(self, libc::SOL_SOCKET, kind)?;
        if raw.tv_sec == 0 && raw.tv_usec == 0 {
            Ok(None)
        } else {
            let sec = raw.tv_sec as u64;
            let nsec = (raw.tv_usec as u32) * 1000;
            Ok(Some(Duration::new(sec, nsec)))
        }
    }

    pub fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        let how = match how {
            Shutdown::Write => libc::SHUT_WR,
            Shutdown::Read => libc::SHUT_RD,
            Shutdown::Both => libc::SHUT_RDWR,
        };
        syscall!(shutdown(self.0.as_raw_fd(), how))?;
        Ok(())
    }

    pub fn set_reuseaddr(&self, reuse: bool) -> io::Result<()> {
        setsockopt(self, libc::SOL_SOCKET, libc::SO_REUSEADDR, reuse as c_int)
    }

    pub fn set_reuseport(&self, reuse: bool) -> io::Result<()> {
        setsockopt(self, libc::SOL_SOCKET, libc::SO_REUSEPORT, reuse as c_int)
    }

    pub fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        setsockopt(self, libc::IPPROTO_TCP, libc::TCP_NODELAY, nodelay as c_int)
    }

    pub fn nodelay(&self) -> io::Result<bool> {
        let raw: c_int = getsockopt(self, libc::IPPROTO_TCP, libc::TCP_NODELAY)?;
        Ok(raw != 0)
    }

    pub fn set_keepalive(&self, keepalive: bool) -> io::Result<()> {
        setsockopt(self, libc::SOL_SOCKET, libc::SO_KEEPALIVE, keepalive as c_int)
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        let mut nonblocking = nonblocking as libc::c_int;
        syscall!(ioctl(self.0.as_raw_fd(), libc::FIONBIO, &mut nonblocking)).map(|_| ())
    }

    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        let raw: c_int = getsockopt(self, libc::SOL_SOCKET, libc::SO_ERROR)?;
        if raw == 0 {
            Ok(None)
        } else {
            Ok(Some(io::Error::from_raw_os_error(raw)))
        }
    }

    pub fn bind(&self, addr: &SocketAddr) -> io::Result<()> {
        let (addrp, len) = addr_into_raw(addr);
        syscall!(bind(self.0.as_raw_fd(), addrp, len))?;
        Ok(())
    }

    pub fn listen(&self, backlog: c_int) -> io::Result<()> {
        syscall!(listen(self.0.as_raw_fd(), backlog))?;
        Ok(())
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

impl FromRawFd for Socket {
    unsafe fn from_raw_fd(fd: RawFd) -> Socket {
        Socket(FileDesc::new(fd))
    }
}

impl IntoRawFd for Socket {
    fn into_raw_fd(self) -> RawFd {
        self.0.into_raw_fd()
    }
}
