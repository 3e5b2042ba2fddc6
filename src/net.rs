//! Raw socket plumbing: creation, accept, non-blocking I/O, ancillary data.
//!
//! Everything here is a thin wrapper over `socket2`/`libc`; no loop state.

use crate::types::SocketOptions;
use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};

#[cfg(any(target_os = "linux", target_os = "android"))]
const MSG_FLAGS: libc::c_int = libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const MSG_FLAGS: libc::c_int = libc::MSG_DONTWAIT;

fn new_socket(
    addr: &SocketAddr,
    ty: socket2::Type,
    proto: Option<socket2::Protocol>,
) -> io::Result<socket2::Socket> {
    let domain = match addr {
        SocketAddr::V4(_) => socket2::Domain::IPV4,
        SocketAddr::V6(_) => socket2::Domain::IPV6,
    };
    let socket = socket2::Socket::new(domain, ty, proto)?;
    socket.set_nonblocking(true)?;
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    unsafe {
        // No MSG_NOSIGNAL on these platforms; suppress SIGPIPE per socket.
        let on: libc::c_int = 1;
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_NOSIGPIPE,
            &on as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
    Ok(socket)
}

/// Create a bound, listening TCP socket and return its fd.
pub(crate) fn create_listen_fd(
    addr: SocketAddr,
    options: SocketOptions,
    backlog: i32,
) -> io::Result<RawFd> {
    let socket = new_socket(&addr, socket2::Type::STREAM, Some(socket2::Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    if options.contains(SocketOptions::REUSE_PORT) {
        // socket2 gates SO_REUSEPORT behind a feature; set it directly.
        let on: libc::c_int = 1;
        unsafe {
            libc::setsockopt(
                socket.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_REUSEPORT,
                &on as *const _ as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }
    }
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    Ok(socket.into_raw_fd())
}

/// Create a non-blocking TCP socket and start connecting it.
///
/// Returns the fd with the connect in flight; completion is reported by the
/// poller as writability.
pub(crate) fn create_connect_fd(addr: SocketAddr, source: Option<SocketAddr>) -> io::Result<RawFd> {
    let socket = new_socket(&addr, socket2::Type::STREAM, Some(socket2::Protocol::TCP))?;
    if let Some(src) = source {
        socket.bind(&src.into())?;
    }
    match socket.connect(&addr.into()) {
        Ok(()) => {}
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => return Err(e),
    }
    Ok(socket.into_raw_fd())
}

/// Create a bound, non-blocking UDP socket.
pub(crate) fn create_udp_fd(addr: SocketAddr) -> io::Result<RawFd> {
    let socket = new_socket(&addr, socket2::Type::DGRAM, Some(socket2::Protocol::UDP))?;
    socket.bind(&addr.into())?;
    Ok(socket.into_raw_fd())
}

/// Accept one connection; the returned fd is already non-blocking.
pub(crate) fn accept_fd(listen_fd: RawFd) -> io::Result<(RawFd, SocketAddr)> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

    #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
    let fd = unsafe {
        libc::accept4(
            listen_fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        )
    };
    #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
    let fd = unsafe {
        let fd = libc::accept(
            listen_fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
        );
        if fd >= 0 {
            set_nonblocking(fd)?;
        }
        fd
    };

    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    let addr = sockaddr_to_std(&storage, len)?;
    Ok((fd, addr))
}

pub(crate) fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

pub(crate) fn set_nodelay(fd: RawFd, on: bool) {
    let optval: libc::c_int = on as libc::c_int;
    unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            &optval as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}

pub(crate) fn shutdown_write(fd: RawFd) {
    unsafe {
        libc::shutdown(fd, libc::SHUT_WR);
    }
}

pub(crate) fn close_fd(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

/// Non-blocking send. `Ok(n)` may be a short write.
pub(crate) fn send(fd: RawFd, data: &[u8]) -> io::Result<usize> {
    let n = unsafe { libc::send(fd, data.as_ptr() as *const libc::c_void, data.len(), MSG_FLAGS) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

/// Non-blocking receive. `Ok(0)` is end-of-stream.
pub(crate) fn recv(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), MSG_FLAGS) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

/// Non-blocking receive that also collects one `SCM_RIGHTS` descriptor if
/// the message carried one.
pub(crate) fn recv_with_fd(fd: RawFd, buf: &mut [u8]) -> io::Result<(usize, Option<RawFd>)> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };
    // Sized for one descriptor plus header; matches CMSG_SPACE(sizeof(int)).
    let mut cmsg_buf = [0u8; 64];
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsg_buf.len() as _;

    let n = unsafe { libc::recvmsg(fd, &mut msg, MSG_FLAGS) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    let mut passed_fd = None;
    if n > 0 && msg.msg_controllen > 0 {
        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            if !cmsg.is_null()
                && (*cmsg).cmsg_level == libc::SOL_SOCKET
                && (*cmsg).cmsg_type == libc::SCM_RIGHTS
            {
                passed_fd = Some(*(libc::CMSG_DATA(cmsg) as *const libc::c_int));
            }
        }
    }
    Ok((n as usize, passed_fd))
}

/// One received datagram: offset and length into the receive scratch buffer
/// plus the peer address.
pub(crate) struct Datagram {
    pub offset: usize,
    pub len: usize,
    pub peer: SocketAddr,
}

/// Receive up to `max` datagrams into `buf`, partitioned into equal slots.
///
/// Uses `recvmmsg` where available; elsewhere falls back to repeated
/// `recvfrom`. Would-block with nothing received is returned as an error so
/// the caller can distinguish "drained" from "no data at all".
pub(crate) fn udp_recv_batch(
    fd: RawFd,
    buf: &mut [u8],
    max: usize,
) -> io::Result<Vec<Datagram>> {
    let slot = buf.len() / max;

    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        let mut storages: Vec<libc::sockaddr_storage> = vec![unsafe { mem::zeroed() }; max];
        let mut iovecs: Vec<libc::iovec> = Vec::with_capacity(max);
        for i in 0..max {
            iovecs.push(libc::iovec {
                iov_base: unsafe { buf.as_mut_ptr().add(i * slot) } as *mut libc::c_void,
                iov_len: slot,
            });
        }
        let mut hdrs: Vec<libc::mmsghdr> = Vec::with_capacity(max);
        for i in 0..max {
            let mut hdr: libc::mmsghdr = unsafe { mem::zeroed() };
            hdr.msg_hdr.msg_iov = &mut iovecs[i];
            hdr.msg_hdr.msg_iovlen = 1;
            hdr.msg_hdr.msg_name = &mut storages[i] as *mut _ as *mut libc::c_void;
            hdr.msg_hdr.msg_namelen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            hdrs.push(hdr);
        }

        let n = unsafe {
            libc::recvmmsg(
                fd,
                hdrs.as_mut_ptr(),
                max as libc::c_uint,
                libc::MSG_DONTWAIT,
                std::ptr::null_mut(),
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }

        let mut out = Vec::with_capacity(n as usize);
        for i in 0..n as usize {
            let peer = sockaddr_to_std(&storages[i], hdrs[i].msg_hdr.msg_namelen)?;
            out.push(Datagram {
                offset: i * slot,
                len: hdrs[i].msg_len as usize,
                peer,
            });
        }
        Ok(out)
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    {
        let mut out = Vec::new();
        for i in 0..max {
            let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
            let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            let n = unsafe {
                libc::recvfrom(
                    fd,
                    buf.as_mut_ptr().add(i * slot) as *mut libc::c_void,
                    slot,
                    libc::MSG_DONTWAIT,
                    &mut storage as *mut _ as *mut libc::sockaddr,
                    &mut len,
                )
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::WouldBlock && !out.is_empty() {
                    break;
                }
                return Err(err);
            }
            out.push(Datagram {
                offset: i * slot,
                len: n as usize,
                peer: sockaddr_to_std(&storage, len)?,
            });
        }
        Ok(out)
    }
}

/// Send a single datagram to `peer`.
pub(crate) fn send_to(fd: RawFd, data: &[u8], peer: SocketAddr) -> io::Result<usize> {
    let (storage, len) = std_to_sockaddr(&peer);
    let n = unsafe {
        libc::sendto(
            fd,
            data.as_ptr() as *const libc::c_void,
            data.len(),
            MSG_FLAGS,
            &storage as *const _ as *const libc::sockaddr,
            len,
        )
    };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

/// Pending error on the socket (`SO_ERROR`), if any.
pub(crate) fn socket_error(fd: RawFd) -> Option<io::Error> {
    let mut err: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc < 0 {
        return Some(io::Error::last_os_error());
    }
    if err == 0 {
        None
    } else {
        Some(io::Error::from_raw_os_error(err))
    }
}

/// The address this fd is bound to.
pub(crate) fn local_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let rc = unsafe { libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    sockaddr_to_std(&storage, len)
}

/// Convert a libc sockaddr_storage to a Rust SocketAddr.
pub(crate) fn sockaddr_to_std(
    storage: &libc::sockaddr_storage,
    len: libc::socklen_t,
) -> io::Result<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            if len < mem::size_of::<libc::sockaddr_in>() as libc::socklen_t {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "address too short",
                ));
            }
            let addr = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
            let port = u16::from_be(addr.sin_port);
            Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
        }
        libc::AF_INET6 => {
            if len < mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "address too short",
                ));
            }
            let addr = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(addr.sin6_addr.s6_addr);
            let port = u16::from_be(addr.sin6_port);
            Ok(SocketAddr::V6(SocketAddrV6::new(
                ip,
                port,
                u32::from_be(addr.sin6_flowinfo),
                addr.sin6_scope_id,
            )))
        }
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "unsupported address family",
        )),
    }
}

/// Convert a Rust SocketAddr to libc sockaddr_storage.
pub(crate) fn std_to_sockaddr(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };

    match addr {
        SocketAddr::V4(v4) => {
            let sockaddr = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in) };
            sockaddr.sin_family = libc::AF_INET as libc::sa_family_t;
            sockaddr.sin_port = v4.port().to_be();
            sockaddr.sin_addr.s_addr = u32::from(*v4.ip()).to_be();
            (
                storage,
                mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        }
        SocketAddr::V6(v6) => {
            let sockaddr = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in6) };
            sockaddr.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sockaddr.sin6_port = v6.port().to_be();
            sockaddr.sin6_flowinfo = v6.flowinfo().to_be();
            sockaddr.sin6_addr.s6_addr = v6.ip().octets();
            sockaddr.sin6_scope_id = v6.scope_id();
            (
                storage,
                mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
            )
        }
    }
}

pub(crate) fn would_block(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK)
    ) || err.kind() == io::ErrorKind::WouldBlock
}
