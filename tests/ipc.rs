//! IPC descriptor passing: `on_fd` delivers the SCM_RIGHTS descriptor
//! before `on_data` delivers the payload of the same message.

use sockloop::{CloseReason, EventLoop, Hooks, LoopConfig, SocketEvents, SocketId};
use std::cell::RefCell;
use std::mem;
use std::os::unix::io::RawFd;
use std::rc::Rc;

fn socketpair() -> (RawFd, RawFd) {
    let mut fds = [0; 2];
    let rc = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
    assert_eq!(rc, 0);
    (fds[0], fds[1])
}

/// Send `payload` plus one descriptor over a Unix stream socket.
fn send_with_fd(sock: RawFd, payload: &[u8], fd: RawFd) {
    unsafe {
        let mut iov = libc::iovec {
            iov_base: payload.as_ptr() as *mut libc::c_void,
            iov_len: payload.len(),
        };
        let mut cmsg_buf = [0u8; 64];
        let mut msg: libc::msghdr = mem::zeroed();
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = libc::CMSG_SPACE(mem::size_of::<libc::c_int>() as u32) as _;

        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(mem::size_of::<libc::c_int>() as u32) as _;
        *(libc::CMSG_DATA(cmsg) as *mut libc::c_int) = fd;

        let n = libc::sendmsg(sock, &msg, 0);
        assert_eq!(n, payload.len() as isize);
    }
}

#[derive(Default)]
struct IpcLog {
    order: RefCell<Vec<String>>,
    received_fd: RefCell<Option<RawFd>>,
}

struct IpcEvents {
    shared: Rc<IpcLog>,
}

impl SocketEvents for IpcEvents {
    fn on_fd(&self, _lp: &mut EventLoop, _s: SocketId, fd: RawFd) {
        self.shared.order.borrow_mut().push("fd".into());
        *self.shared.received_fd.borrow_mut() = Some(fd);
    }

    fn on_data(&self, lp: &mut EventLoop, s: SocketId, data: &mut [u8]) {
        assert_eq!(&data[..], b"data");
        self.shared.order.borrow_mut().push("data".into());
        lp.socket_close(s, CloseReason::CleanShutdown);
    }
}

#[test]
fn scm_rights_fd_arrives_before_payload() {
    let mut lp = EventLoop::new(LoopConfig::default(), Hooks::default()).unwrap();
    let shared = Rc::new(IpcLog::default());
    let ctx = lp.context_create(Rc::new(IpcEvents {
        shared: shared.clone(),
    }));

    let (ours, theirs) = socketpair();
    lp.socket_from_fd(ctx, ours, true).unwrap();

    // A pipe's read end rides along with a 4-byte payload.
    let mut pipe_fds = [0; 2];
    assert_eq!(unsafe { libc::pipe(pipe_fds.as_mut_ptr()) }, 0);
    send_with_fd(theirs, b"data", pipe_fds[0]);

    lp.run();

    assert_eq!(&*shared.order.borrow(), &["fd".to_string(), "data".to_string()]);

    // The passed descriptor is a working copy of the pipe's read end.
    let received = shared.received_fd.borrow().expect("fd delivered");
    assert!(received >= 0);
    unsafe {
        libc::write(pipe_fds[1], b"p".as_ptr() as *const libc::c_void, 1);
        let mut byte = [0u8; 1];
        let n = libc::read(received, byte.as_mut_ptr() as *mut libc::c_void, 1);
        assert_eq!(n, 1);
        assert_eq!(byte[0], b'p');

        libc::close(received);
        libc::close(pipe_fds[0]);
        libc::close(pipe_fds[1]);
        libc::close(theirs);
    }
}
