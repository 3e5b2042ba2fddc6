//! Low-priority admission under a connection storm: every socket is
//! eventually serviced, but never more than the budget per iteration.

use sockloop::{CloseReason, EventLoop, Hooks, LoopConfig, SocketEvents, SocketId, SocketOptions};
use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::io::Write;
use std::net::TcpStream;
use std::rc::Rc;

const STORM: usize = 25;

#[derive(Default)]
struct Storm {
    /// Sockets that have had their first `on_data`; until then a socket
    /// classifies as low priority (think: still in handshake).
    served: RefCell<HashSet<SocketId>>,
    /// (iteration, socket) per service, for the per-iteration budget check.
    services: RefCell<Vec<(u64, SocketId)>>,
    accepted: RefCell<Vec<SocketId>>,
    listener: Cell<Option<SocketId>>,
}

struct StormEvents {
    shared: Rc<Storm>,
}

impl SocketEvents for StormEvents {
    fn on_open(
        &self,
        _lp: &mut EventLoop,
        s: SocketId,
        _is_client: bool,
        _peer: Option<std::net::SocketAddr>,
    ) {
        self.shared.accepted.borrow_mut().push(s);
    }

    fn on_data(&self, lp: &mut EventLoop, s: SocketId, _data: &mut [u8]) {
        self.shared
            .services
            .borrow_mut()
            .push((lp.iteration_number(), s));
        self.shared.served.borrow_mut().insert(s);

        if self.shared.served.borrow().len() == STORM {
            for s in self.shared.accepted.borrow().iter() {
                lp.socket_close(*s, CloseReason::CleanShutdown);
            }
            if let Some(listener) = self.shared.listener.take() {
                lp.socket_close(listener, CloseReason::CleanShutdown);
            }
        }
    }

    fn is_low_prio(&self, _lp: &EventLoop, s: SocketId) -> bool {
        !self.shared.served.borrow().contains(&s)
    }
}

#[test]
fn storm_is_throttled_to_budget_per_iteration() {
    let mut lp = EventLoop::new(LoopConfig::default(), Hooks::default()).unwrap();
    let shared = Rc::new(Storm::default());
    let ctx = lp.context_create(Rc::new(StormEvents {
        shared: shared.clone(),
    }));

    let listener = lp
        .listen(ctx, "127.0.0.1", 0, SocketOptions::default())
        .unwrap();
    shared.listener.set(Some(listener));
    let addr = lp.socket_local_addr(listener).unwrap();

    // All clients connect and send before the loop starts: the storm
    // arrives at once.
    let mut clients = Vec::new();
    for _ in 0..STORM {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_all(b"x").unwrap();
        clients.push(stream);
    }

    lp.run();

    let services = shared.services.borrow();
    // Everyone was serviced, exactly once.
    assert_eq!(services.len(), STORM);
    let unique: HashSet<SocketId> = services.iter().map(|(_, s)| *s).collect();
    assert_eq!(unique.len(), STORM);

    // No iteration serviced more than the budget.
    let mut per_iteration: Vec<(u64, usize)> = Vec::new();
    for (iteration, _) in services.iter() {
        match per_iteration.last_mut() {
            Some((last, count)) if last == iteration => *count += 1,
            _ => per_iteration.push((*iteration, 1)),
        }
    }
    for (iteration, count) in &per_iteration {
        assert!(
            *count <= 5,
            "iteration {iteration} serviced {count} low-prio sockets"
        );
    }
    // The storm was spread across several iterations, not handled in one.
    assert!(per_iteration.len() >= STORM / 5);
}
