//! Cross-thread command queue marshalling control operations onto the
//! Tokio task that owns a given peer session.
//!
//! There is no dedicated I/O thread here the way a raw event loop would
//! have one: each peer session already runs as its own Tokio task, reading
//! its socket and driving its own pulse. What the bridge still needs to
//! solve is the same problem a single-threaded event loop solves with a
//! command FIFO: the torrent manager task decides "unchoke this peer" or
//! "announce this HAVE to everyone", and that decision has to reach the
//! task that actually owns the peer's `Framed` socket. An `UnboundedSender`
//! per registered peer, keyed by address, is that FIFO, generalized so any
//! task can reach any peer without holding its session directly.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;

use crate::peer::AddRequestOutcome;
use crate::{Bitfield, PieceIndex};

/// A control instruction sent from a torrent manager task to a single
/// peer session's task.
#[derive(Debug)]
pub(crate) enum SessionCommand {
    SetChoke(bool),
    Have(PieceIndex),
    Bitfield(Bitfield),
    PieceVerified(PieceIndex, bool),
    /// Ask this peer's session to request a block. `reply` carries back
    /// whether the session actually queued it, so a caller driving a
    /// candidate pool (the refill scheduler) can move on to the next peer
    /// instead of assuming success.
    Request(PieceIndex, u32, u32, oneshot::Sender<AddRequestOutcome>),
    /// The current set of connected, PEX-eligible peers (this peer
    /// excluded), for the session to diff against what it last announced.
    PexTick(Vec<(SocketAddr, u8)>),
    RecomputeInterest {
        client_have: Bitfield,
        dnd: Bitfield,
        banned: Option<Bitfield>,
    },
    Disconnect,
}

/// Routes [`SessionCommand`]s to whichever task owns a given peer's
/// session, by address.
#[derive(Default)]
pub(crate) struct Bridge {
    routes: Mutex<HashMap<SocketAddr, UnboundedSender<SessionCommand>>>,
}

impl Bridge {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Registers a newly connected peer, returning the receiving half its
    /// task should poll alongside its socket.
    pub(crate) fn register(&self, addr: SocketAddr) -> UnboundedReceiver<SessionCommand> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes.lock().unwrap().insert(addr, tx);
        rx
    }

    pub(crate) fn unregister(&self, addr: &SocketAddr) {
        self.routes.lock().unwrap().remove(addr);
    }

    /// Sends to one peer; silently dropped if that peer's task has already
    /// torn down (its entry here only disappears via `unregister`, so this
    /// also silently drops into a brief window after a task exits but
    /// before its manager notices).
    pub(crate) fn send(&self, addr: &SocketAddr, cmd: SessionCommand) {
        let routes = self.routes.lock().unwrap();
        if let Some(tx) = routes.get(addr) {
            let _ = tx.send(cmd);
        }
    }

    /// Sends a freshly built command to every registered peer; `make_cmd`
    /// is called once per recipient rather than cloning a single value,
    /// since [`SessionCommand::Request`]'s reply channel isn't cloneable.
    pub(crate) fn broadcast(&self, mut make_cmd: impl FnMut() -> SessionCommand) {
        let routes = self.routes.lock().unwrap();
        for tx in routes.values() {
            let _ = tx.send(make_cmd());
        }
    }

    pub(crate) fn registered_addrs(&self) -> Vec<SocketAddr> {
        self.routes.lock().unwrap().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:6881".parse().unwrap()
    }

    #[test]
    fn send_after_unregister_is_a_silent_noop() {
        let bridge = Bridge::new();
        let _rx = bridge.register(addr());
        bridge.unregister(&addr());
        bridge.send(&addr(), SessionCommand::SetChoke(true));
    }

    #[tokio::test]
    async fn registered_peer_receives_commands() {
        let bridge = Bridge::new();
        let mut rx = bridge.register(addr());
        bridge.send(&addr(), SessionCommand::SetChoke(false));
        let cmd = rx.recv().await.unwrap();
        assert!(matches!(cmd, SessionCommand::SetChoke(false)));
    }
}
