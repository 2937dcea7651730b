//! Single-threaded readiness-driven event loop.
//!
//! Owns up to two listening sockets (IPv4 and/or IPv6, both on port 69)
//! and up to [`MAX_SESSIONS`] per-peer sockets, races their `recv_from`
//! futures with a bounded wait, dispatches datagrams into the session
//! engine, then runs the retransmit and cleanup sweeps.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::select_all;
use tokio::net::UdpSocket;
use tracing::{debug, error, info, warn};

use crate::codec::{self, ErrorCode, Message, TransferMode, MAX_MSG_LEN};
use crate::datastore::{Datastore, DsError, FileStat};
use crate::error::Result;
use crate::net;
use crate::session::{Direction, TftpSession};

pub const MAX_SERVER_SOCKETS: usize = 2;
pub const MAX_SESSIONS: usize = 32;
pub const BLOCKING_TIMEOUT: Duration = Duration::from_millis(1000);
pub const RESEND_INTERVAL: Duration = Duration::from_secs(10);
pub const RESEND_COUNTMAX: u32 = 3;
pub const SESSION_CLOSEWAIT: Duration = Duration::from_secs(15);
const RECV_BUF_SIZE: usize = 1024;

enum SockKind {
    Listener(usize),
    Session(SocketAddr),
}

pub struct Reactor {
    listeners: Vec<UdpSocket>,
    sessions: HashMap<SocketAddr, TftpSession>,
    datastore: Datastore,
    next_session_id: u64,
    shutdown: Arc<AtomicBool>,
    max_sessions: usize,
}

impl Reactor {
    pub fn new(listeners: Vec<UdpSocket>, datastore: Datastore, shutdown: Arc<AtomicBool>) -> Self {
        Self::with_session_limit(listeners, datastore, shutdown, MAX_SESSIONS)
    }

    /// Like [`Reactor::new`], but caps concurrent sessions below the
    /// compiled-in [`MAX_SESSIONS`] ceiling (the config file's
    /// `max_sessions` knob).
    pub fn with_session_limit(
        listeners: Vec<UdpSocket>,
        datastore: Datastore,
        shutdown: Arc<AtomicBool>,
        max_sessions: usize,
    ) -> Self {
        Self {
            listeners,
            sessions: HashMap::new(),
            datastore,
            next_session_id: 1,
            shutdown,
            max_sessions: max_sessions.min(MAX_SESSIONS),
        }
    }

    pub async fn run(&mut self) -> Result<()> {
        while !self.shutdown.load(Ordering::Relaxed) {
            self.wait_and_dispatch_once().await;
            self.retransmit_sweep();
            self.cleanup_sweep();
        }
        info!("shutdown signal observed, closing sessions");
        let ids: Vec<u64> = self.sessions.values().map(|s| s.id).collect();
        for id in ids {
            self.datastore.close_session(id);
        }
        Ok(())
    }

    /// Waits up to [`BLOCKING_TIMEOUT`] for any watched socket to yield
    /// a datagram, and dispatches the first one that arrives. A timeout
    /// with nothing ready is a no-op; the caller still runs the sweeps.
    async fn wait_and_dispatch_once(&mut self) {
        let mut futs: Vec<_> = Vec::with_capacity(self.listeners.len() + self.sessions.len());
        for (i, sock) in self.listeners.iter().enumerate() {
            futs.push(Box::pin(recv_one(sock, SockKind::Listener(i))));
        }
        for (peer, session) in self.sessions.iter() {
            futs.push(Box::pin(recv_one(&session.socket, SockKind::Session(*peer))));
        }
        if futs.is_empty() {
            tokio::time::sleep(BLOCKING_TIMEOUT).await;
            return;
        }

        let outcome = match tokio::time::timeout(BLOCKING_TIMEOUT, select_all(futs)).await {
            Err(_elapsed) => None,
            Ok((output, _idx, rest)) => {
                drop(rest);
                Some(output)
            }
        };
        if let Some((kind, buf, recv_result)) = outcome {
            match recv_result {
                Ok((n, peer)) => self.on_datagram(kind, &buf[..n], peer),
                Err(e) => warn!("recv failed: {e}"),
            }
        }
    }

    fn on_datagram(&mut self, kind: SockKind, buf: &[u8], peer: SocketAddr) {
        match kind {
            SockKind::Listener(idx) => self.dispatch_new_peer(idx, buf, peer),
            SockKind::Session(expected_peer) => {
                if expected_peer != peer {
                    self.reply_unknown_tid(expected_peer, peer);
                    return;
                }
                self.dispatch_existing(peer, buf);
            }
        }
    }

    fn reply_unknown_tid(&mut self, session_peer: SocketAddr, unexpected_peer: SocketAddr) {
        warn!("datagram from unexpected peer {unexpected_peer}, expected {session_peer}");
        if let Some(session) = self.sessions.get(&session_peer) {
            let mut out = Vec::with_capacity(MAX_MSG_LEN);
            codec::build_error(&mut out, ErrorCode::UnknownTransferId, "");
            let _ = session.socket.try_send_to(&out, unexpected_peer);
        }
    }

    fn dispatch_new_peer(&mut self, listener_idx: usize, buf: &[u8], peer: SocketAddr) {
        if self.sessions.contains_key(&peer) {
            // Duplicate RRQ/WRQ for a peer we already track: resend the
            // last datagram rather than starting a second transfer.
            self.resend(peer);
            return;
        }

        let msg = match codec::parse(buf) {
            Ok(m) => m,
            Err(e) => {
                debug!("malformed request from {peer}: {e}");
                crate::audit::protocol_violation(&peer.to_string(), &e.to_string());
                self.send_error_from_listener(listener_idx, peer, ErrorCode::IllegalOperation);
                return;
            }
        };

        match msg {
            Message::Rrq { .. } | Message::Wrq { .. } if self.sessions.len() >= self.max_sessions => {
                warn!("session table full, refusing {peer}");
                self.send_error_from_listener(listener_idx, peer, ErrorCode::Undefined);
            }
            Message::Rrq { filename, mode } => {
                self.start_read(listener_idx, peer, filename, mode);
            }
            Message::Wrq { filename, mode } => {
                self.start_write(listener_idx, peer, filename, mode);
            }
            Message::Data { .. } | Message::Ack { .. } => {
                // A DATA/ACK with no matching session: the transfer this
                // peer thinks it's in doesn't exist on our side anymore.
                debug!("{peer} sent data/ack with no session, replying unknown tid");
                self.send_error_from_listener(listener_idx, peer, ErrorCode::UnknownTransferId);
            }
            Message::Error { .. } => {
                debug!("unexpected ERROR from new peer {peer}, ignoring");
            }
        }
    }

    fn start_read(&mut self, listener_idx: usize, peer: SocketAddr, filename: String, _mode: TransferMode) {
        if self.datastore.is_file(&filename) != FileStat::Present {
            crate::audit::read_denied(&peer.to_string(), &filename, "file not found");
            self.send_error_from_listener(listener_idx, peer, ErrorCode::FileNotFound);
            return;
        }
        let socket = match net::bind_session_socket(unspecified_ip(peer)) {
            Ok(s) => s,
            Err(e) => {
                error!("failed to bind session socket for {peer}: {e}");
                self.send_error_from_listener(listener_idx, peer, ErrorCode::Undefined);
                return;
            }
        };
        let id = self.alloc_session_id();
        let mut session = TftpSession::new(id, peer, socket, filename, Direction::Read);
        if let Err(e) = Self::advance_read(&mut self.datastore, &mut session) {
            warn!("initial read for {peer} failed: {e}");
            return;
        }
        crate::audit::read_request(&peer.to_string(), &session.filename);
        self.sessions.insert(peer, session);
    }

    fn start_write(&mut self, listener_idx: usize, peer: SocketAddr, filename: String, _mode: TransferMode) {
        if self.datastore.is_file(&filename) == FileStat::Present {
            crate::audit::write_request_denied(&peer.to_string(), &filename, "file already exists");
            self.send_error_from_listener(listener_idx, peer, ErrorCode::FileAlreadyExists);
            return;
        }
        let socket = match net::bind_session_socket(unspecified_ip(peer)) {
            Ok(s) => s,
            Err(e) => {
                error!("failed to bind session socket for {peer}: {e}");
                self.send_error_from_listener(listener_idx, peer, ErrorCode::Undefined);
                return;
            }
        };
        let id = self.alloc_session_id();
        let mut session = TftpSession::new(id, peer, socket, filename, Direction::Write);
        let mut out = Vec::with_capacity(MAX_MSG_LEN);
        codec::build_ack(&mut out, 0);
        send_and_record(&mut session, &out);
        crate::audit::write_request(&peer.to_string(), &session.filename);
        self.sessions.insert(peer, session);
    }

    fn dispatch_existing(&mut self, peer: SocketAddr, buf: &[u8]) {
        let msg = match codec::parse(buf) {
            Ok(m) => m,
            Err(_) => {
                self.reply_illegal_operation(peer);
                return;
            }
        };
        match msg {
            Message::Ack { block } => self.on_ack(peer, block),
            Message::Data { block, data } => self.on_data(peer, block, data),
            Message::Error { code, msg } => self.on_error_message(peer, code, msg),
            Message::Rrq { .. } | Message::Wrq { .. } => self.reply_illegal_operation(peer),
        }
    }

    fn on_ack(&mut self, peer: SocketAddr, block: u16) {
        let (direction, cur_block, fin) = match self.sessions.get(&peer) {
            Some(s) => (s.direction, s.block, s.fin),
            None => return,
        };
        if direction != Direction::Read {
            self.reply_illegal_operation(peer);
            return;
        }
        if block == cur_block.wrapping_sub(1) {
            self.resend(peer);
            return;
        }
        if block != cur_block {
            info!("unexpected ack block {block} from {peer}, ignoring");
            return;
        }
        if fin {
            if let Some(session) = self.sessions.get_mut(&peer) {
                session.disabled = true;
                let id = session.id;
                crate::audit::transfer_completed(&peer.to_string(), &session.filename, session.bytes_transferred);
                self.datastore.close_session(id);
            }
            return;
        }
        if let Some(session) = self.sessions.get_mut(&peer) {
            if let Err(e) = Self::advance_read(&mut self.datastore, session) {
                warn!("read continuation for {peer} failed: {e}");
            }
        }
    }

    fn on_data(&mut self, peer: SocketAddr, block: u16, data: &[u8]) {
        let (direction, cur_block, next_block, filename, id) = match self.sessions.get(&peer) {
            Some(s) => (s.direction, s.block, s.next_block(), s.filename.clone(), s.id),
            None => return,
        };
        if direction != Direction::Write {
            self.reply_illegal_operation(peer);
            return;
        }
        if block == cur_block {
            self.resend(peer);
            return;
        }
        if block != next_block || data.len() > codec::MAX_DATA_LEN {
            self.send_error_to_session(peer, ErrorCode::IllegalOperation);
            return;
        }
        let write_result = self.datastore.write(id, &filename, data);
        let Some(session) = self.sessions.get_mut(&peer) else { return };
        match write_result {
            Ok(_) => {
                session.block = block;
                session.bytes_transferred += data.len() as u64;
                if data.len() < codec::MAX_DATA_LEN {
                    session.fin = true;
                    crate::audit::transfer_completed(&peer.to_string(), &session.filename, session.bytes_transferred);
                }
                let mut out = Vec::with_capacity(MAX_MSG_LEN);
                codec::build_ack(&mut out, block);
                send_and_record(session, &out);
            }
            Err(e) => {
                warn!("write failed for {peer}: {e}");
                crate::audit::transfer_failed(&peer.to_string(), &session.filename, &e.to_string());
                let code = match e {
                    DsError::NotPermitted => ErrorCode::FileAlreadyExists,
                    _ => ErrorCode::DiskFull,
                };
                let mut out = Vec::with_capacity(MAX_MSG_LEN);
                codec::build_error(&mut out, code, "");
                let _ = session.socket.try_send_to(&out, peer);
                session.disabled = true;
            }
        }
    }

    fn on_error_message(&mut self, peer: SocketAddr, code: u16, msg: &[u8]) {
        info!("client {peer} reported error {code}: {}", String::from_utf8_lossy(msg));
        if let Some(session) = self.sessions.get_mut(&peer) {
            session.disabled = true;
            let id = session.id;
            self.datastore.close_session(id);
        }
    }

    /// Reads up to one block from the datastore and sends it as DATA,
    /// advancing `session.block` and setting `fin` on a short read.
    fn advance_read(datastore: &mut Datastore, session: &mut TftpSession) -> std::result::Result<(), DsError> {
        let mut data = [0u8; codec::MAX_DATA_LEN];
        let n = datastore.read(session.id, &session.filename, &mut data)?;
        let block = session.next_block();
        session.block = block;
        session.bytes_transferred += n as u64;
        if n < codec::MAX_DATA_LEN {
            session.fin = true;
        }
        let mut out = Vec::with_capacity(MAX_MSG_LEN);
        codec::build_data(&mut out, block, &data[..n]);
        send_and_record(session, &out);
        Ok(())
    }

    fn resend(&mut self, peer: SocketAddr) {
        let Some(session) = self.sessions.get_mut(&peer) else { return };
        if session.last_msg.is_empty() {
            return;
        }
        let msg = session.last_msg.clone();
        let _ = session.socket.try_send_to(&msg, peer);
    }

    fn reply_illegal_operation(&mut self, peer: SocketAddr) {
        crate::audit::protocol_violation(&peer.to_string(), "illegal tftp operation");
        self.send_error_to_session(peer, ErrorCode::IllegalOperation);
    }

    fn send_error_to_session(&mut self, peer: SocketAddr, code: ErrorCode) {
        let Some(session) = self.sessions.get_mut(&peer) else { return };
        let mut out = Vec::with_capacity(MAX_MSG_LEN);
        codec::build_error(&mut out, code, "");
        let _ = session.socket.try_send_to(&out, peer);
    }

    fn send_error_from_listener(&mut self, listener_idx: usize, peer: SocketAddr, code: ErrorCode) {
        let mut out = Vec::with_capacity(MAX_MSG_LEN);
        codec::build_error(&mut out, code, "server error");
        let _ = self.listeners[listener_idx].try_send_to(&out, peer);
    }

    fn alloc_session_id(&mut self) -> u64 {
        let id = self.next_session_id;
        self.next_session_id += 1;
        id
    }

    /// Resends `last_msg` for any live, non-final, non-disabled session
    /// whose last transmission is older than [`RESEND_INTERVAL`].
    fn retransmit_sweep(&mut self) {
        let now = Instant::now();
        for session in self.sessions.values_mut() {
            if session.disabled || session.fin {
                continue;
            }
            if now.duration_since(session.last_sent_at) < RESEND_INTERVAL {
                continue;
            }
            if session.last_msg.is_empty() {
                continue;
            }
            let _ = session.socket.try_send_to(&session.last_msg.clone(), session.peer);
            if session.note_retransmit(now, RESEND_COUNTMAX) {
                warn!("session {} exceeded retry budget, disabling", session.peer);
                session.disabled = true;
            }
        }
    }

    /// Drops sessions marked `disabled`, and finished sessions that have
    /// outlived [`SESSION_CLOSEWAIT`] without further activity.
    fn cleanup_sweep(&mut self) {
        let now = Instant::now();
        let mut to_remove = Vec::new();
        for (peer, session) in self.sessions.iter() {
            let expired = session.fin && now.duration_since(session.last_sent_at) >= SESSION_CLOSEWAIT;
            if session.disabled || expired {
                to_remove.push((*peer, session.id));
            }
        }
        for (peer, id) in to_remove {
            self.datastore.close_session(id);
            self.sessions.remove(&peer);
        }
    }
}

fn unspecified_ip(peer: SocketAddr) -> std::net::IpAddr {
    use std::net::{Ipv4Addr, Ipv6Addr};
    match peer {
        SocketAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
        SocketAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
    }
}

fn send_and_record(session: &mut TftpSession, msg: &[u8]) {
    let _ = session.socket.try_send_to(msg, session.peer);
    session.record_sent(msg, Instant::now());
}

async fn recv_one(socket: &UdpSocket, kind: SockKind) -> (SockKind, Vec<u8>, std::io::Result<(usize, SocketAddr)>) {
    let mut buf = vec![0u8; RECV_BUF_SIZE];
    let result = socket.recv_from(&mut buf).await;
    (kind, buf, result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    async fn make_reactor() -> (Reactor, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let datastore = Datastore::new(dir.path().to_path_buf()).unwrap();
        let listener = net::bind_udp("127.0.0.1:0".parse().unwrap()).unwrap();
        let reactor = Reactor::new(vec![listener], datastore, Arc::new(AtomicBool::new(false)));
        (reactor, dir)
    }

    #[tokio::test]
    async fn read_of_missing_file_sends_error() {
        let (mut reactor, _dir) = make_reactor().await;
        let peer: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        let mut req = Vec::new();
        codec::build_rrq(&mut req, "missing.txt", TransferMode::Octet);
        reactor.dispatch_new_peer(0, &req, peer);
        assert!(reactor.sessions.is_empty());
    }

    #[tokio::test]
    async fn read_of_existing_file_creates_session() {
        let (mut reactor, dir) = make_reactor().await;
        std::fs::write(dir.path().join("greet.txt"), b"hello").unwrap();
        let peer: SocketAddr = "127.0.0.1:40001".parse().unwrap();
        let mut req = Vec::new();
        codec::build_rrq(&mut req, "greet.txt", TransferMode::Octet);
        reactor.dispatch_new_peer(0, &req, peer);
        let session = reactor.sessions.get(&peer).expect("session created");
        assert_eq!(session.block, 1);
        assert!(session.fin);
    }

    #[tokio::test]
    async fn write_request_for_existing_file_is_refused() {
        let (mut reactor, dir) = make_reactor().await;
        std::fs::write(dir.path().join("a.bin"), b"x").unwrap();
        let peer: SocketAddr = "127.0.0.1:40002".parse().unwrap();
        let mut req = Vec::new();
        codec::build_wrq(&mut req, "a.bin", TransferMode::Octet);
        reactor.dispatch_new_peer(0, &req, peer);
        assert!(reactor.sessions.is_empty());
    }

    #[tokio::test]
    async fn data_with_no_session_gets_unknown_tid_error() {
        let (mut reactor, _dir) = make_reactor().await;
        let peer: SocketAddr = "127.0.0.1:40006".parse().unwrap();
        let mut data = Vec::new();
        codec::build_data(&mut data, 1, b"x");
        reactor.dispatch_new_peer(0, &data, peer);
        assert!(reactor.sessions.is_empty(), "a stray DATA must not start a session");
    }

    #[tokio::test]
    async fn ack_with_no_session_gets_unknown_tid_error() {
        let (mut reactor, _dir) = make_reactor().await;
        let peer: SocketAddr = "127.0.0.1:40007".parse().unwrap();
        let mut ack = Vec::new();
        codec::build_ack(&mut ack, 1);
        reactor.dispatch_new_peer(0, &ack, peer);
        assert!(reactor.sessions.is_empty(), "a stray ACK must not start a session");
    }

    #[tokio::test]
    async fn file_of_exactly_one_block_needs_a_trailing_empty_data() {
        let (mut reactor, dir) = make_reactor().await;
        let body = vec![b'x'; codec::MAX_DATA_LEN];
        std::fs::write(dir.path().join("full.bin"), &body).unwrap();
        let peer: SocketAddr = "127.0.0.1:40004".parse().unwrap();
        let mut req = Vec::new();
        codec::build_rrq(&mut req, "full.bin", TransferMode::Octet);
        reactor.dispatch_new_peer(0, &req, peer);
        {
            let session = reactor.sessions.get(&peer).unwrap();
            assert_eq!(session.block, 1);
            assert!(!session.fin, "a full-size block is not yet the final one");
        }
        reactor.on_ack(peer, 1);
        let session = reactor.sessions.get(&peer).unwrap();
        assert_eq!(session.block, 2);
        assert!(session.fin, "the trailing empty block must close the transfer");
    }

    #[tokio::test]
    async fn illegal_opcode_from_established_peer_sends_error() {
        let (mut reactor, dir) = make_reactor().await;
        std::fs::write(dir.path().join("greet.txt"), b"hello").unwrap();
        let peer: SocketAddr = "127.0.0.1:40005".parse().unwrap();
        let mut req = Vec::new();
        codec::build_rrq(&mut req, "greet.txt", TransferMode::Octet);
        reactor.dispatch_new_peer(0, &req, peer);
        assert!(reactor.sessions.contains_key(&peer));

        let mut bogus_wrq = Vec::new();
        codec::build_wrq(&mut bogus_wrq, "greet.txt", TransferMode::Octet);
        reactor.dispatch_existing(peer, &bogus_wrq);
        assert!(reactor.sessions.contains_key(&peer), "an illegal op does not tear down the session itself");
    }

    #[tokio::test]
    async fn retransmit_sweep_disables_after_max_retries() {
        let (mut reactor, dir) = make_reactor().await;
        std::fs::write(dir.path().join("greet.txt"), b"hello").unwrap();
        let peer: SocketAddr = "127.0.0.1:40003".parse().unwrap();
        let mut req = Vec::new();
        codec::build_rrq(&mut req, "greet.txt", TransferMode::Octet);
        reactor.dispatch_new_peer(0, &req, peer);
        {
            let session = reactor.sessions.get_mut(&peer).unwrap();
            session.last_sent_at = Instant::now() - RESEND_INTERVAL * 4;
        }
        for _ in 0..RESEND_COUNTMAX {
            reactor.retransmit_sweep();
            if let Some(session) = reactor.sessions.get_mut(&peer) {
                session.last_sent_at = Instant::now() - RESEND_INTERVAL * 2;
            }
        }
        assert!(reactor.sessions.get(&peer).unwrap().disabled);
    }
}
