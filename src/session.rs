//! Per-peer TFTP session state.

use std::net::SocketAddr;
use std::time::Instant;

use tokio::net::UdpSocket;

use crate::codec::MAX_MSG_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

/// One in-progress transfer. Identified externally by `peer`.
pub struct TftpSession {
    pub id: u64,
    pub peer: SocketAddr,
    pub socket: UdpSocket,
    pub filename: String,
    pub direction: Direction,
    /// Current block number; for `Read` this is the last DATA block
    /// sent, for `Write` the last block successfully stored.
    pub block: u16,
    /// Transfer has reached its final block; no further blocks will be
    /// originated, but retransmission of `last_msg` can still happen.
    pub fin: bool,
    /// Marked for removal on the next cleanup sweep.
    pub disabled: bool,
    pub last_msg: Vec<u8>,
    pub last_sent_at: Instant,
    pub retries: u32,
    /// Running total of file-payload bytes moved, for the audit log's
    /// completion record. Excludes the 4-byte DATA/ACK header.
    pub bytes_transferred: u64,
}

impl TftpSession {
    pub fn new(id: u64, peer: SocketAddr, socket: UdpSocket, filename: String, direction: Direction) -> Self {
        Self {
            id,
            peer,
            socket,
            filename,
            direction,
            block: 0,
            fin: false,
            disabled: false,
            last_msg: Vec::with_capacity(MAX_MSG_LEN),
            last_sent_at: Instant::now(),
            retries: 0,
            bytes_transferred: 0,
        }
    }

    /// Records `msg` as the datagram to retransmit on timeout or
    /// duplicate, and resets the retry counter.
    pub fn record_sent(&mut self, msg: &[u8], now: Instant) {
        self.last_msg.clear();
        self.last_msg.extend_from_slice(msg);
        self.last_sent_at = now;
        self.retries = 0;
    }

    /// Bumps the retry counter and refreshes the timestamp ahead of a
    /// retransmission of `last_msg`. Returns `true` if the retry budget
    /// is now exhausted and the session should be disabled.
    pub fn note_retransmit(&mut self, now: Instant, max_retries: u32) -> bool {
        self.retries += 1;
        self.last_sent_at = now;
        self.retries >= max_retries
    }

    pub fn next_block(&self) -> u16 {
        self.block.wrapping_add(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_block_wraps_past_u16_max() {
        let mut s = make_dummy();
        s.block = 65535;
        assert_eq!(s.next_block(), 0);
    }

    #[test]
    fn note_retransmit_trips_disable_at_cap() {
        let mut s = make_dummy();
        let now = Instant::now();
        assert!(!s.note_retransmit(now, 3));
        assert!(!s.note_retransmit(now, 3));
        assert!(s.note_retransmit(now, 3));
    }

    fn make_dummy() -> TftpSession {
        // Constructed with a bound loopback socket; no I/O is performed
        // in these pure state tests.
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            TftpSession::new(
                1,
                "127.0.0.1:12345".parse().unwrap(),
                socket,
                "f.txt".to_string(),
                Direction::Read,
            )
        })
    }
}
