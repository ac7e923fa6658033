//! Block-transfer wire protocol.
//!
//! The instrument serves fixed-size data blocks over UDP. Each block is
//! requested with a single datagram and answered with exactly
//! [`RESPONSE_LEN`] bytes, which may arrive split across several datagrams.

use crate::error::{Result, ScopeError};
use log::trace;
use std::io::ErrorKind;
use std::net::UdpSocket;
use std::time::{Duration, Instant};

/// Raw bytes carried by one block.
pub const BLOCK: usize = 1024;
/// Blocks fetched per sample-generation pass.
pub const BLOCKS_PER_PASS: usize = 16;
/// Exact response size for one block request.
pub const RESPONSE_LEN: usize = 6 + BLOCK + 2 * BLOCK.div_ceil(256);
/// Size of one full pass buffer.
pub const PASS_LEN: usize = BLOCKS_PER_PASS * RESPONSE_LEN;

pub const DEFAULT_PORT: u16 = 8080;

const CMD_SETUP: u8 = 0x17;
const SUB_SETUP: u8 = 0x02;
const CMD_FETCH: u8 = 0x16;
const SUB_FETCH: u8 = 0x03;
const REQUEST_LEN: usize = 13;

/// Build the request frame for one block.
///
/// Layout: u16 LE length prefix, setup command and sub-opcode, a zero byte,
/// the block size minus one as big-endian u16, fetch command and sub-opcode,
/// and the big-endian block offset (`block_index << 10`) with the top bit of
/// its first byte forced set.
pub fn build_request(block_index: u32) -> [u8; REQUEST_LEN] {
    let mut frame = [0u8; REQUEST_LEN];
    frame[..2].copy_from_slice(&((REQUEST_LEN - 2) as u16).to_le_bytes());
    frame[2] = CMD_SETUP;
    frame[3] = SUB_SETUP;
    frame[4] = 0x00;
    frame[5] = ((BLOCK - 1) / 256) as u8;
    frame[6] = ((BLOCK - 1) % 256) as u8;
    frame[7] = CMD_FETCH;
    frame[8] = SUB_FETCH;
    let offset = (block_index << 10).to_be_bytes();
    frame[9] = offset[0] | 0x80;
    frame[10..].copy_from_slice(&offset[1..]);
    frame
}

/// Source of raw pass buffers, the seam between the scheduler and the wire.
pub trait BlockSource {
    /// Fetch one full pass (sixteen blocks) into a contiguous buffer.
    fn fetch_pass(&mut self) -> Result<Vec<u8>>;
}

/// Blocking UDP transport with a bounded per-block retry loop.
pub struct UdpTransport {
    socket: UdpSocket,
    fetch_timeout: Duration,
}

impl UdpTransport {
    /// Bind a socket and associate it with the instrument endpoint.
    ///
    /// Failure here is fatal for the device: it is propagated and the
    /// acquisition never starts.
    pub fn open(addr: &str, fetch_timeout: Duration) -> Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect(addr)?;
        socket.set_read_timeout(Some(fetch_timeout))?;
        Ok(Self {
            socket,
            fetch_timeout,
        })
    }

    /// Request block `block_index` and collect exactly [`RESPONSE_LEN`]
    /// bytes into `buf`, retrying partial receives until the per-block
    /// deadline expires.
    pub fn fetch_block(&self, block_index: u32, buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), RESPONSE_LEN);
        let request = build_request(block_index);
        self.socket
            .send(&request)
            .map_err(|e| ScopeError::Transport(format!("block {block_index}: send failed: {e}")))?;

        let deadline = Instant::now() + self.fetch_timeout;
        let mut filled = 0;
        while filled < RESPONSE_LEN {
            match self.socket.recv(&mut buf[filled..]) {
                Ok(0) => {
                    return Err(ScopeError::Transport(format!(
                        "block {block_index}: empty datagram after {filled} bytes"
                    )))
                }
                Ok(n) => {
                    filled += n;
                    trace!("block {block_index}: {filled}/{RESPONSE_LEN} bytes");
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                    return Err(ScopeError::Transport(format!(
                        "block {block_index}: timed out with {filled}/{RESPONSE_LEN} bytes"
                    )))
                }
                Err(e) => {
                    return Err(ScopeError::Transport(format!(
                        "block {block_index}: recv failed: {e}"
                    )))
                }
            }
            if Instant::now() >= deadline && filled < RESPONSE_LEN {
                return Err(ScopeError::Transport(format!(
                    "block {block_index}: deadline expired with {filled}/{RESPONSE_LEN} bytes"
                )));
            }
        }
        Ok(())
    }
}

impl BlockSource for UdpTransport {
    fn fetch_pass(&mut self) -> Result<Vec<u8>> {
        let mut pass = vec![0u8; PASS_LEN];
        for (i, chunk) in pass.chunks_exact_mut(RESPONSE_LEN).enumerate() {
            self.fetch_block(i as u32, chunk)?;
        }
        Ok(pass)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn response_length_arithmetic() {
        assert_eq!(RESPONSE_LEN, 1038);
        assert_eq!(PASS_LEN, 16 * 1038);
    }

    #[test]
    fn request_frame_layout() {
        let frame = build_request(3);
        assert_eq!(&frame[..2], &11u16.to_le_bytes());
        assert_eq!(&frame[2..5], &[0x17, 0x02, 0x00]);
        // BLOCK - 1 = 1023, big-endian
        assert_eq!(&frame[5..7], &[0x03, 0xFF]);
        assert_eq!(&frame[7..9], &[0x16, 0x03]);
        // offset = 3 << 10 = 0x0000_0C00, top bit of first byte set
        assert_eq!(&frame[9..], &[0x80, 0x00, 0x0C, 0x00]);
    }

    #[test]
    fn request_offset_top_bit_always_set() {
        for index in [0u32, 1, 15, 255] {
            let frame = build_request(index);
            assert_eq!(frame[9] & 0x80, 0x80);
            let offset = u32::from_be_bytes([frame[9] & 0x7F, frame[10], frame[11], frame[12]]);
            assert_eq!(offset, index << 10);
        }
    }

    #[test]
    fn fetch_block_reassembles_partial_datagrams() {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = server.local_addr().unwrap();

        let handle = thread::spawn(move || {
            let mut req = [0u8; 64];
            let (n, peer) = server.recv_from(&mut req).unwrap();
            assert_eq!(n, REQUEST_LEN);
            assert_eq!(req[..n], build_request(0));
            // Answer in two datagrams to exercise the receive loop.
            let response: Vec<u8> = (0..RESPONSE_LEN).map(|i| i as u8).collect();
            server.send_to(&response[..600], peer).unwrap();
            server.send_to(&response[600..], peer).unwrap();
        });

        let transport =
            UdpTransport::open(&addr.to_string(), Duration::from_millis(500)).unwrap();
        let mut buf = vec![0u8; RESPONSE_LEN];
        transport.fetch_block(0, &mut buf).unwrap();
        assert_eq!(buf, (0..RESPONSE_LEN).map(|i| i as u8).collect::<Vec<_>>());
        handle.join().unwrap();
    }

    #[test]
    fn fetch_block_times_out_as_transport_fault() {
        // Nothing listening on the peer; recv must hit the timeout.
        let silent = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = silent.local_addr().unwrap();
        let transport =
            UdpTransport::open(&addr.to_string(), Duration::from_millis(50)).unwrap();
        let mut buf = vec![0u8; RESPONSE_LEN];
        match transport.fetch_block(0, &mut buf) {
            Err(ScopeError::Transport(_)) => {}
            other => panic!("expected transport fault, got {other:?}"),
        }
    }
}
