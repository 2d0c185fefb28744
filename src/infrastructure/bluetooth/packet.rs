//! Blob Reassembly
//!
//! Binary payloads larger than one ATT packet are sent as a header packet
//! followed by raw continuation packets.
//!
//! ```text
//! [0]    : Action id
//! [1]    : Status id (0x00 = no data follows)
//! [2-3]  : Payload length (u16 little-endian), absent when status is 0x00
//! [4..]  : First payload bytes
//! ```

use image::DynamicImage;
use tracing::{debug, trace};

pub const HEADER_LEN: usize = 4;
pub const STATUS_NO_DATA: u8 = 0x00;

#[derive(Debug, Clone)]
pub struct PacketReassembler {
    action: u8,
    status: u8,
    expected: usize,
    data: Vec<u8>,
}

impl PacketReassembler {
    /// Start reassembly from the header packet.
    pub fn new(first_packet: &[u8]) -> Self {
        let action = first_packet.first().copied().unwrap_or_default();
        let status = first_packet.get(1).copied().unwrap_or(STATUS_NO_DATA);

        let mut reassembler = Self {
            action,
            status,
            expected: 0,
            data: Vec::new(),
        };

        if status != STATUS_NO_DATA && first_packet.len() >= HEADER_LEN {
            reassembler.expected = u16::from_le_bytes([first_packet[2], first_packet[3]]) as usize;
            reassembler.push(&first_packet[HEADER_LEN..]);
        }
        debug!(
            action,
            status,
            expected = reassembler.expected,
            "Blob transfer started"
        );
        reassembler
    }

    /// Append a continuation packet. Bytes past the declared length are dropped.
    pub fn push(&mut self, packet: &[u8]) {
        let room = self.expected.saturating_sub(self.data.len());
        let take = room.min(packet.len());
        if take < packet.len() {
            trace!(extra = packet.len() - take, "Discarding bytes past declared length");
        }
        self.data.extend_from_slice(&packet[..take]);
    }

    pub fn action(&self) -> u8 {
        self.action
    }

    pub fn status(&self) -> u8 {
        self.status
    }

    pub fn expected_len(&self) -> usize {
        self.expected
    }

    pub fn is_finished(&self) -> bool {
        self.data.len() >= self.expected
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn text(&self) -> Option<String> {
        String::from_utf8(self.data.clone()).ok()
    }

    pub fn image(&self) -> Option<DynamicImage> {
        if self.data.is_empty() {
            return None;
        }
        image::load_from_memory(&self.data)
            .map_err(|e| debug!("Blob is not a decodable image: {}", e))
            .ok()
    }
}
