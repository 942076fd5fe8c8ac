//! Selective ACK bitmask (BEP 29 extension 1)
//!
//! Bit `i` covers sequence number `ack_nr + 2 + i`. Bits are packed least
//! significant first within each byte and the byte length is always a
//! multiple of 4.

/// Received-packet bitmap beyond the cumulative ack
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectiveAckBitmask {
    bytes: Vec<u8>,
}

impl SelectiveAckBitmask {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap bytes taken from a decoded extension
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Mark offset `index` as received, growing in 4-byte steps
    pub fn set_bit(&mut self, index: usize) {
        let byte = index / 8;
        if byte >= self.bytes.len() {
            let len = (byte / 4 + 1) * 4;
            self.bytes.resize(len, 0);
        }
        self.bytes[byte] |= 1 << (index % 8);
    }

    pub fn bit_is_set(&self, index: usize) -> bool {
        self.bytes
            .get(index / 8)
            .is_some_and(|byte| byte & (1 << (index % 8)) != 0)
    }

    pub fn num_bits(&self) -> usize {
        self.bytes.len() * 8
    }

    /// True when no byte has been allocated
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Index of the highest set bit
    pub fn last_set_bit(&self) -> Option<usize> {
        (0..self.num_bits()).rev().find(|&i| self.bit_is_set(i))
    }
}
