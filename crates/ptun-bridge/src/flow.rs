//! Host packet flow interface

/// Address family of a packet on the host flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolFamily {
    Inet,
    Inet6,
}

impl ProtocolFamily {
    /// Family from the IP version nibble of a raw packet
    pub fn of_packet(packet: &[u8]) -> Option<Self> {
        match packet.first()? >> 4 {
            4 => Some(Self::Inet),
            6 => Some(Self::Inet6),
            _ => None,
        }
    }
}

/// One-shot callback receiving a batch of packets and their families
pub type PacketBatchHandler = Box<dyn FnOnce(Vec<Vec<u8>>, Vec<ProtocolFamily>) + Send>;

/// The host side of the tunnel interface.
pub trait PacketFlow: Send + Sync {
    /// Deliver the next batch to `handler`. Must be called again for every
    /// further batch.
    fn read_packets(&self, handler: PacketBatchHandler);

    fn write_packets(&self, packets: Vec<Vec<u8>>, families: Vec<ProtocolFamily>);
}
