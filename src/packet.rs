use std::fmt::{Debug, Formatter};
use std::ops::Deref;
use bytes::Bytes;

/// One complete application message as it was passed to `Session::send` on the sending side.
///
/// A packet may legitimately be empty; 'no packet available' is expressed as `Option::None`
///  by the receiving APIs.
#[derive(Clone, PartialEq, Eq)]
pub struct Packet {
    data: Bytes,
}

impl Packet {
    pub fn new(data: impl Into<Bytes>) -> Packet {
        Packet {
            data: data.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn into_bytes(self) -> Bytes {
        self.data
    }
}

impl Debug for Packet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Packet({} bytes)", self.data.len())
    }
}

impl Deref for Packet {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl AsRef<[u8]> for Packet {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl From<Vec<u8>> for Packet {
    fn from(value: Vec<u8>) -> Self {
        Packet::new(value)
    }
}

impl From<Bytes> for Packet {
    fn from(value: Bytes) -> Self {
        Packet::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_packet() {
        let packet = Packet::new(Vec::new());
        assert!(packet.is_empty());
        assert_eq!(packet.len(), 0);
        assert_eq!(packet.as_ref(), b"");
    }

    #[test]
    fn test_packet_content() {
        let packet = Packet::from(b"hi".to_vec());
        assert_eq!(packet.len(), 2);
        assert_eq!(&packet[..], b"hi");
        assert_eq!(format!("{:?}", packet), "Packet(2 bytes)");
        assert_eq!(packet.into_bytes(), Bytes::from_static(b"hi"));
    }
}
