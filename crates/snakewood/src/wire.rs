//! Wire protocol: frame types, encoding, and decoding.
//!
//! Frame format: `length(uvarint) | type(u8) | body`
//!
//! All variable-length integers use unsigned LEB128 (uvarint) encoding.
//! Coordinates are encoded as sequences of uvarint port numbers, terminated
//! by 0. Which body fields are present depends on the frame type; absent
//! fields decode to their zero values.

use crate::crypto::{PublicKey, Sig, PUBLIC_KEY_SIZE, SIGNATURE_SIZE};
use crate::types::FrameError;

/// Tree coordinates: the switch ports on the path from the root to a node.
pub type Coordinates = Vec<u64>;

/// Random 8-byte identifier distinguishing concurrent snake paths between
/// the same pair of keys.
pub(crate) type PathId = [u8; 8];

pub(crate) const PATH_ID_SIZE: usize = 8;

/// A tree epoch: the root a path was negotiated under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Root {
    pub public_key: PublicKey,
    pub sequence: u64,
}

// ---------------------------------------------------------------------------
// Packet types
// ---------------------------------------------------------------------------

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PacketType {
    Keepalive = 0,
    TreeAnnouncement = 1,
    TreePing = 2,
    TreePong = 3,
    SnekPing = 4,
    SnekPong = 5,
    Bootstrap = 6,
    BootstrapAck = 7,
    Setup = 8,
    Teardown = 9,
    Traffic = 10,
}

impl TryFrom<u8> for PacketType {
    type Error = FrameError;
    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Self::Keepalive),
            1 => Ok(Self::TreeAnnouncement),
            2 => Ok(Self::TreePing),
            3 => Ok(Self::TreePong),
            4 => Ok(Self::SnekPing),
            5 => Ok(Self::SnekPong),
            6 => Ok(Self::Bootstrap),
            7 => Ok(Self::BootstrapAck),
            8 => Ok(Self::Setup),
            9 => Ok(Self::Teardown),
            10 => Ok(Self::Traffic),
            _ => Err(FrameError::Unmarshal),
        }
    }
}

// ---------------------------------------------------------------------------
// Uvarint helpers (unsigned LEB128)
// ---------------------------------------------------------------------------

/// Encode a u64 as uvarint, appending to `out`.
pub(crate) fn encode_uvarint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            break;
        }
    }
}

/// Decode a uvarint from the front of `data`. Returns (value, bytes_consumed).
/// Returns None if the data is insufficient or the varint is malformed.
pub(crate) fn decode_uvarint(data: &[u8]) -> Option<(u64, usize)> {
    let mut value: u64 = 0;
    let mut shift: u32 = 0;
    for (i, &byte) in data.iter().enumerate() {
        if shift >= 63 && byte > 1 {
            return None; // overflow
        }
        value |= ((byte & 0x7F) as u64) << shift;
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
        shift += 7;
        if i >= 9 {
            return None; // too many bytes
        }
    }
    None // incomplete
}

/// Compute the encoded size of a uvarint.
pub(crate) fn uvarint_size(mut value: u64) -> usize {
    let mut size = 1;
    while value >= 0x80 {
        value >>= 7;
        size += 1;
    }
    size
}

// ---------------------------------------------------------------------------
// Coordinate helpers (zero-terminated uvarint sequences)
// ---------------------------------------------------------------------------

/// Encode coordinates as zero-terminated uvarints. Port 0 never appears on a
/// link, so it is free to act as the terminator.
pub(crate) fn encode_coords(out: &mut Vec<u8>, coords: &[u64]) {
    for &port in coords {
        encode_uvarint(out, port);
    }
    encode_uvarint(out, 0); // terminator
}

// ---------------------------------------------------------------------------
// Decoder helper: reads from a &[u8] cursor
// ---------------------------------------------------------------------------

/// A cursor for decoding wire messages.
pub(crate) struct WireReader<'a> {
    data: &'a [u8],
}

impl<'a> WireReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Read the remaining bytes.
    pub fn rest(&self) -> &'a [u8] {
        self.data
    }

    pub fn read_uvarint(&mut self) -> Result<u64, FrameError> {
        let (value, len) = decode_uvarint(self.data).ok_or(FrameError::Unmarshal)?;
        self.data = &self.data[len..];
        Ok(value)
    }

    pub fn read_fixed<const N: usize>(&mut self) -> Result<[u8; N], FrameError> {
        if self.data.len() < N {
            return Err(FrameError::Unmarshal);
        }
        let mut out = [0u8; N];
        out.copy_from_slice(&self.data[..N]);
        self.data = &self.data[N..];
        Ok(out)
    }

    pub fn read_public_key(&mut self) -> Result<PublicKey, FrameError> {
        self.read_fixed::<PUBLIC_KEY_SIZE>()
    }

    pub fn read_signature(&mut self) -> Result<Sig, FrameError> {
        self.read_fixed::<SIGNATURE_SIZE>()
    }

    pub fn read_coords(&mut self) -> Result<Coordinates, FrameError> {
        let mut coords = Vec::new();
        loop {
            let value = self.read_uvarint()?;
            if value == 0 {
                break;
            }
            coords.push(value);
        }
        Ok(coords)
    }
}

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

/// A routed message. A tagged union over the protocol's packet types: the
/// coordinate fields are used by tree-routed frames, the key fields by
/// snake-routed frames, and both by the bootstrap handshake.
#[derive(Debug, Clone)]
pub(crate) struct Frame {
    pub ptype: PacketType,
    pub source: Coordinates,
    pub destination: Coordinates,
    pub source_key: PublicKey,
    pub destination_key: PublicKey,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(ptype: PacketType) -> Self {
        Self {
            ptype,
            source: Vec::new(),
            destination: Vec::new(),
            source_key: [0u8; PUBLIC_KEY_SIZE],
            destination_key: [0u8; PUBLIC_KEY_SIZE],
            payload: Vec::new(),
        }
    }

    /// Encode the complete frame: length(uvarint) | type(u8) | body.
    pub fn encode_to_vec(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(64 + self.payload.len());
        body.push(self.ptype as u8);
        match self.ptype {
            PacketType::Keepalive => {}
            PacketType::TreeAnnouncement => {
                body.extend_from_slice(&self.payload);
            }
            PacketType::TreePing | PacketType::TreePong => {
                encode_coords(&mut body, &self.source);
                encode_coords(&mut body, &self.destination);
            }
            PacketType::SnekPing | PacketType::SnekPong => {
                body.extend_from_slice(&self.source_key);
                body.extend_from_slice(&self.destination_key);
            }
            PacketType::Bootstrap => {
                body.extend_from_slice(&self.destination_key);
                encode_coords(&mut body, &self.source);
                body.extend_from_slice(&self.payload);
            }
            PacketType::BootstrapAck => {
                encode_coords(&mut body, &self.source);
                encode_coords(&mut body, &self.destination);
                body.extend_from_slice(&self.source_key);
                body.extend_from_slice(&self.destination_key);
                body.extend_from_slice(&self.payload);
            }
            PacketType::Setup => {
                encode_coords(&mut body, &self.destination);
                body.extend_from_slice(&self.source_key);
                body.extend_from_slice(&self.destination_key);
                body.extend_from_slice(&self.payload);
            }
            PacketType::Teardown => {
                body.extend_from_slice(&self.destination_key);
                body.extend_from_slice(&self.payload);
            }
            PacketType::Traffic => {
                body.extend_from_slice(&self.source_key);
                body.extend_from_slice(&self.destination_key);
                body.extend_from_slice(&self.payload);
            }
        }

        let mut frame = Vec::with_capacity(uvarint_size(body.len() as u64) + body.len());
        encode_uvarint(&mut frame, body.len() as u64);
        frame.extend_from_slice(&body);
        frame
    }

    /// Decode a frame from `content` (type byte + body, the length prefix
    /// already stripped by the reader).
    pub fn decode(content: &[u8]) -> Result<Self, FrameError> {
        if content.is_empty() {
            return Err(FrameError::PayloadTooShort);
        }
        let ptype = PacketType::try_from(content[0])?;
        let mut r = WireReader::new(&content[1..]);
        let mut frame = Frame::new(ptype);
        match ptype {
            PacketType::Keepalive => {}
            PacketType::TreeAnnouncement => {
                frame.payload = r.rest().to_vec();
            }
            PacketType::TreePing | PacketType::TreePong => {
                frame.source = r.read_coords()?;
                frame.destination = r.read_coords()?;
            }
            PacketType::SnekPing | PacketType::SnekPong => {
                frame.source_key = r.read_public_key()?;
                frame.destination_key = r.read_public_key()?;
            }
            PacketType::Bootstrap => {
                frame.destination_key = r.read_public_key()?;
                frame.source = r.read_coords()?;
                frame.payload = r.rest().to_vec();
            }
            PacketType::BootstrapAck => {
                frame.source = r.read_coords()?;
                frame.destination = r.read_coords()?;
                frame.source_key = r.read_public_key()?;
                frame.destination_key = r.read_public_key()?;
                frame.payload = r.rest().to_vec();
            }
            PacketType::Setup => {
                frame.destination = r.read_coords()?;
                frame.source_key = r.read_public_key()?;
                frame.destination_key = r.read_public_key()?;
                frame.payload = r.rest().to_vec();
            }
            PacketType::Teardown => {
                frame.destination_key = r.read_public_key()?;
                frame.payload = r.rest().to_vec();
            }
            PacketType::Traffic => {
                frame.source_key = r.read_public_key()?;
                frame.destination_key = r.read_public_key()?;
                frame.payload = r.rest().to_vec();
            }
        }
        Ok(frame)
    }
}

// ---------------------------------------------------------------------------
// Snake payloads
// ---------------------------------------------------------------------------

/// Payload shared by bootstrap, bootstrap-ACK and setup frames:
/// `path_id(8) || root public key(32) || root sequence(varu64)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SnakePathUpdate {
    pub path_id: PathId,
    pub root: Root,
}

impl SnakePathUpdate {
    pub fn encode_to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(PATH_ID_SIZE + PUBLIC_KEY_SIZE + 10);
        out.extend_from_slice(&self.path_id);
        out.extend_from_slice(&self.root.public_key);
        encode_uvarint(&mut out, self.root.sequence);
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, FrameError> {
        if data.len() < PATH_ID_SIZE + PUBLIC_KEY_SIZE + 1 {
            return Err(FrameError::PayloadTooShort);
        }
        let mut r = WireReader::new(data);
        let path_id = r.read_fixed::<PATH_ID_SIZE>()?;
        let public_key = r.read_public_key()?;
        let sequence = r.read_uvarint()?;
        Ok(Self {
            path_id,
            root: Root {
                public_key,
                sequence,
            },
        })
    }
}

/// Teardown payload: `path_id(8)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SnakeTeardown {
    pub path_id: PathId,
}

impl SnakeTeardown {
    pub fn encode_to_vec(&self) -> Vec<u8> {
        self.path_id.to_vec()
    }

    pub fn decode(data: &[u8]) -> Result<Self, FrameError> {
        if data.len() < PATH_ID_SIZE {
            return Err(FrameError::PayloadTooShort);
        }
        let mut r = WireReader::new(data);
        let path_id = r.read_fixed::<PATH_ID_SIZE>()?;
        Ok(Self { path_id })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(frame: &Frame) -> Frame {
        let encoded = frame.encode_to_vec();
        let (len, consumed) = decode_uvarint(&encoded).unwrap();
        assert_eq!(consumed + len as usize, encoded.len());
        Frame::decode(&encoded[consumed..]).unwrap()
    }

    #[test]
    fn uvarint_roundtrip() {
        for &val in &[0u64, 1, 127, 128, 255, 256, 16383, 16384, u64::MAX >> 1] {
            let mut buf = Vec::new();
            encode_uvarint(&mut buf, val);
            let (decoded, len) = decode_uvarint(&buf).unwrap();
            assert_eq!(decoded, val);
            assert_eq!(len, buf.len());
            assert_eq!(len, uvarint_size(val));
        }
    }

    #[test]
    fn coords_roundtrip() {
        let coords = vec![1, 2, 300, 65535];
        let mut buf = Vec::new();
        encode_coords(&mut buf, &coords);
        let mut r = WireReader::new(&buf);
        assert_eq!(r.read_coords().unwrap(), coords);
        assert!(r.is_empty());
    }

    #[test]
    fn empty_coords_roundtrip() {
        let mut buf = Vec::new();
        encode_coords(&mut buf, &[]);
        assert_eq!(buf, vec![0]);
        let mut r = WireReader::new(&buf);
        assert!(r.read_coords().unwrap().is_empty());
    }

    #[test]
    fn bootstrap_frame_roundtrip() {
        let mut frame = Frame::new(PacketType::Bootstrap);
        frame.destination_key = [7u8; 32];
        frame.source = vec![1, 4, 2];
        frame.payload = b"bootstrap payload".to_vec();
        let decoded = roundtrip(&frame);
        assert_eq!(decoded.ptype, PacketType::Bootstrap);
        assert_eq!(decoded.destination_key, [7u8; 32]);
        assert_eq!(decoded.source, vec![1, 4, 2]);
        assert_eq!(decoded.payload, b"bootstrap payload");
    }

    #[test]
    fn bootstrap_ack_frame_roundtrip() {
        let mut frame = Frame::new(PacketType::BootstrapAck);
        frame.source = vec![9];
        frame.destination = vec![3, 3];
        frame.source_key = [0xAA; 32];
        frame.destination_key = [0xBB; 32];
        frame.payload = vec![1, 2, 3];
        let decoded = roundtrip(&frame);
        assert_eq!(decoded.source, vec![9]);
        assert_eq!(decoded.destination, vec![3, 3]);
        assert_eq!(decoded.source_key, [0xAA; 32]);
        assert_eq!(decoded.destination_key, [0xBB; 32]);
        assert_eq!(decoded.payload, vec![1, 2, 3]);
    }

    #[test]
    fn setup_frame_roundtrip() {
        let mut frame = Frame::new(PacketType::Setup);
        frame.destination = vec![2, 5];
        frame.source_key = [0x11; 32];
        frame.destination_key = [0x22; 32];
        frame.payload = vec![0xFF; 41];
        let decoded = roundtrip(&frame);
        assert_eq!(decoded.destination, vec![2, 5]);
        assert_eq!(decoded.source_key, [0x11; 32]);
        assert_eq!(decoded.destination_key, [0x22; 32]);
        assert_eq!(decoded.payload.len(), 41);
    }

    #[test]
    fn teardown_frame_roundtrip() {
        let mut frame = Frame::new(PacketType::Teardown);
        frame.destination_key = [0x33; 32];
        frame.payload = vec![8; 8];
        let decoded = roundtrip(&frame);
        assert_eq!(decoded.destination_key, [0x33; 32]);
        assert_eq!(decoded.payload, vec![8; 8]);
    }

    #[test]
    fn ping_frame_roundtrips() {
        let mut snek = Frame::new(PacketType::SnekPing);
        snek.source_key = [1; 32];
        snek.destination_key = [2; 32];
        let decoded = roundtrip(&snek);
        assert_eq!(decoded.source_key, [1; 32]);
        assert_eq!(decoded.destination_key, [2; 32]);

        let mut tree = Frame::new(PacketType::TreePing);
        tree.source = vec![1];
        tree.destination = vec![2, 3];
        let decoded = roundtrip(&tree);
        assert_eq!(decoded.source, vec![1]);
        assert_eq!(decoded.destination, vec![2, 3]);
    }

    #[test]
    fn traffic_frame_roundtrip() {
        let mut frame = Frame::new(PacketType::Traffic);
        frame.source_key = [0x44; 32];
        frame.destination_key = [0x55; 32];
        frame.payload = b"hello world".to_vec();
        let decoded = roundtrip(&frame);
        assert_eq!(decoded.source_key, [0x44; 32]);
        assert_eq!(decoded.destination_key, [0x55; 32]);
        assert_eq!(decoded.payload, b"hello world");
    }

    #[test]
    fn decode_unknown_type_fails() {
        assert!(Frame::decode(&[99]).is_err());
    }

    #[test]
    fn decode_empty_content_fails() {
        assert!(matches!(
            Frame::decode(&[]),
            Err(FrameError::PayloadTooShort)
        ));
    }

    #[test]
    fn decode_truncated_keys_fails() {
        // SnekPing needs 64 bytes of keys; give it 10.
        let mut content = vec![PacketType::SnekPing as u8];
        content.extend_from_slice(&[0u8; 10]);
        assert!(Frame::decode(&content).is_err());
    }

    #[test]
    fn path_update_roundtrip() {
        let update = SnakePathUpdate {
            path_id: [9u8; 8],
            root: Root {
                public_key: [0xCD; 32],
                sequence: 300,
            },
        };
        let buf = update.encode_to_vec();
        let decoded = SnakePathUpdate::decode(&buf).unwrap();
        assert_eq!(decoded, update);
    }

    #[test]
    fn path_update_too_short() {
        assert!(matches!(
            SnakePathUpdate::decode(&[0u8; 12]),
            Err(FrameError::PayloadTooShort)
        ));
    }

    #[test]
    fn teardown_payload_roundtrip() {
        let td = SnakeTeardown { path_id: [3u8; 8] };
        let buf = td.encode_to_vec();
        assert_eq!(buf.len(), 8);
        assert_eq!(SnakeTeardown::decode(&buf).unwrap(), td);
        assert!(matches!(
            SnakeTeardown::decode(&buf[..7]),
            Err(FrameError::PayloadTooShort)
        ));
    }
}
