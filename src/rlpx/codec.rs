//! RLPx frame codec
//!
//! Turns the encrypted TCP stream into discrete `(code, payload)` messages
//! and back. Messages larger than the chunk size are split into frames that
//! share a context id and are reassembled on the receiving side.

use super::ecies::Secrets;
use super::mac::{FrameCipher, MAC_LEN};
use bytes::{BufMut, Bytes, BytesMut};
use rlp::{DecoderError, Rlp, RlpStream};
use std::collections::HashMap;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Default payload bytes per frame
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

/// Default bound on a reassembled message
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

const HEADER_LEN: usize = 16;
const MAX_FRAME_SIZE: usize = 0xff_ffff;

/// Frame codec errors
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("{0} MAC mismatch")]
    MacMismatch(&'static str),
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },
    #[error("Unexpected chunk for context {0}")]
    UnexpectedChunk(u16),
    #[error("RLP error: {0}")]
    Rlp(#[from] DecoderError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A message as carried by the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub code: u8,
    pub payload: Bytes,
}

impl RawMessage {
    pub fn new(code: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            code,
            payload: payload.into(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct FrameHeader {
    size: usize,
    context: u16,
    total: Option<usize>,
}

struct Partial {
    total: usize,
    data: BytesMut,
}

/// Encrypting frame codec for one session
pub struct FrameCodec {
    cipher: FrameCipher,
    chunk_size: usize,
    max_message_size: usize,
    next_context: u16,
    header: Option<FrameHeader>,
    partial: HashMap<u16, Partial>,
    /// Sum of the declared totals of open reassemblies
    in_flight: usize,
}

impl FrameCodec {
    pub fn new(secrets: Secrets) -> Self {
        Self::with_limits(secrets, DEFAULT_CHUNK_SIZE, DEFAULT_MAX_MESSAGE_SIZE)
    }

    pub fn with_limits(secrets: Secrets, chunk_size: usize, max_message_size: usize) -> Self {
        Self {
            cipher: FrameCipher::new(secrets),
            chunk_size: chunk_size.clamp(1, MAX_FRAME_SIZE),
            max_message_size,
            next_context: 0,
            header: None,
            partial: HashMap::new(),
            in_flight: 0,
        }
    }

    fn check_size(&self, size: usize) -> Result<(), FrameError> {
        if size > self.max_message_size {
            return Err(FrameError::MessageTooLarge {
                size,
                max: self.max_message_size,
            });
        }
        Ok(())
    }

    fn allocate_context(&mut self) -> u16 {
        self.next_context = self.next_context.wrapping_add(1);
        if self.next_context == 0 {
            self.next_context = 1;
        }
        self.next_context
    }

    fn read_header(&mut self, src: &mut BytesMut) -> Result<FrameHeader, FrameError> {
        let mut header = src.split_to(HEADER_LEN);
        let mac = src.split_to(MAC_LEN);

        self.cipher.ingress_mac.update_header(&header);
        if self.cipher.ingress_mac.digest()[..] != mac[..] {
            return Err(FrameError::MacMismatch("header"));
        }
        self.cipher.decrypt(&mut header);

        let size = (header[0] as usize) << 16 | (header[1] as usize) << 8 | header[2] as usize;
        let data = &header[3..];
        let info = Rlp::new(data).payload_info()?;
        let end = info.header_len + info.value_len;
        if end > data.len() {
            return Err(FrameError::Rlp(DecoderError::RlpIsTooShort));
        }

        let rlp = Rlp::new(&data[..end]);
        let items = rlp.item_count()?;
        let context = if items > 1 { rlp.val_at::<u16>(1)? } else { 0 };
        let total = if items > 2 {
            Some(rlp.val_at::<u32>(2)? as usize)
        } else {
            None
        };

        self.check_size(size)?;
        if let Some(total) = total {
            self.check_size(total)?;
        }

        Ok(FrameHeader {
            size,
            context,
            total,
        })
    }

    fn close_partial(&mut self, context: u16) -> Option<Partial> {
        let partial = self.partial.remove(&context)?;
        self.in_flight -= partial.total;
        Some(partial)
    }

    /// Feed one frame body into reassembly; returns a completed message
    fn assemble(&mut self, header: FrameHeader, body: BytesMut) -> Result<Option<BytesMut>, FrameError> {
        if let Some(total) = header.total {
            if self.partial.contains_key(&header.context) {
                return Err(FrameError::UnexpectedChunk(header.context));
            }
            // Open reassemblies share one budget
            self.check_size(self.in_flight.saturating_add(total))?;
            self.in_flight += total;
            self.partial.insert(
                header.context,
                Partial {
                    total,
                    data: BytesMut::new(),
                },
            );
        } else if header.context == 0 || !self.partial.contains_key(&header.context) {
            if header.context != 0 {
                return Err(FrameError::UnexpectedChunk(header.context));
            }
            self.check_size(body.len())?;
            return Ok(Some(body));
        }

        let context = header.context;
        let (size, total) = match self.partial.get_mut(&context) {
            Some(partial) => {
                partial.data.extend_from_slice(&body);
                (partial.data.len(), partial.total)
            }
            None => return Err(FrameError::UnexpectedChunk(context)),
        };

        if size > total {
            self.close_partial(context);
            return Err(FrameError::MessageTooLarge { size, max: total });
        }
        if size < total {
            return Ok(None);
        }
        Ok(self.close_partial(context).map(|p| p.data))
    }

    fn write_frame(&mut self, header_data: &[u8], body: &[u8], dst: &mut BytesMut) {
        let mut header = [0u8; HEADER_LEN];
        let size = body.len();
        header[0] = (size >> 16) as u8;
        header[1] = (size >> 8) as u8;
        header[2] = size as u8;
        header[3..3 + header_data.len()].copy_from_slice(header_data);

        self.cipher.encrypt(&mut header);
        self.cipher.egress_mac.update_header(&header);
        dst.put_slice(&header);
        dst.put_slice(&self.cipher.egress_mac.digest());

        let mut padded = vec![0u8; padded_len(size)];
        padded[..size].copy_from_slice(body);
        self.cipher.encrypt(&mut padded);
        self.cipher.egress_mac.update_body(&padded);
        dst.put_slice(&padded);
        dst.put_slice(&self.cipher.egress_mac.digest());
    }
}

fn padded_len(size: usize) -> usize {
    size.div_ceil(16) * 16
}

fn header_data(context: Option<u16>, total: Option<usize>) -> Vec<u8> {
    let items = 1 + context.is_some() as usize + total.is_some() as usize;
    let mut stream = RlpStream::new_list(items);
    stream.append(&0u16);
    if let Some(context) = context {
        stream.append(&context);
    }
    if let Some(total) = total {
        stream.append(&(total as u32));
    }
    stream.out().to_vec()
}

impl Encoder<RawMessage> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: RawMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let code = rlp::encode(&(item.code as u16));
        let mut data = Vec::with_capacity(code.len() + item.payload.len());
        data.extend_from_slice(&code);
        data.extend_from_slice(&item.payload);
        self.check_size(data.len())?;

        if data.len() <= self.chunk_size {
            let header = header_data(Some(0), None);
            dst.reserve(HEADER_LEN + MAC_LEN * 2 + padded_len(data.len()));
            self.write_frame(&header, &data, dst);
            return Ok(());
        }

        let context = self.allocate_context();
        for (i, chunk) in data.chunks(self.chunk_size).enumerate() {
            let total = (i == 0).then_some(data.len());
            let header = header_data(Some(context), total);
            dst.reserve(HEADER_LEN + MAC_LEN * 2 + padded_len(chunk.len()));
            self.write_frame(&header, chunk, dst);
        }
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = RawMessage;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let header = match self.header {
                Some(header) => header,
                None => {
                    if src.len() < HEADER_LEN + MAC_LEN {
                        return Ok(None);
                    }
                    let header = self.read_header(src)?;
                    self.header = Some(header);
                    header
                }
            };

            let body_len = padded_len(header.size);
            if src.len() < body_len + MAC_LEN {
                src.reserve(body_len + MAC_LEN - src.len());
                return Ok(None);
            }
            self.header = None;

            let mut body = src.split_to(body_len);
            let mac = src.split_to(MAC_LEN);
            self.cipher.ingress_mac.update_body(&body);
            if self.cipher.ingress_mac.digest()[..] != mac[..] {
                return Err(FrameError::MacMismatch("body"));
            }
            self.cipher.decrypt(&mut body);
            body.truncate(header.size);

            let Some(data) = self.assemble(header, body)? else {
                continue;
            };

            let rlp = Rlp::new(&data);
            let info = rlp.payload_info()?;
            let code_len = info.header_len + info.value_len;
            if code_len > data.len() {
                return Err(FrameError::Rlp(DecoderError::RlpIsTooShort));
            }
            let code: u16 = Rlp::new(&data[..code_len]).as_val()?;
            let code = u8::try_from(code).map_err(|_| DecoderError::RlpIsTooBig)?;

            let mut data = data;
            let payload = data.split_off(code_len).freeze();
            return Ok(Some(RawMessage { code, payload }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use crate::rlpx::ecies::Handshake;

    fn codec_pair(chunk_size: usize, max_message_size: usize) -> (FrameCodec, FrameCodec) {
        codec_pair_with_limits(chunk_size, max_message_size, max_message_size)
    }

    fn codec_pair_with_limits(
        chunk_size: usize,
        sender_max: usize,
        receiver_max: usize,
    ) -> (FrameCodec, FrameCodec) {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let mut initiator = Handshake::initiator(alice, bob.node_id());
        let mut responder = Handshake::responder(bob);

        let auth = initiator.create_auth().unwrap();
        responder.parse_auth(&auth).unwrap();
        let ack = responder.create_ack().unwrap();
        initiator.parse_ack(&ack).unwrap();

        (
            FrameCodec::with_limits(initiator.secrets().unwrap(), chunk_size, sender_max),
            FrameCodec::with_limits(responder.secrets().unwrap(), chunk_size, receiver_max),
        )
    }

    #[test]
    fn test_single_frame_message() {
        let (mut alice, mut bob) = codec_pair(DEFAULT_CHUNK_SIZE, DEFAULT_MAX_MESSAGE_SIZE);
        let message = RawMessage::new(0x10, vec![0xc2, 0x01, 0x02]);

        let mut buf = BytesMut::new();
        alice.encode(message.clone(), &mut buf).unwrap();
        assert_eq!(buf.len() % 16, 0);

        assert_eq!(bob.decode(&mut buf).unwrap(), Some(message));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_both_directions_and_sequence() {
        let (mut alice, mut bob) = codec_pair(DEFAULT_CHUNK_SIZE, DEFAULT_MAX_MESSAGE_SIZE);

        let mut buf = BytesMut::new();
        alice.encode(RawMessage::new(0x02, vec![0xc0]), &mut buf).unwrap();
        alice.encode(RawMessage::new(0x11, vec![0x83, 1, 2, 3]), &mut buf).unwrap();
        assert_eq!(bob.decode(&mut buf).unwrap().map(|m| m.code), Some(0x02));
        assert_eq!(bob.decode(&mut buf).unwrap().map(|m| m.code), Some(0x11));
        assert_eq!(bob.decode(&mut buf).unwrap(), None);

        let mut back = BytesMut::new();
        bob.encode(RawMessage::new(0x03, vec![0xc0]), &mut back).unwrap();
        assert_eq!(alice.decode(&mut back).unwrap().map(|m| m.code), Some(0x03));
    }

    #[test]
    fn test_partial_input_waits() {
        let (mut alice, mut bob) = codec_pair(DEFAULT_CHUNK_SIZE, DEFAULT_MAX_MESSAGE_SIZE);
        let mut encoded = BytesMut::new();
        alice.encode(RawMessage::new(0x10, vec![0x80; 100]), &mut encoded).unwrap();

        let mut buf = BytesMut::new();
        let rest = encoded.split_off(40);
        buf.extend_from_slice(&encoded);
        assert_eq!(bob.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(&rest);
        let message = bob.decode(&mut buf).unwrap().unwrap();
        assert_eq!(message.payload.len(), 100);
    }

    #[test]
    fn test_chunked_message_reassembled() {
        let (mut alice, mut bob) = codec_pair(64, DEFAULT_MAX_MESSAGE_SIZE);
        let payload: Vec<u8> = (0..300u32).map(|i| i as u8).collect();
        let message = RawMessage::new(0x15, payload);

        let mut buf = BytesMut::new();
        alice.encode(message.clone(), &mut buf).unwrap();

        assert_eq!(bob.decode(&mut buf).unwrap(), Some(message));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_oversized_message_rejected() {
        let (mut alice, _) = codec_pair(64, 128);
        let mut buf = BytesMut::new();
        let result = alice.encode(RawMessage::new(0x10, vec![0u8; 512]), &mut buf);
        assert!(matches!(result, Err(FrameError::MessageTooLarge { .. })));
    }

    #[test]
    fn test_declared_total_above_limit_rejected() {
        // Receiver limit below what the sender declares
        let (mut alice, mut bob) = codec_pair_with_limits(64, DEFAULT_MAX_MESSAGE_SIZE, 128);
        let mut buf = BytesMut::new();
        alice.encode(RawMessage::new(0x10, vec![0u8; 512]), &mut buf).unwrap();
        assert!(matches!(
            bob.decode(&mut buf),
            Err(FrameError::MessageTooLarge { size: 513, max: 128 })
        ));
    }

    #[test]
    fn test_oversized_header_rejected_before_body() {
        let (mut alice, mut bob) =
            codec_pair_with_limits(DEFAULT_CHUNK_SIZE, DEFAULT_MAX_MESSAGE_SIZE, 128);
        let mut encoded = BytesMut::new();
        alice.encode(RawMessage::new(0x10, vec![0u8; 4096]), &mut encoded).unwrap();

        // Only the header and its MAC have arrived
        let mut buf = BytesMut::from(&encoded[..HEADER_LEN + MAC_LEN]);
        assert!(matches!(
            bob.decode(&mut buf),
            Err(FrameError::MessageTooLarge { size: 4097, max: 128 })
        ));
        assert!(buf.capacity() < 4096);
    }

    #[test]
    fn test_open_reassemblies_share_limit() {
        let (mut alice, mut bob) = codec_pair(64, 128);
        let mut buf = BytesMut::new();
        for context in 1..=3u16 {
            alice.write_frame(&header_data(Some(context), Some(100)), &[0u8; 64], &mut buf);
        }

        assert!(matches!(
            bob.decode(&mut buf),
            Err(FrameError::MessageTooLarge { size: 200, max: 128 })
        ));
        assert_eq!(bob.partial.len(), 1);
    }

    #[test]
    fn test_completed_reassembly_frees_budget() {
        let (mut alice, mut bob) = codec_pair(64, 400);
        let mut buf = BytesMut::new();
        alice.encode(RawMessage::new(0x15, vec![0x80; 300]), &mut buf).unwrap();
        alice.encode(RawMessage::new(0x16, vec![0x80; 300]), &mut buf).unwrap();

        assert_eq!(bob.decode(&mut buf).unwrap().map(|m| m.code), Some(0x15));
        assert_eq!(bob.decode(&mut buf).unwrap().map(|m| m.code), Some(0x16));
        assert_eq!(bob.in_flight, 0);
    }

    #[test]
    fn test_tampered_frame_rejected() {
        let (mut alice, mut bob) = codec_pair(DEFAULT_CHUNK_SIZE, DEFAULT_MAX_MESSAGE_SIZE);
        let mut buf = BytesMut::new();
        alice.encode(RawMessage::new(0x10, vec![0x01]), &mut buf).unwrap();
        buf[HEADER_LEN + MAC_LEN] ^= 0xff;

        assert!(matches!(
            bob.decode(&mut buf),
            Err(FrameError::MacMismatch("body"))
        ));
    }

    #[test]
    fn test_tampered_header_rejected() {
        let (mut alice, mut bob) = codec_pair(DEFAULT_CHUNK_SIZE, DEFAULT_MAX_MESSAGE_SIZE);
        let mut buf = BytesMut::new();
        alice.encode(RawMessage::new(0x10, vec![0x01]), &mut buf).unwrap();
        buf[0] ^= 0x01;

        assert!(matches!(
            bob.decode(&mut buf),
            Err(FrameError::MacMismatch("header"))
        ));
    }
}
