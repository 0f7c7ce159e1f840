//! # Framed Message Codec
//!
//! Sits between raw sockets and the dispatcher. The writer turns logical
//! application messages into wire frames, splitting anything larger than
//! the send buffer into a first/middle/last segment chain; the decoder
//! parses headers, services the control sub-protocol inline and
//! reassembles segment chains so the application handler sees each logical
//! message exactly once.
//!
//! ## Writer mechanics
//!
//! `start_message` emits a header with a zero payload-size placeholder and
//! records two positions: the message start (so an in-progress message can
//! be restarted after a flush boundary) and the payload-size offset (so
//! `end_message` can back-patch the real size). Oversized messages are
//! re-framed into segments at `end_message`, every segment carrying the
//! original command byte.

use tracing::trace;

use crate::error::{ClientError, Result};
use crate::wire::{ctrl, ByteBuf, ByteOrder, Header, SegmentPos, HEADER_LEN};

/// Builds outgoing wire frames for one connection.
///
/// All writes go through an exclusive borrow handed to one sender at a
/// time, which is what guarantees FIFO framing across contending senders.
#[derive(Debug)]
pub struct MessageWriter {
    out: ByteBuf,
    /// Per-frame payload capacity, derived from the send buffer size.
    max_payload: usize,
    /// Start of the in-progress message (header included).
    last_message_start: usize,
    /// Absolute offset of the in-progress payload-size field.
    payload_size_offset: usize,
    in_progress: Option<u8>,
}

impl MessageWriter {
    pub fn new(send_buffer_size: usize) -> Self {
        MessageWriter {
            out: ByteBuf::new(ByteOrder::Little),
            max_payload: send_buffer_size.saturating_sub(HEADER_LEN).max(1),
            last_message_start: 0,
            payload_size_offset: 0,
            in_progress: None,
        }
    }

    /// Begin an application message. Fails if a message is already open.
    pub fn start_message(&mut self, command: u8) -> Result<()> {
        if self.in_progress.is_some() {
            return Err(ClientError::UsageError(
                "message already in progress".into(),
            ));
        }
        self.last_message_start = self.out.len();
        self.out
            .put_slice(&Header::application(command, SegmentPos::None, 0).encode());
        self.payload_size_offset = self.out.len() - 4;
        self.in_progress = Some(command);
        Ok(())
    }

    /// Payload buffer of the in-progress message.
    pub fn payload(&mut self) -> &mut ByteBuf {
        &mut self.out
    }

    /// Pad so the next payload write lands on an `alignment`-byte boundary
    /// relative to the start of the current message payload.
    pub fn align(&mut self, alignment: usize) {
        let base = self.last_message_start + HEADER_LEN;
        while (self.out.len() - base) % alignment != 0 {
            self.out.put_u8(0);
        }
    }

    /// Abandon the in-progress message and rewind to its start.
    pub fn restart_message(&mut self) {
        if self.in_progress.is_some() {
            self.out.truncate(self.last_message_start);
            self.in_progress = None;
        }
    }

    /// Complete the in-progress message: back-patch the payload size, or
    /// re-frame into a segment chain when the payload exceeds one frame.
    pub fn end_message(&mut self) -> Result<()> {
        let command = self.in_progress.take().ok_or_else(|| {
            ClientError::UsageError("end_message without start_message".into())
        })?;
        let payload_start = self.last_message_start + HEADER_LEN;
        let payload_len = self.out.len() - payload_start;

        if payload_len <= self.max_payload {
            self.out
                .put_u32_at(self.payload_size_offset, payload_len as u32);
            return Ok(());
        }

        // Oversized: pull the body back out and re-frame it.
        let body = self.out.as_slice()[payload_start..].to_vec();
        self.out.truncate(self.last_message_start);

        let mut chunks = body.chunks(self.max_payload).peekable();
        let mut first = true;
        while let Some(chunk) = chunks.next() {
            let segment = match (first, chunks.peek().is_some()) {
                (true, true) => SegmentPos::First,
                (true, false) => SegmentPos::None,
                (false, true) => SegmentPos::Middle,
                (false, false) => SegmentPos::Last,
            };
            self.out
                .put_slice(&Header::application(command, segment, chunk.len() as u32).encode());
            self.out.put_slice(chunk);
            first = false;
        }
        Ok(())
    }

    /// Emit a zero-payload control frame; the size field carries the
    /// inline data word.
    pub fn put_control(&mut self, command: u8, data: u32) -> Result<()> {
        if self.in_progress.is_some() {
            return Err(ClientError::UsageError(
                "control message inside application message".into(),
            ));
        }
        self.out.put_slice(&Header::control(command, data).encode());
        Ok(())
    }

    /// Drain completed frames for the socket write.  An in-progress
    /// message is never drained; it stays buffered until `end_message`.
    pub fn take_wire(&mut self) -> Vec<u8> {
        if self.in_progress.is_some() {
            let keep = self.out.as_slice()[self.last_message_start..].to_vec();
            let mut done = std::mem::replace(&mut self.out, ByteBuf::new(ByteOrder::Little));
            done.truncate(self.last_message_start);
            self.out.put_slice(&keep);
            self.payload_size_offset -= self.last_message_start;
            self.last_message_start = 0;
            done.into_vec()
        } else {
            self.last_message_start = 0;
            std::mem::replace(&mut self.out, ByteBuf::new(ByteOrder::Little)).into_vec()
        }
    }

    pub fn pending_bytes(&self) -> usize {
        self.out.len()
    }
}

/// One logical message delivered by the decoder.
#[derive(Debug)]
pub enum DecodedMessage {
    /// A complete application message (segment chains already joined).
    Application {
        version: u8,
        command: u8,
        from_server: bool,
        payload: ByteBuf,
    },
    /// Control echo; any payload-free liveness signal.
    Echo,
    /// Control set-byte-order: subsequent application payloads decode in
    /// this order.
    ByteOrderChanged(ByteOrder),
}

struct SegmentChain {
    version: u8,
    command: u8,
    from_server: bool,
    payload: Vec<u8>,
}

/// Incremental frame parser for one connection.
///
/// Push raw socket bytes in with [`MessageDecoder::push`], then drain
/// logical messages with [`MessageDecoder::next`]. All parse failures are
/// `InvalidDataStream`; the transport reacts by closing the connection.
pub struct MessageDecoder {
    input: Vec<u8>,
    offset: usize,
    app_order: ByteOrder,
    chain: Option<SegmentChain>,
    max_payload: usize,
}

impl MessageDecoder {
    pub fn new(max_payload: usize) -> Self {
        MessageDecoder {
            input: Vec::new(),
            offset: 0,
            app_order: ByteOrder::Little,
            chain: None,
            max_payload,
        }
    }

    /// Byte order currently applied to application payloads.
    pub fn app_order(&self) -> ByteOrder {
        self.app_order
    }

    pub fn push(&mut self, bytes: &[u8]) {
        // Compact consumed bytes before growing.
        if self.offset > 0 {
            self.input.drain(..self.offset);
            self.offset = 0;
        }
        self.input.extend_from_slice(bytes);
    }

    fn available(&self) -> usize {
        self.input.len() - self.offset
    }

    /// Parse the next logical message, or `None` when more bytes are
    /// needed.
    pub fn next(&mut self) -> Result<Option<DecodedMessage>> {
        loop {
            if self.available() < HEADER_LEN {
                return Ok(None);
            }
            let mut raw = [0u8; HEADER_LEN];
            raw.copy_from_slice(&self.input[self.offset..self.offset + HEADER_LEN]);
            let header = Header::decode(&raw)?;

            if header.control {
                self.offset += HEADER_LEN;
                match header.command {
                    ctrl::SET_BYTE_ORDER => {
                        self.app_order = header.order;
                        return Ok(Some(DecodedMessage::ByteOrderChanged(header.order)));
                    }
                    ctrl::ECHO => return Ok(Some(DecodedMessage::Echo)),
                    other => {
                        trace!(command = other, "ignoring unknown control command");
                        continue;
                    }
                }
            }

            let payload_len = header.payload_size as usize;
            if payload_len > self.max_payload {
                return Err(ClientError::bad_stream(format!(
                    "payload of {payload_len} bytes exceeds the {} byte receive cap",
                    self.max_payload
                )));
            }
            if self.available() < HEADER_LEN + payload_len {
                return Ok(None);
            }
            self.offset += HEADER_LEN;
            let payload = &self.input[self.offset..self.offset + payload_len];
            self.offset += payload_len;

            match header.segment {
                SegmentPos::None => {
                    if self.chain.is_some() {
                        return Err(ClientError::bad_stream(
                            "unsegmented message inside a segment chain",
                        ));
                    }
                    return Ok(Some(DecodedMessage::Application {
                        version: header.version,
                        command: header.command,
                        from_server: header.from_server,
                        payload: ByteBuf::from_vec(payload.to_vec(), self.app_order),
                    }));
                }
                SegmentPos::First => {
                    if self.chain.is_some() {
                        return Err(ClientError::bad_stream("nested segment chain"));
                    }
                    self.chain = Some(SegmentChain {
                        version: header.version,
                        command: header.command,
                        from_server: header.from_server,
                        payload: payload.to_vec(),
                    });
                }
                SegmentPos::Middle | SegmentPos::Last => {
                    let chain = self.chain.as_mut().ok_or_else(|| {
                        ClientError::bad_stream("segment continuation without a first segment")
                    })?;
                    if chain.command != header.command {
                        return Err(ClientError::bad_stream(
                            "segment chain command byte changed mid-message",
                        ));
                    }
                    chain.payload.extend_from_slice(payload);
                    if header.segment == SegmentPos::Last {
                        let chain = self.chain.take().expect("chain present");
                        return Ok(Some(DecodedMessage::Application {
                            version: chain.version,
                            command: chain.command,
                            from_server: chain.from_server,
                            payload: ByteBuf::from_vec(chain.payload, self.app_order),
                        }));
                    }
                }
            }
        }
    }
}
