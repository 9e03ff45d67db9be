//! RTMP chunk stream reassembly.
//!
//! Messages are interleaved on the wire as chunks grouped by chunk stream id
//! (CSID). The reader keeps one decoding state per CSID and returns a
//! [`Message`] whenever one completes; `SetChunkSize` messages are applied to
//! the receive chunk size in-line and still handed to the caller.

use std::collections::HashMap;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::core::error::RelayError;
use crate::rtmp::{DEFAULT_CHUNK_SIZE, TYPE_AMF3_COMMAND, TYPE_SET_CHUNK_SIZE};

/// Chunk payload size used for messages the relay itself sends, announced to
/// the peer with a SetChunkSize during the command sequence.
pub const TX_CHUNK_SIZE: usize = 4096;

/// Fully resolved header of an RTMP message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkHeader {
    pub fmt: u8,
    pub csid: u32,
    /// Absolute timestamp, reconstructed across fmt 1-3 deltas.
    pub timestamp: u32,
    pub length: u32,
    pub type_id: u8,
    pub stream_id: u32,
    /// Last delta seen on this chunk stream, inherited by fmt-3 chunks that
    /// start a new message.
    pub time_delta: u32,
}

/// A complete RTMP message: resolved header plus reassembled payload.
#[derive(Debug, Clone)]
pub struct Message {
    pub header: ChunkHeader,
    pub payload: Bytes,
}

/// A message still being assembled from chunks.
#[derive(Debug)]
struct Partial {
    header: ChunkHeader,
    payload: BytesMut,
    bytes_read: usize,
}

#[derive(Debug, Default)]
struct StreamState {
    last_header: ChunkHeader,
    partial: Option<Partial>,
}

/// Stateful chunk stream reader over any async byte source.
pub struct ChunkStream<R> {
    reader: R,
    rx_chunk_size: u32,
    streams: HashMap<u32, StreamState>,
}

impl<R: AsyncRead + Unpin> ChunkStream<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            rx_chunk_size: DEFAULT_CHUNK_SIZE,
            streams: HashMap::new(),
        }
    }

    /// Current receive chunk size (updated by SetChunkSize interception).
    pub fn rx_chunk_size(&self) -> u32 {
        self.rx_chunk_size
    }

    pub fn into_inner(self) -> R {
        self.reader
    }

    /// Read chunks until the next full message completes.
    ///
    /// SetChunkSize messages update the receive chunk size when the value is
    /// in (0, 2^31); out-of-range values are ignored. Either way the message
    /// is returned so the caller can forward or drop it.
    pub async fn read_message(&mut self) -> Result<Message, RelayError> {
        loop {
            let Some(msg) = self.read_chunk().await? else {
                continue;
            };

            if msg.header.type_id == TYPE_SET_CHUNK_SIZE && msg.payload.len() >= 4 {
                let new_size = u32::from_be_bytes([
                    msg.payload[0],
                    msg.payload[1],
                    msg.payload[2],
                    msg.payload[3],
                ]);
                if new_size > 0 && new_size < 0x7FFF_FFFF {
                    self.rx_chunk_size = new_size;
                }
            }

            return Ok(msg);
        }
    }

    /// Read one chunk; returns a message when it completed one.
    async fn read_chunk(&mut self) -> Result<Option<Message>, RelayError> {
        let b0 = self.reader.read_u8().await?;
        let fmt = (b0 >> 6) & 0x03;
        let mut csid = u32::from(b0 & 0x3f);

        if csid == 0 {
            csid = 64 + u32::from(self.reader.read_u8().await?);
        } else if csid == 1 {
            let mut b = [0u8; 2];
            self.reader.read_exact(&mut b).await?;
            csid = 64 + u32::from(b[0]) + u32::from(b[1]) * 256;
        }

        let (last_header, partial) = {
            let state = self.streams.entry(csid).or_default();
            (state.last_header, state.partial.take())
        };

        let mut header = last_header;
        header.fmt = fmt;
        header.csid = csid;

        match fmt {
            0 => {
                let mut buf = [0u8; 11];
                self.reader.read_exact(&mut buf).await?;
                header.timestamp = be_u24(&buf[0..3]);
                header.length = be_u24(&buf[3..6]);
                header.type_id = buf[6];
                header.stream_id = u32::from_le_bytes([buf[7], buf[8], buf[9], buf[10]]);
                header.time_delta = 0;
            }
            1 => {
                let mut buf = [0u8; 7];
                self.reader.read_exact(&mut buf).await?;
                header.time_delta = be_u24(&buf[0..3]);
                header.length = be_u24(&buf[3..6]);
                header.type_id = buf[6];
                header.timestamp = last_header.timestamp.wrapping_add(header.time_delta);
            }
            2 => {
                let mut buf = [0u8; 3];
                self.reader.read_exact(&mut buf).await?;
                header.time_delta = be_u24(&buf[0..3]);
                header.timestamp = last_header.timestamp.wrapping_add(header.time_delta);
            }
            3 => {
                // Continuation of an in-flight message keeps its fixed
                // header; otherwise a new message starts with the previous
                // header and the retained delta. A fmt-3 chunk with no prior
                // state on this CSID proceeds with a zeroed header.
                if let Some(p) = &partial {
                    header = p.header;
                } else {
                    header.time_delta = last_header.time_delta;
                    header.timestamp = last_header.timestamp.wrapping_add(last_header.time_delta);
                }
            }
            _ => unreachable!("fmt is two bits"),
        }

        // An 0xFFFFFF timestamp field is a sentinel for a 4-byte extended
        // timestamp: absolute for fmt 0, delta for fmt 1/2.
        let ts_field = if fmt == 1 || fmt == 2 {
            header.time_delta
        } else {
            header.timestamp
        };
        if ts_field >= 0xFF_FFFF {
            let mut b = [0u8; 4];
            self.reader.read_exact(&mut b).await?;
            let ext = u32::from_be_bytes(b);
            if fmt == 0 {
                header.timestamp = ext;
            } else {
                header.time_delta = ext;
                header.timestamp = last_header.timestamp.wrapping_add(ext);
            }
        }

        let mut msg = match partial {
            Some(p) => p,
            None => {
                let mut payload = BytesMut::with_capacity(header.length as usize);
                payload.resize(header.length as usize, 0);
                Partial {
                    header,
                    payload,
                    bytes_read: 0,
                }
            }
        };

        let remaining = msg.header.length as usize - msg.bytes_read;
        let to_read = remaining.min(self.rx_chunk_size as usize);
        self.reader
            .read_exact(&mut msg.payload[msg.bytes_read..msg.bytes_read + to_read])
            .await?;
        msg.bytes_read += to_read;

        let state = self.streams.entry(csid).or_default();
        state.last_header = header;

        if msg.bytes_read >= msg.header.length as usize {
            Ok(Some(Message {
                header: msg.header,
                payload: msg.payload.freeze(),
            }))
        } else {
            state.partial = Some(msg);
            Ok(None)
        }
    }
}

fn be_u24(b: &[u8]) -> u32 {
    u32::from(b[0]) << 16 | u32::from(b[1]) << 8 | u32::from(b[2])
}

// ---------------------------------------------------------------------------
// Sending
// ---------------------------------------------------------------------------

/// Frame and send one message: fmt-0 header (CSID 3 for AMF commands, CSID 2
/// for protocol control), timestamp 0, message stream id 0, payload rechunked
/// at [`TX_CHUNK_SIZE`] with `0xC0 | csid` continuation bytes.
pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    type_id: u8,
    payload: &[u8],
) -> std::io::Result<()> {
    let csid: u8 = if type_id < TYPE_AMF3_COMMAND { 2 } else { 3 };

    let mut header = [0u8; 12];
    header[0] = csid & 0x3f;
    let len = payload.len() as u32;
    header[4] = (len >> 16) as u8;
    header[5] = (len >> 8) as u8;
    header[6] = len as u8;
    header[7] = type_id;
    writer.write_all(&header).await?;

    let mut written = 0;
    while written < payload.len() {
        let end = (written + TX_CHUNK_SIZE).min(payload.len());
        if written > 0 {
            writer.write_all(&[0xC0 | csid]).await?;
        }
        writer.write_all(&payload[written..end]).await?;
        written = end;
    }

    Ok(())
}
