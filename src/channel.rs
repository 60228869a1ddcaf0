use std::io;

use bytes::Bytes;
use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, SimplexStream, WriteHalf,
};
use tracing::{debug, error};

use crate::error::ChannelError;

/// Tag for a frame carrying payload bytes, with more frames to follow.
pub const TAG_DATA: &str = "data";
/// Tag for the final payload frame of a conversation.
///
/// Producing or consuming a frame with this tag latches the endpoint's
/// end-of-stream state.
pub const TAG_DATA_FINAL: &str = "data-final";

/// Upper bound on an encoded frame (tag plus payload).
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Bytes of the tag-length field inside a frame body.
const TAG_LEN_FIELD: usize = 2;

/// A tagged message exchanged over the byte channel.
///
/// The two built-in tags carry stream data; custom tags are permitted for
/// out-of-band exchanges (a handshake before the data phase, say) and do not
/// advance the byte counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub tag: String,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(tag: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            tag: tag.into(),
            payload: payload.into(),
        }
    }

    /// Whether this frame ends the conversation.
    pub fn is_final(&self) -> bool {
        self.tag == TAG_DATA_FINAL
    }

    fn counts_bytes(&self) -> bool {
        self.tag == TAG_DATA || self.tag == TAG_DATA_FINAL
    }
}

/// Create a connected (consumer, producer) endpoint pair over an in-memory
/// unidirectional pipe with the given buffer capacity.
pub fn pair(capacity: usize) -> (PipeReader, PipeWriter) {
    let (r, w) = tokio::io::simplex(capacity);
    (FrameReader::new(r), FrameWriter::new(w))
}

/// Consumer endpoint returned by [`pair`].
pub type PipeReader = FrameReader<ReadHalf<SimplexStream>>;
/// Producer endpoint returned by [`pair`].
pub type PipeWriter = FrameWriter<WriteHalf<SimplexStream>>;

/// Producer endpoint of a framed byte channel.
///
/// Frames are length-prefixed on the wire because the underlying transport is
/// a plain byte stream with no message boundaries:
/// `[u32 frame_len][u16 tag_len][tag][payload]`, prefixes big-endian.
pub struct FrameWriter<W> {
    io: W,
    num_bytes: u64,
    eof: bool,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(io: W) -> Self {
        Self {
            io,
            num_bytes: 0,
            eof: false,
        }
    }

    /// Whether end-of-stream has been sent.
    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// Data bytes sent since construction or the last [`reset_counter`](Self::reset_counter).
    pub fn tell(&self) -> u64 {
        self.num_bytes
    }

    /// Zero the byte counter, e.g. after a handshake phase that precedes the
    /// data phase.
    pub fn reset_counter(&mut self) {
        self.num_bytes = 0;
    }

    /// Transmit one frame. Fails with [`ChannelError::AlreadyClosed`] once
    /// end-of-stream has been sent; sending a [`TAG_DATA_FINAL`] frame
    /// latches it.
    pub async fn send_frame(&mut self, frame: Frame) -> Result<(), ChannelError> {
        if self.eof {
            return Err(ChannelError::AlreadyClosed);
        }
        if frame.tag.len() > u16::MAX as usize
            || TAG_LEN_FIELD + frame.tag.len() + frame.payload.len() > MAX_FRAME_LEN
        {
            return Err(ChannelError::MalformedFrame(format!(
                "frame with tag of {} bytes and payload of {} bytes exceeds the {MAX_FRAME_LEN} byte limit",
                frame.tag.len(),
                frame.payload.len()
            )));
        }
        if let Err(e) = self.write_parts(&frame).await {
            error!(tag = %frame.tag, size = frame.payload.len(), error = %e, "frame send failed");
            return Err(ChannelError::Io(e));
        }
        if frame.is_final() {
            self.eof = true;
        }
        if frame.counts_bytes() {
            self.num_bytes += frame.payload.len() as u64;
        }
        debug!(
            tag = %frame.tag,
            size = frame.payload.len(),
            total = self.num_bytes,
            "frame sent"
        );
        Ok(())
    }

    async fn write_parts(&mut self, frame: &Frame) -> io::Result<()> {
        let frame_len = (TAG_LEN_FIELD + frame.tag.len() + frame.payload.len()) as u32;
        self.io.write_u32(frame_len).await?;
        self.io.write_u16(frame.tag.len() as u16).await?;
        self.io.write_all(frame.tag.as_bytes()).await?;
        self.io.write_all(&frame.payload).await?;
        self.io.flush().await
    }

    /// Send a data frame. Zero-length writes are a no-op returning 0 (stream
    /// writers often emit empty buffers); otherwise returns the byte count
    /// written.
    pub async fn write(&mut self, buf: &[u8]) -> Result<usize, ChannelError> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.send_frame(Frame::new(TAG_DATA, Bytes::copy_from_slice(buf)))
            .await?;
        Ok(buf.len())
    }

    /// Send the final data frame, carrying the given (possibly empty)
    /// payload, and latch end-of-stream.
    pub async fn write_eof(&mut self, buf: &[u8]) -> Result<usize, ChannelError> {
        self.send_frame(Frame::new(TAG_DATA_FINAL, Bytes::copy_from_slice(buf)))
            .await?;
        Ok(buf.len())
    }
}

/// Consumer endpoint of a framed byte channel.
pub struct FrameReader<R> {
    io: R,
    num_bytes: u64,
    eof: bool,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(io: R) -> Self {
        Self {
            io,
            num_bytes: 0,
            eof: false,
        }
    }

    /// Whether end-of-stream has been consumed.
    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// Data bytes received since construction or the last [`reset_counter`](Self::reset_counter).
    pub fn tell(&self) -> u64 {
        self.num_bytes
    }

    /// Zero the byte counter, e.g. after a handshake phase that precedes the
    /// data phase.
    pub fn reset_counter(&mut self) {
        self.num_bytes = 0;
    }

    /// Receive the next frame, waiting for one to arrive.
    ///
    /// A frame that cannot be decoded is [`ChannelError::MalformedFrame`]; a
    /// peer disconnect surfaces as [`ChannelError::PeerClosed`]. Consuming a
    /// [`TAG_DATA_FINAL`] frame latches end-of-stream.
    pub async fn recv_frame(&mut self) -> Result<Frame, ChannelError> {
        let frame = self.read_parts().await?;
        if frame.is_final() {
            self.eof = true;
        }
        if frame.counts_bytes() {
            self.num_bytes += frame.payload.len() as u64;
        }
        debug!(
            tag = %frame.tag,
            size = frame.payload.len(),
            total = self.num_bytes,
            "frame received"
        );
        Ok(frame)
    }

    async fn read_parts(&mut self) -> Result<Frame, ChannelError> {
        let frame_len = match self.io.read_u32().await {
            Ok(n) => n as usize,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(ChannelError::PeerClosed)
            }
            Err(e) => {
                error!(error = %e, "frame header read failed");
                return Err(ChannelError::Io(e));
            }
        };
        if !(TAG_LEN_FIELD..=MAX_FRAME_LEN).contains(&frame_len) {
            return Err(ChannelError::MalformedFrame(format!(
                "declared frame length {frame_len} out of range"
            )));
        }
        let mut body = vec![0u8; frame_len];
        if let Err(e) = self.io.read_exact(&mut body).await {
            return match e.kind() {
                io::ErrorKind::UnexpectedEof => Err(ChannelError::PeerClosed),
                _ => {
                    error!(error = %e, "frame body read failed");
                    Err(ChannelError::Io(e))
                }
            };
        }
        let tag_len = u16::from_be_bytes([body[0], body[1]]) as usize;
        if TAG_LEN_FIELD + tag_len > frame_len {
            return Err(ChannelError::MalformedFrame(format!(
                "tag length {tag_len} exceeds frame length {frame_len}"
            )));
        }
        let tag = match std::str::from_utf8(&body[TAG_LEN_FIELD..TAG_LEN_FIELD + tag_len]) {
            Ok(tag) => tag.to_owned(),
            Err(e) => {
                return Err(ChannelError::MalformedFrame(format!(
                    "tag is not valid UTF-8: {e}"
                )))
            }
        };
        let payload = Bytes::copy_from_slice(&body[TAG_LEN_FIELD + tag_len..]);
        Ok(Frame { tag, payload })
    }

    /// Read the payload of the next data frame.
    ///
    /// The producer frames the stream, so there is no size argument. Once
    /// end-of-stream has been consumed this returns an empty buffer forever;
    /// a peer disconnect while waiting also returns an empty buffer. A frame
    /// with a non-data tag arriving here is [`ChannelError::MalformedFrame`].
    pub async fn read(&mut self) -> Result<Bytes, ChannelError> {
        if self.eof {
            return Ok(Bytes::new());
        }
        match self.recv_frame().await {
            Ok(frame) if frame.counts_bytes() => Ok(frame.payload),
            Ok(frame) => Err(ChannelError::MalformedFrame(format!(
                "expected a data frame but got tag {:?}",
                frame.tag
            ))),
            Err(ChannelError::PeerClosed) => {
                debug!("peer closed while waiting for data");
                Ok(Bytes::new())
            }
            Err(e) => Err(e),
        }
    }
}
