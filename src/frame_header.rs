use bytes::{Buf, BufMut, BytesMut};

/// Header at the start of every data frame, stored verbatim in the term buffer together
///  with the payload. All numbers in network byte order (BE):
///
/// ```ascii
///  0: frame length (u32) - total bytes this frame occupies in the term, header included.
///      A valid frame has a non-zero length; a zero length marks unfilled buffer space,
///      which is what the term cleaning handshake guarantees for not-yet-written regions
///  4: session id (u32)
///  8: stream id (u32)
/// 12: term id (u32)
/// 16: term offset (u32) - must equal the offset the frame is inserted at
/// 20: payload ...
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DataFrameHeader {
    pub frame_length: u32,
    pub session_id: u32,
    pub stream_id: u32,
    pub term_id: u32,
    pub term_offset: u32,
}

impl DataFrameHeader {
    pub const SERIALIZED_LEN: usize = 5 * size_of::<u32>();

    /// offset of the frame length field inside a serialized frame - the rebuilder's tail
    ///  scan reads this directly from the term buffer
    pub const FRAME_LENGTH_OFFSET: usize = 0;

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32(self.frame_length);
        buf.put_u32(self.session_id);
        buf.put_u32(self.stream_id);
        buf.put_u32(self.term_id);
        buf.put_u32(self.term_offset);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<DataFrameHeader> {
        let frame_length = buf.try_get_u32()?;
        let session_id = buf.try_get_u32()?;
        let stream_id = buf.try_get_u32()?;
        let term_id = buf.try_get_u32()?;
        let term_offset = buf.try_get_u32()?;

        Ok(DataFrameHeader {
            frame_length,
            session_id,
            stream_id,
            term_id,
            term_offset,
        })
    }
}
