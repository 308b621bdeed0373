// The MongoDB wire protocol: every frame is a 16-byte header of four
// little-endian int32s followed by an opcode-specific body. This crate
// parses and serializes the frames; command semantics live with the server.

mod legacy;
mod msg;

pub use legacy::{
    OpDelete, OpGetMore, OpInsert, OpKillCursors, OpQuery, OpReply, OpUpdate,
    REPLY_CURSOR_NOT_FOUND, REPLY_QUERY_FAILURE,
};
pub use msg::{
    OpMsg, Section, FLAG_CHECKSUM_PRESENT, FLAG_EXHAUST_ALLOWED, FLAG_MORE_TO_COME,
};

/// Largest frame the server will read, matching the advertised
/// `maxMessageSizeBytes`.
pub const MAX_MESSAGE_LEN: usize = 48 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("frame of {0} bytes is shorter than a message header")]
    ShortFrame(usize),
    #[error("frame body truncated at offset {0}")]
    Truncated(usize),
    #[error("unknown opcode {0}")]
    UnknownOpCode(i32),
    #[error("unknown OP_MSG section kind {0}")]
    UnknownSectionKind(u8),
    #[error("OP_MSG carries no body section")]
    MissingBody,
    #[error("invalid section size {0}")]
    InvalidSectionSize(i32),
    #[error("cstring is unterminated or not UTF-8")]
    BadCString,
    #[error(transparent)]
    Document(#[from] bson::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum OpCode {
    Reply = 1,
    Update = 2001,
    Insert = 2002,
    Query = 2004,
    GetMore = 2005,
    Delete = 2006,
    KillCursors = 2007,
    Compressed = 2012,
    Msg = 2013,
}

impl TryFrom<i32> for OpCode {
    type Error = Error;

    fn try_from(code: i32) -> Result<Self> {
        Ok(match code {
            1 => OpCode::Reply,
            2001 => OpCode::Update,
            2002 => OpCode::Insert,
            2004 => OpCode::Query,
            2005 => OpCode::GetMore,
            2006 => OpCode::Delete,
            2007 => OpCode::KillCursors,
            2012 => OpCode::Compressed,
            2013 => OpCode::Msg,
            other => return Err(Error::UnknownOpCode(other)),
        })
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MessageHeader {
    pub message_length: i32,
    pub request_id: i32,
    pub response_to: i32,
    pub op_code: i32,
}

impl MessageHeader {
    pub const LEN: usize = 16;

    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::LEN {
            return Err(Error::ShortFrame(buf.len()));
        }
        let int32 = |at: usize| i32::from_le_bytes(buf[at..at + 4].try_into().unwrap());
        Ok(Self {
            message_length: int32(0),
            request_id: int32(4),
            response_to: int32(8),
            op_code: int32(12),
        })
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.message_length.to_le_bytes());
        out.extend_from_slice(&self.request_id.to_le_bytes());
        out.extend_from_slice(&self.response_to.to_le_bytes());
        out.extend_from_slice(&self.op_code.to_le_bytes());
    }
}

/// One parsed request frame.
#[derive(Clone, Debug)]
pub enum Message {
    Msg(OpMsg),
    Query(OpQuery),
    Insert(OpInsert),
    Update(OpUpdate),
    Delete(OpDelete),
    GetMore(OpGetMore),
    KillCursors(OpKillCursors),
    /// Recognized but not decompressed; the original opcode and payload are
    /// retained for diagnostics.
    Compressed { original_op_code: i32, payload: Vec<u8> },
}

impl Message {
    /// Parse one complete frame, header included.
    pub fn parse(frame: &[u8]) -> Result<(MessageHeader, Message)> {
        let header = MessageHeader::parse(frame)?;
        let body = &frame[MessageHeader::LEN..];

        let message = match OpCode::try_from(header.op_code)? {
            OpCode::Msg => Message::Msg(OpMsg::parse(body)?),
            OpCode::Query => Message::Query(OpQuery::parse(body)?),
            OpCode::Insert => Message::Insert(OpInsert::parse(body)?),
            OpCode::Update => Message::Update(legacy::OpUpdate::parse(body)?),
            OpCode::Delete => Message::Delete(OpDelete::parse(body)?),
            OpCode::GetMore => Message::GetMore(OpGetMore::parse(body)?),
            OpCode::KillCursors => Message::KillCursors(OpKillCursors::parse(body)?),
            OpCode::Compressed => {
                if body.len() < 9 {
                    return Err(Error::Truncated(frame.len()));
                }
                Message::Compressed {
                    original_op_code: i32::from_le_bytes(body[0..4].try_into().unwrap()),
                    payload: body[4..].to_vec(),
                }
            }
            OpCode::Reply => return Err(Error::UnknownOpCode(header.op_code)),
        };
        Ok((header, message))
    }
}

/// The length-delimited codec which frames the TCP stream: a little-endian
/// u32 length prefix that counts itself, yielding whole messages
/// (header included) to the session loop.
pub fn codec() -> tokio_util::codec::LengthDelimitedCodec {
    tokio_util::codec::LengthDelimitedCodec::builder()
        .little_endian()
        .length_field_length(4)
        .length_adjustment(-4)
        .num_skip(0)
        .max_frame_length(MAX_MESSAGE_LEN)
        .new_codec()
}

// Shared body-parsing helpers.
pub(crate) fn read_cstring(buf: &[u8], at: &mut usize) -> Result<String> {
    let rest = &buf[*at..];
    let nul = rest.iter().position(|b| *b == 0).ok_or(Error::BadCString)?;
    let s = std::str::from_utf8(&rest[..nul])
        .map_err(|_| Error::BadCString)?
        .to_owned();
    *at += nul + 1;
    Ok(s)
}

pub(crate) fn read_i32(buf: &[u8], at: &mut usize) -> Result<i32> {
    if buf.len() < *at + 4 {
        return Err(Error::Truncated(*at));
    }
    let v = i32::from_le_bytes(buf[*at..*at + 4].try_into().unwrap());
    *at += 4;
    Ok(v)
}

pub(crate) fn read_i64(buf: &[u8], at: &mut usize) -> Result<i64> {
    if buf.len() < *at + 8 {
        return Err(Error::Truncated(*at));
    }
    let v = i64::from_le_bytes(buf[*at..*at + 8].try_into().unwrap());
    *at += 8;
    Ok(v)
}

// Decode one document from `buf` at `*at`, advancing past it.
pub(crate) fn read_document(buf: &[u8], at: &mut usize) -> Result<bson::Document> {
    let mut decoder = bson::Decoder::new(&buf[*at..], Default::default());
    let doc = decoder.read_document()?;
    *at += decoder.position();
    Ok(doc)
}
