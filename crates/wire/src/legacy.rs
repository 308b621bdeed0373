// Legacy opcodes predating OP_MSG. Old drivers still open with OP_QUERY
// during the handshake, and the fire-and-forget CRUD opcodes carry no
// reply at all.

use super::{read_cstring, read_document, read_i32, read_i64, Error, MessageHeader, OpCode, Result};
use bson::Document;

pub const REPLY_CURSOR_NOT_FOUND: u32 = 0x1;
pub const REPLY_QUERY_FAILURE: u32 = 0x2;

#[derive(Clone, Debug)]
pub struct OpQuery {
    pub flags: u32,
    pub full_collection_name: String,
    pub number_to_skip: i32,
    pub number_to_return: i32,
    pub query: Document,
    pub return_fields: Option<Document>,
}

impl OpQuery {
    pub fn parse(body: &[u8]) -> Result<Self> {
        let mut at = 0;
        let flags = read_i32(body, &mut at)? as u32;
        let full_collection_name = read_cstring(body, &mut at)?;
        let number_to_skip = read_i32(body, &mut at)?;
        let number_to_return = read_i32(body, &mut at)?;
        let query = read_document(body, &mut at)?;
        let return_fields = if at < body.len() {
            Some(read_document(body, &mut at)?)
        } else {
            None
        };
        Ok(Self {
            flags,
            full_collection_name,
            number_to_skip,
            number_to_return,
            query,
            return_fields,
        })
    }
}

#[derive(Clone, Debug)]
pub struct OpInsert {
    pub flags: u32,
    pub full_collection_name: String,
    pub documents: Vec<Document>,
}

impl OpInsert {
    pub fn parse(body: &[u8]) -> Result<Self> {
        let mut at = 0;
        let flags = read_i32(body, &mut at)? as u32;
        let full_collection_name = read_cstring(body, &mut at)?;
        let mut documents = Vec::new();
        while at < body.len() {
            documents.push(read_document(body, &mut at)?);
        }
        Ok(Self {
            flags,
            full_collection_name,
            documents,
        })
    }
}

#[derive(Clone, Debug)]
pub struct OpUpdate {
    pub full_collection_name: String,
    pub flags: u32,
    pub selector: Document,
    pub update: Document,
}

impl OpUpdate {
    pub fn parse(body: &[u8]) -> Result<Self> {
        let mut at = 0;
        let _zero = read_i32(body, &mut at)?;
        let full_collection_name = read_cstring(body, &mut at)?;
        let flags = read_i32(body, &mut at)? as u32;
        let selector = read_document(body, &mut at)?;
        let update = read_document(body, &mut at)?;
        Ok(Self {
            full_collection_name,
            flags,
            selector,
            update,
        })
    }

    pub fn is_multi(&self) -> bool {
        self.flags & 0x2 != 0
    }

    pub fn is_upsert(&self) -> bool {
        self.flags & 0x1 != 0
    }
}

#[derive(Clone, Debug)]
pub struct OpDelete {
    pub full_collection_name: String,
    pub flags: u32,
    pub selector: Document,
}

impl OpDelete {
    pub fn parse(body: &[u8]) -> Result<Self> {
        let mut at = 0;
        let _zero = read_i32(body, &mut at)?;
        let full_collection_name = read_cstring(body, &mut at)?;
        let flags = read_i32(body, &mut at)? as u32;
        let selector = read_document(body, &mut at)?;
        Ok(Self {
            full_collection_name,
            flags,
            selector,
        })
    }

    /// SINGLE_REMOVE limits the delete to one document.
    pub fn single_remove(&self) -> bool {
        self.flags & 0x1 != 0
    }
}

#[derive(Clone, Debug)]
pub struct OpGetMore {
    pub full_collection_name: String,
    pub number_to_return: i32,
    pub cursor_id: i64,
}

impl OpGetMore {
    pub fn parse(body: &[u8]) -> Result<Self> {
        let mut at = 0;
        let _zero = read_i32(body, &mut at)?;
        let full_collection_name = read_cstring(body, &mut at)?;
        let number_to_return = read_i32(body, &mut at)?;
        let cursor_id = read_i64(body, &mut at)?;
        Ok(Self {
            full_collection_name,
            number_to_return,
            cursor_id,
        })
    }
}

#[derive(Clone, Debug)]
pub struct OpKillCursors {
    pub cursor_ids: Vec<i64>,
}

impl OpKillCursors {
    pub fn parse(body: &[u8]) -> Result<Self> {
        let mut at = 0;
        let _zero = read_i32(body, &mut at)?;
        let count = read_i32(body, &mut at)?;
        if count < 0 {
            return Err(Error::Truncated(at));
        }
        let mut cursor_ids = Vec::with_capacity(count as usize);
        for _ in 0..count {
            cursor_ids.push(read_i64(body, &mut at)?);
        }
        Ok(Self { cursor_ids })
    }
}

/// OP_REPLY encoder for the legacy request/response path.
#[derive(Clone, Debug)]
pub struct OpReply {
    pub response_flags: u32,
    pub cursor_id: i64,
    pub starting_from: i32,
    pub documents: Vec<Document>,
}

impl OpReply {
    pub fn new(documents: Vec<Document>) -> Self {
        Self {
            response_flags: 0,
            cursor_id: 0,
            starting_from: 0,
            documents,
        }
    }

    pub fn cursor_not_found() -> Self {
        Self {
            response_flags: REPLY_CURSOR_NOT_FOUND,
            cursor_id: 0,
            starting_from: 0,
            documents: Vec::new(),
        }
    }

    pub fn encode(&self, request_id: i32, response_to: i32) -> Result<Vec<u8>> {
        let mut docs = Vec::new();
        for doc in &self.documents {
            docs.extend_from_slice(&doc.to_vec()?);
        }

        let body_len = 4 + 8 + 4 + 4 + docs.len();
        let mut out = Vec::with_capacity(MessageHeader::LEN + body_len);
        MessageHeader {
            message_length: (MessageHeader::LEN + body_len) as i32,
            request_id,
            response_to,
            op_code: OpCode::Reply as i32,
        }
        .encode_into(&mut out);
        out.extend_from_slice(&self.response_flags.to_le_bytes());
        out.extend_from_slice(&self.cursor_id.to_le_bytes());
        out.extend_from_slice(&self.starting_from.to_le_bytes());
        out.extend_from_slice(&(self.documents.len() as i32).to_le_bytes());
        out.extend_from_slice(&docs);
        Ok(out)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::Message;
    use bson::doc;
    use pretty_assertions::assert_eq;

    fn frame(op_code: i32, body: Vec<u8>) -> Vec<u8> {
        let mut out = Vec::new();
        MessageHeader {
            message_length: (MessageHeader::LEN + body.len()) as i32,
            request_id: 9,
            response_to: 0,
            op_code,
        }
        .encode_into(&mut out);
        out.extend_from_slice(&body);
        out
    }

    #[test]
    fn parses_op_query() {
        let mut body = Vec::new();
        body.extend_from_slice(&0i32.to_le_bytes());
        body.extend_from_slice(b"db.widgets\0");
        body.extend_from_slice(&5i32.to_le_bytes());
        body.extend_from_slice(&10i32.to_le_bytes());
        body.extend_from_slice(&doc! { "x": 1 }.to_vec().unwrap());

        let (_, parsed) = Message::parse(&frame(2004, body)).unwrap();
        let Message::Query(q) = parsed else {
            panic!("expected OP_QUERY")
        };
        assert_eq!(q.full_collection_name, "db.widgets");
        assert_eq!(q.number_to_skip, 5);
        assert_eq!(q.number_to_return, 10);
        assert_eq!(q.query, doc! { "x": 1 });
        assert_eq!(q.return_fields, None);
    }

    #[test]
    fn parses_op_kill_cursors() {
        let mut body = Vec::new();
        body.extend_from_slice(&0i32.to_le_bytes());
        body.extend_from_slice(&2i32.to_le_bytes());
        body.extend_from_slice(&11i64.to_le_bytes());
        body.extend_from_slice(&22i64.to_le_bytes());

        let (_, parsed) = Message::parse(&frame(2007, body)).unwrap();
        let Message::KillCursors(k) = parsed else {
            panic!("expected OP_KILL_CURSORS")
        };
        assert_eq!(k.cursor_ids, vec![11, 22]);
    }

    #[test]
    fn reply_layout_is_exact() {
        let reply = OpReply {
            response_flags: REPLY_CURSOR_NOT_FOUND,
            cursor_id: 99,
            starting_from: 0,
            documents: vec![doc! { "ok": 1.0 }],
        };
        let bytes = reply.encode(3, 9).unwrap();
        let header = MessageHeader::parse(&bytes).unwrap();
        assert_eq!(header.message_length as usize, bytes.len());
        assert_eq!(header.op_code, 1);
        assert_eq!(header.response_to, 9);

        let flags = u32::from_le_bytes(bytes[16..20].try_into().unwrap());
        let cursor = i64::from_le_bytes(bytes[20..28].try_into().unwrap());
        let returned = i32::from_le_bytes(bytes[32..36].try_into().unwrap());
        assert_eq!(flags, REPLY_CURSOR_NOT_FOUND);
        assert_eq!(cursor, 99);
        assert_eq!(returned, 1);
    }
}
