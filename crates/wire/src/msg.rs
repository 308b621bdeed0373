// OP_MSG: `u32 flagBits || section+ || [u32 crc32c]?`. Section kind 0 is a
// single document; kind 1 is `int32 size || cstring identifier || document+`
// where the size counts itself.

use super::{read_cstring, read_document, Error, MessageHeader, OpCode, Result};
use bson::{Document, Value};

pub const FLAG_CHECKSUM_PRESENT: u32 = 0x1;
pub const FLAG_MORE_TO_COME: u32 = 0x2;
pub const FLAG_EXHAUST_ALLOWED: u32 = 0x10000;

#[derive(Clone, Debug)]
pub enum Section {
    Body(Document),
    Sequence {
        identifier: String,
        documents: Vec<Document>,
    },
}

#[derive(Clone, Debug)]
pub struct OpMsg {
    pub flags: u32,
    pub sections: Vec<Section>,
}

impl OpMsg {
    /// A reply carrying one kind-0 body document and no flags.
    pub fn single(body: Document) -> Self {
        Self {
            flags: 0,
            sections: vec![Section::Body(body)],
        }
    }

    pub fn parse(body: &[u8]) -> Result<Self> {
        if body.len() < 4 {
            return Err(Error::Truncated(0));
        }
        let flags = u32::from_le_bytes(body[0..4].try_into().unwrap());

        // The trailing CRC is not validated; it only shortens the section region.
        let end = if flags & FLAG_CHECKSUM_PRESENT != 0 {
            body.len().saturating_sub(4)
        } else {
            body.len()
        };

        let mut at = 4;
        let mut sections = Vec::new();
        while at < end {
            let kind = body[at];
            at += 1;
            match kind {
                0 => sections.push(Section::Body(read_document(body, &mut at)?)),
                1 => {
                    let start = at;
                    let size = super::read_i32(body, &mut at)?;
                    if size < 5 || start + size as usize > end {
                        return Err(Error::InvalidSectionSize(size));
                    }
                    let section_end = start + size as usize;
                    let identifier = read_cstring(body, &mut at)?;

                    let mut documents = Vec::new();
                    while at < section_end {
                        documents.push(read_document(body, &mut at)?);
                    }
                    sections.push(Section::Sequence {
                        identifier,
                        documents,
                    });
                }
                other => return Err(Error::UnknownSectionKind(other)),
            }
        }
        Ok(Self { flags, sections })
    }

    /// Collapse this message into its command document: the kind-0 body with
    /// each kind-1 sequence appended as an array field under its identifier
    /// (the form drivers use for bulk `insert`/`update`/`delete` payloads).
    pub fn command_body(self) -> Result<Document> {
        let mut body: Option<Document> = None;
        let mut sequences = Vec::new();

        for section in self.sections {
            match section {
                Section::Body(doc) if body.is_none() => body = Some(doc),
                // A second kind-0 section is out of spec; first one wins.
                Section::Body(_) => {}
                Section::Sequence {
                    identifier,
                    documents,
                } => sequences.push((identifier, documents)),
            }
        }

        let mut body = body.ok_or(Error::MissingBody)?;
        for (identifier, documents) in sequences {
            let items: Vec<Value> = documents.into_iter().map(Value::Document).collect();
            body.insert(identifier, items);
        }
        Ok(body)
    }

    /// Encode a complete frame, header included.
    pub fn encode(&self, request_id: i32, response_to: i32) -> Result<Vec<u8>> {
        let mut body = Vec::with_capacity(256);
        body.extend_from_slice(&self.flags.to_le_bytes());
        for section in &self.sections {
            match section {
                Section::Body(doc) => {
                    body.push(0);
                    body.extend_from_slice(&doc.to_vec()?);
                }
                Section::Sequence {
                    identifier,
                    documents,
                } => {
                    body.push(1);
                    let mut payload = Vec::new();
                    payload.extend(identifier.bytes().filter(|b| *b != 0));
                    payload.push(0);
                    for doc in documents {
                        payload.extend_from_slice(&doc.to_vec()?);
                    }
                    body.extend_from_slice(&((payload.len() + 4) as i32).to_le_bytes());
                    body.extend_from_slice(&payload);
                }
            }
        }

        let mut out = Vec::with_capacity(MessageHeader::LEN + body.len());
        MessageHeader {
            message_length: (MessageHeader::LEN + body.len()) as i32,
            request_id,
            response_to,
            op_code: OpCode::Msg as i32,
        }
        .encode_into(&mut out);
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// The kind-0 body document, if present.
    pub fn body(&self) -> Option<&Document> {
        self.sections.iter().find_map(|s| match s {
            Section::Body(doc) => Some(doc),
            _ => None,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::Message;
    use bson::doc;
    use pretty_assertions::assert_eq;

    #[test]
    fn encode_parse_round_trip() {
        let msg = OpMsg::single(doc! { "ping": 1 });
        let frame = msg.encode(7, 0).unwrap();

        let (header, parsed) = Message::parse(&frame).unwrap();
        assert_eq!(header.message_length as usize, frame.len());
        assert_eq!(header.request_id, 7);
        assert_eq!(header.op_code, 2013);

        let Message::Msg(parsed) = parsed else {
            panic!("expected OP_MSG")
        };
        assert_eq!(parsed.body(), Some(&doc! { "ping": 1 }));
    }

    #[test]
    fn kind1_sequences_merge_into_the_command() {
        let msg = OpMsg {
            flags: 0,
            sections: vec![
                Section::Body(doc! { "insert": "stocks", "$db": "test" }),
                Section::Sequence {
                    identifier: "documents".to_owned(),
                    documents: vec![doc! { "a": 1 }, doc! { "a": 2 }],
                },
            ],
        };
        let frame = msg.encode(1, 0).unwrap();
        let (_, parsed) = Message::parse(&frame).unwrap();
        let Message::Msg(parsed) = parsed else {
            panic!("expected OP_MSG")
        };

        let body = parsed.command_body().unwrap();
        assert_eq!(body.get("insert"), Some(&bson::Value::from("stocks")));
        let docs = body.get("documents").unwrap().as_array().unwrap();
        assert_eq!(docs.len(), 2);
    }

    #[test]
    fn checksum_flag_shortens_the_section_region() {
        let mut frame = OpMsg::single(doc! { "ping": 1 }).encode(1, 0).unwrap();
        // Rewrite flags to claim a checksum and append 4 junk bytes.
        frame[16..20].copy_from_slice(&FLAG_CHECKSUM_PRESENT.to_le_bytes());
        frame.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
        let len = frame.len() as i32;
        frame[0..4].copy_from_slice(&len.to_le_bytes());

        let (_, parsed) = Message::parse(&frame).unwrap();
        let Message::Msg(parsed) = parsed else {
            panic!("expected OP_MSG")
        };
        assert_eq!(parsed.body(), Some(&doc! { "ping": 1 }));
    }
}
