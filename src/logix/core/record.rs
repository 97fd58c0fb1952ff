//! 浏览服务的线格式记录（record）。
//!
//! - `@tags` / `<program>.@tags`：紧凑排列的 `TagRecord`，每条长度由自身名称决定
//! - `@udt/<id>`：模板头、成员槽，然后是带长度前缀的名称
//! - `@raw` 身份应答：版本字节与产品名
//!
//! 整数一律小端。任一记录越过应答缓冲区末尾即整份应答失败，不返回部分结果。

use std::fmt;
use std::io::{Cursor, Read, Seek};

use binrw::{binread, BinRead, BinResult, Endian};
use byteorder::{ByteOrder, LittleEndian};
use encoding_rs::WINDOWS_1252;
use serde::{Deserialize, Serialize};

use super::codec::DecodeError;
use super::model::TypeCode;

/// Longest tag name the controller will ever report.
pub const MAX_TAG_NAME_LEN: usize = 399;

/// Fixed part of a tag record in front of the name bytes.
pub const TAG_RECORD_HEADER_LEN: usize = 22;

/// Fixed template header in front of the member slots.
pub const TEMPLATE_HEADER_LEN: usize = 14;

#[binread]
#[br(little)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagRecord {
    pub instance_id: u32,
    pub type_code: TypeCode,
    pub length: u16,
    pub dims: [u32; 3],

    #[br(temp)]
    name_len: u16,

    #[br(
        count = usize::from(name_len).min(MAX_TAG_NAME_LEN),
        map = |bytes: Vec<u8>| single_byte_text(&bytes)
    )]
    pub name: String,
}

impl TagRecord {
    /// Non-zero dimensions, outermost first.
    pub fn active_dims(&self) -> Vec<u32> {
        self.dims.iter().copied().filter(|d| *d > 0).collect()
    }
}

/// Bytes the record at `offset` occupies: the fixed header, then the clamped name.
fn tag_record_len(buf: &[u8], offset: usize) -> usize {
    let name_at = offset + TAG_RECORD_HEADER_LEN - 2;
    match buf.get(name_at..name_at + 2) {
        Some(raw) => {
            TAG_RECORD_HEADER_LEN + usize::from(LittleEndian::read_u16(raw)).min(MAX_TAG_NAME_LEN)
        }
        None => TAG_RECORD_HEADER_LEN,
    }
}

/// Decodes one tag record at `offset`, returning it with the number of bytes it occupied.
pub fn decode_tag_record(buf: &[u8], offset: usize) -> Result<(TagRecord, usize), DecodeError> {
    let need = tag_record_len(buf, offset);
    if buf.len().saturating_sub(offset) < need {
        return Err(DecodeError::Truncated {
            offset,
            need,
            size: buf.len(),
        });
    }
    let mut cursor = Cursor::new(buf);
    cursor.set_position(offset as u64);
    let record = TagRecord::read(&mut cursor).map_err(|err| wire_error(err, offset, buf.len()))?;
    let consumed = cursor.position() as usize - offset;
    Ok((record, consumed))
}

/// Decodes a full tag-list response.
pub fn decode_tag_list(buf: &[u8]) -> Result<Vec<TagRecord>, DecodeError> {
    let mut records = Vec::new();
    let mut offset = 0usize;
    while offset < buf.len() {
        let (record, consumed) = decode_tag_record(buf, offset)?;
        offset += consumed;
        records.push(record);
    }
    Ok(records)
}

/// Length-prefixed text: u16 little-endian byte count, then the bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountedString {
    pub text: String,
    byte_len: usize,
}

impl CountedString {
    /// Total bytes this string occupied on the wire, prefix included.
    pub fn encoded_len(&self) -> usize {
        2 + self.byte_len
    }
}

impl BinRead for CountedString {
    type Args<'a> = ();

    fn read_options<R: Read + Seek>(
        reader: &mut R,
        endian: Endian,
        _: Self::Args<'_>,
    ) -> BinResult<Self> {
        let len = u16::read_options(reader, endian, ())? as usize;
        let mut bytes = vec![0u8; len];
        reader.read_exact(&mut bytes)?;
        Ok(CountedString {
            text: single_byte_text(&bytes),
            byte_len: len,
        })
    }
}

#[derive(BinRead, Debug, Clone, Copy)]
#[br(little)]
struct MemberSlot {
    metadata: u16,
    type_code: TypeCode,
    // Only the low half of the 4-byte offset slot is used.
    #[br(pad_after = 2)]
    offset: u16,
}

#[binread]
#[br(little)]
#[derive(Debug)]
struct TemplateWire {
    id: u16,
    member_desc_size: u32,
    instance_size: u32,
    #[br(temp)]
    member_count: u16,
    handle: u16,
    #[br(count = member_count)]
    slots: Vec<MemberSlot>,
    name: CountedString,
    #[br(count = member_count)]
    member_names: Vec<CountedString>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateField {
    pub name: String,
    pub type_code: TypeCode,
    /// Bit position for BOOL members, element count for array members.
    pub metadata: u16,
    pub offset: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateRecord {
    pub id: u16,
    pub member_desc_size: u32,
    pub instance_size: u32,
    pub handle: u16,
    pub name: String,
    pub fields: Vec<TemplateField>,
}

pub fn decode_template(buf: &[u8]) -> Result<TemplateRecord, DecodeError> {
    let mut cursor = Cursor::new(buf);
    let wire = TemplateWire::read(&mut cursor).map_err(|err| wire_error(err, 0, buf.len()))?;

    // Controllers append ";n..." style suffixes to the template name.
    let name = match wire.name.text.split_once(';') {
        Some((head, _)) => head.to_string(),
        None => wire.name.text,
    };

    let fields = wire
        .slots
        .into_iter()
        .zip(wire.member_names)
        .map(|(slot, member)| TemplateField {
            name: member.text,
            type_code: slot.type_code,
            metadata: slot.metadata,
            offset: u32::from(slot.offset),
        })
        .collect();

    Ok(TemplateRecord {
        id: wire.id,
        member_desc_size: wire.member_desc_size,
        instance_size: wire.instance_size,
        handle: wire.handle,
        name,
        fields,
    })
}

#[binread]
#[br(little)]
#[derive(Debug)]
struct IdentityWire {
    #[br(pad_before = 10)]
    major: u8,
    minor: u8,
    #[br(pad_before = 7, parse_with = binrw::helpers::until_eof)]
    model: Vec<u8>,
}

/// Identity reply to the `@raw` heartbeat request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerIdentity {
    pub model: String,
    pub major: u8,
    pub minor: u8,
}

impl ControllerIdentity {
    pub fn parse(buf: &[u8]) -> Result<Self, DecodeError> {
        let wire = IdentityWire::read(&mut Cursor::new(buf))
            .map_err(|err| wire_error(err, 0, buf.len()))?;
        let model = single_byte_text(&wire.model)
            .trim_end_matches('\0')
            .to_string();
        Ok(Self {
            model,
            major: wire.major,
            minor: wire.minor,
        })
    }
}

impl fmt::Display for ControllerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} v{}.{}", self.model, self.major, self.minor)
    }
}

fn single_byte_text(bytes: &[u8]) -> String {
    let (text, _) = WINDOWS_1252.decode_without_bom_handling(bytes);
    text.into_owned()
}

fn wire_error(err: binrw::Error, offset: usize, size: usize) -> DecodeError {
    if err.is_eof() {
        return DecodeError::UnexpectedEnd { offset, size };
    }
    DecodeError::Malformed {
        offset,
        message: err.to_string(),
    }
}
