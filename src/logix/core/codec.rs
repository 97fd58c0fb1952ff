//! 值编解码（codec）：按已解析的类型树在原始标签缓冲区上读写结构化值。
//!
//! 约定：
//! - 所有整数/浮点为小端；BOOL 成员按 `bit_offset` 在所寻址字节内取位
//! - 偏移一律使用解析阶段预先计算好的 `TagNode.offset`，这里不重算
//! - 失败返回 `DecodeError`/`EncodeError`（不得 panic）；写入失败时不修改该字段的字节

use byteorder::{ByteOrder, LittleEndian};
use encoding_rs::WINDOWS_1252;
use thiserror::Error;

use super::model::{
    codes, is_string_code, TagNode, TagValue, TypeArena, TypeCode, TypeKind, TypeNode,
    STRING_BYTE_LENGTH, STRING_DATA_CAPACITY,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("truncated data at offset {offset}: need {need} bytes, buffer has {size}")]
    Truncated {
        offset: usize,
        need: usize,
        size: usize,
    },

    #[error("record at offset {offset} runs past the end of the {size}-byte buffer")]
    UnexpectedEnd { offset: usize, size: usize },

    #[error("malformed data at offset {offset}: {message}")]
    Malformed { offset: usize, message: String },

    #[error("unknown type code 0x{code:04X}")]
    UnknownType { code: u16 },

    #[error("type {type_name} does not carry a value")]
    NotAValue { type_name: String },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EncodeError {
    #[error("value {value} out of range for {type_name}")]
    OutOfRange { type_name: String, value: String },

    #[error("expected a value for {expected}, got {got}")]
    TypeMismatch { expected: String, got: &'static str },

    #[error("{type_name} expects {expected} elements, got {got}")]
    LengthMismatch {
        type_name: String,
        expected: usize,
        got: usize,
    },

    #[error("missing field '{field}' for {type_name}")]
    MissingField { type_name: String, field: String },

    #[error("unexpected field '{field}' for {type_name}")]
    UnexpectedField { type_name: String, field: String },

    #[error("string of {len} bytes exceeds capacity {capacity}")]
    StringTooLong { len: usize, capacity: usize },

    #[error("string contains characters that cannot be stored: {value}")]
    Unmappable { value: String },

    #[error("write of {need} bytes at offset {offset} exceeds buffer size {size}")]
    OutOfBounds {
        offset: usize,
        need: usize,
        size: usize,
    },

    #[error("unknown type code 0x{code:04X}")]
    UnknownType { code: u16 },
}

/// Decodes the value of `node` from `buf`; the node's own offset is added to `base`.
pub fn decode(
    arena: &TypeArena,
    node: &TagNode,
    buf: &[u8],
    base: usize,
) -> Result<TagValue, DecodeError> {
    let ty = arena.node(node.type_id);
    let at = base + node.offset as usize;

    match ty.kind {
        TypeKind::Array => {
            let mut items = Vec::with_capacity(ty.children.len());
            for child in &ty.children {
                items.push(decode(arena, child, buf, at)?);
            }
            Ok(TagValue::Array(items))
        }
        TypeKind::Udt => {
            let mut fields = Vec::with_capacity(ty.children.len());
            for child in &ty.children {
                fields.push((child.name.clone(), decode(arena, child, buf, at)?));
            }
            Ok(TagValue::Struct(fields))
        }
        TypeKind::String => decode_string(arena, ty, buf, at),
        TypeKind::Primitive => decode_primitive(ty.code, buf, at, node.bit_offset),
        TypeKind::Program => Err(DecodeError::NotAValue {
            type_name: ty.name.clone(),
        }),
        TypeKind::System | TypeKind::Unknown => Err(DecodeError::UnknownType {
            code: ty.code.raw(),
        }),
    }
}

/// Encodes `value` into `buf` following the shape of `node`.
pub fn encode(
    arena: &TypeArena,
    node: &TagNode,
    buf: &mut [u8],
    base: usize,
    value: &TagValue,
) -> Result<(), EncodeError> {
    let ty = arena.node(node.type_id);
    let at = base + node.offset as usize;

    match ty.kind {
        TypeKind::Array => {
            let TagValue::Array(items) = value else {
                return Err(mismatch(&ty.name, value));
            };
            if items.len() != ty.children.len() {
                return Err(EncodeError::LengthMismatch {
                    type_name: ty.name.clone(),
                    expected: ty.children.len(),
                    got: items.len(),
                });
            }
            for (child, item) in ty.children.iter().zip(items) {
                encode(arena, child, buf, at, item)?;
            }
            Ok(())
        }
        TypeKind::Udt => {
            let TagValue::Struct(fields) = value else {
                return Err(mismatch(&ty.name, value));
            };
            for (field, _) in fields {
                if ty.child(field).is_none() {
                    return Err(EncodeError::UnexpectedField {
                        type_name: ty.name.clone(),
                        field: field.clone(),
                    });
                }
            }
            for child in &ty.children {
                let Some((_, item)) = fields.iter().find(|(name, _)| *name == child.name) else {
                    return Err(EncodeError::MissingField {
                        type_name: ty.name.clone(),
                        field: child.name.clone(),
                    });
                };
                encode(arena, child, buf, at, item)?;
            }
            Ok(())
        }
        TypeKind::String => {
            let TagValue::String(text) = value else {
                return Err(mismatch(&ty.name, value));
            };
            encode_string(arena, ty, buf, at, text)
        }
        TypeKind::Primitive => encode_primitive(ty, buf, at, node.bit_offset, value),
        TypeKind::Program | TypeKind::System | TypeKind::Unknown => {
            Err(EncodeError::UnknownType {
                code: ty.code.raw(),
            })
        }
    }
}

fn decode_primitive(
    code: TypeCode,
    buf: &[u8],
    at: usize,
    bit_offset: u8,
) -> Result<TagValue, DecodeError> {
    let value = match code.raw() {
        codes::BOOL => {
            let byte = read_bytes(buf, at, 1)?[0];
            TagValue::Bool(byte & (1u8 << (bit_offset & 7)) != 0)
        }
        codes::SINT => TagValue::SInt(read_bytes(buf, at, 1)?[0] as i8),
        codes::USINT | codes::BYTE => TagValue::USInt(read_bytes(buf, at, 1)?[0]),
        codes::INT => TagValue::Int(LittleEndian::read_i16(read_bytes(buf, at, 2)?)),
        codes::UINT | codes::WORD => TagValue::UInt(LittleEndian::read_u16(read_bytes(buf, at, 2)?)),
        codes::DINT | codes::TIME => TagValue::DInt(LittleEndian::read_i32(read_bytes(buf, at, 4)?)),
        codes::UDINT | codes::DWORD => {
            TagValue::UDInt(LittleEndian::read_u32(read_bytes(buf, at, 4)?))
        }
        codes::LINT | codes::DATE_AND_TIME => {
            TagValue::LInt(LittleEndian::read_i64(read_bytes(buf, at, 8)?))
        }
        codes::ULINT | codes::LWORD => {
            TagValue::ULInt(LittleEndian::read_u64(read_bytes(buf, at, 8)?))
        }
        codes::REAL => TagValue::Real(LittleEndian::read_f32(read_bytes(buf, at, 4)?)),
        codes::LREAL => TagValue::LReal(LittleEndian::read_f64(read_bytes(buf, at, 8)?)),
        code if is_string_code(code) => {
            read_string(buf, at, 4, STRING_DATA_CAPACITY as usize)?
        }
        other => return Err(DecodeError::UnknownType { code: other }),
    };
    Ok(value)
}

fn encode_primitive(
    ty: &TypeNode,
    buf: &mut [u8],
    at: usize,
    bit_offset: u8,
    value: &TagValue,
) -> Result<(), EncodeError> {
    let name = ty.name.as_str();
    match ty.code.raw() {
        codes::BOOL => {
            let flag = match value {
                TagValue::Bool(v) => *v,
                other => match int_of(other) {
                    Some(0) => false,
                    Some(1) => true,
                    Some(n) => return Err(out_of_range(name, n)),
                    None => return Err(mismatch(name, other)),
                },
            };
            let current = buf
                .get(at)
                .copied()
                .ok_or_else(|| out_of_bounds(buf, at, 1))?;
            let mask = 1u8 << (bit_offset & 7);
            let next = if flag { current | mask } else { current & !mask };
            write_bytes(buf, at, &[next])
        }
        codes::SINT => {
            let v: i8 = checked_int(name, value)?;
            write_bytes(buf, at, &v.to_le_bytes())
        }
        codes::USINT | codes::BYTE => {
            let v: u8 = checked_int(name, value)?;
            write_bytes(buf, at, &[v])
        }
        codes::INT => {
            let v: i16 = checked_int(name, value)?;
            write_bytes(buf, at, &v.to_le_bytes())
        }
        codes::UINT | codes::WORD => {
            let v: u16 = checked_int(name, value)?;
            write_bytes(buf, at, &v.to_le_bytes())
        }
        codes::DINT | codes::TIME => {
            let v: i32 = checked_int(name, value)?;
            write_bytes(buf, at, &v.to_le_bytes())
        }
        codes::UDINT | codes::DWORD => {
            let v: u32 = checked_int(name, value)?;
            write_bytes(buf, at, &v.to_le_bytes())
        }
        codes::LINT | codes::DATE_AND_TIME => {
            let v: i64 = checked_int(name, value)?;
            write_bytes(buf, at, &v.to_le_bytes())
        }
        codes::ULINT | codes::LWORD => {
            let v: u64 = checked_int(name, value)?;
            write_bytes(buf, at, &v.to_le_bytes())
        }
        codes::REAL => {
            let v = float_of(name, value)?;
            if v.is_finite() && v.abs() > f64::from(f32::MAX) {
                return Err(EncodeError::OutOfRange {
                    type_name: name.to_string(),
                    value: v.to_string(),
                });
            }
            write_bytes(buf, at, &(v as f32).to_le_bytes())
        }
        codes::LREAL => {
            let v = float_of(name, value)?;
            write_bytes(buf, at, &v.to_le_bytes())
        }
        other => Err(EncodeError::UnknownType { code: other }),
    }
}

/// Character capacity of a STRING-kind type and the offset of its data bytes.
fn string_layout(arena: &TypeArena, ty: &TypeNode) -> (usize, usize) {
    if let Some(data) = ty.child("DATA") {
        let data_ty = arena.node(data.type_id);
        return (data.offset as usize, data_ty.byte_length as usize);
    }
    if ty.byte_length == STRING_BYTE_LENGTH {
        return (4, STRING_DATA_CAPACITY as usize);
    }
    (4, ty.byte_length.saturating_sub(4) as usize)
}

fn decode_string(
    arena: &TypeArena,
    ty: &TypeNode,
    buf: &[u8],
    at: usize,
) -> Result<TagValue, DecodeError> {
    let (data_offset, capacity) = string_layout(arena, ty);
    read_string(buf, at, data_offset, capacity)
}

fn read_string(
    buf: &[u8],
    at: usize,
    data_offset: usize,
    capacity: usize,
) -> Result<TagValue, DecodeError> {
    let declared = LittleEndian::read_i32(read_bytes(buf, at, 4)?);
    let len = usize::try_from(declared).unwrap_or(0).min(capacity);
    let bytes = read_bytes(buf, at + data_offset, len)?;
    let (text, _) = WINDOWS_1252.decode_without_bom_handling(bytes);
    Ok(TagValue::String(text.into_owned()))
}

fn encode_string(
    arena: &TypeArena,
    ty: &TypeNode,
    buf: &mut [u8],
    at: usize,
    text: &str,
) -> Result<(), EncodeError> {
    let (data_offset, capacity) = string_layout(arena, ty);
    let (bytes, _, had_errors) = WINDOWS_1252.encode(text);
    if had_errors {
        return Err(EncodeError::Unmappable {
            value: text.to_string(),
        });
    }
    if bytes.len() > capacity {
        return Err(EncodeError::StringTooLong {
            len: bytes.len(),
            capacity,
        });
    }
    let end = at + data_offset + capacity;
    if end > buf.len() {
        return Err(out_of_bounds(buf, at, data_offset + capacity));
    }

    let mut data = vec![0u8; capacity];
    data[..bytes.len()].copy_from_slice(&bytes);
    write_bytes(buf, at, &(bytes.len() as i32).to_le_bytes())?;
    write_bytes(buf, at + data_offset, &data)
}

fn read_bytes(buf: &[u8], at: usize, need: usize) -> Result<&[u8], DecodeError> {
    buf.get(at..at + need).ok_or(DecodeError::Truncated {
        offset: at,
        need,
        size: buf.len(),
    })
}

fn write_bytes(buf: &mut [u8], at: usize, bytes: &[u8]) -> Result<(), EncodeError> {
    let size = buf.len();
    let slot = buf.get_mut(at..at + bytes.len()).ok_or(EncodeError::OutOfBounds {
        offset: at,
        need: bytes.len(),
        size,
    })?;
    slot.copy_from_slice(bytes);
    Ok(())
}

fn int_of(value: &TagValue) -> Option<i128> {
    match value {
        TagValue::SInt(v) => Some(i128::from(*v)),
        TagValue::Int(v) => Some(i128::from(*v)),
        TagValue::DInt(v) => Some(i128::from(*v)),
        TagValue::LInt(v) => Some(i128::from(*v)),
        TagValue::USInt(v) => Some(i128::from(*v)),
        TagValue::UInt(v) => Some(i128::from(*v)),
        TagValue::UDInt(v) => Some(i128::from(*v)),
        TagValue::ULInt(v) => Some(i128::from(*v)),
        _ => None,
    }
}

fn checked_int<T: TryFrom<i128>>(type_name: &str, value: &TagValue) -> Result<T, EncodeError> {
    let n = int_of(value).ok_or_else(|| mismatch(type_name, value))?;
    T::try_from(n).map_err(|_| out_of_range(type_name, n))
}

fn float_of(type_name: &str, value: &TagValue) -> Result<f64, EncodeError> {
    match value {
        TagValue::Real(v) => Ok(f64::from(*v)),
        TagValue::LReal(v) => Ok(*v),
        other => int_of(other)
            .map(|n| n as f64)
            .ok_or_else(|| mismatch(type_name, other)),
    }
}

fn mismatch(type_name: &str, value: &TagValue) -> EncodeError {
    EncodeError::TypeMismatch {
        expected: type_name.to_string(),
        got: value.type_label(),
    }
}

fn out_of_range(type_name: &str, n: i128) -> EncodeError {
    EncodeError::OutOfRange {
        type_name: type_name.to_string(),
        value: n.to_string(),
    }
}

fn out_of_bounds(buf: &[u8], at: usize, need: usize) -> EncodeError {
    EncodeError::OutOfBounds {
        offset: at,
        need,
        size: buf.len(),
    }
}
