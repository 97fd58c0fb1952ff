//! Logix 类型与标签的稳定数据模型。
//!
//! 约束：
//! - 同一 UDT id 在一个 `TypeArena` 生命周期内只解析一次，所有引用它的标签共享同一个 `TypeId`
//! - `TagNode` 的字节/位偏移在解析时计算，编解码阶段只读取不重算
//! - 快照 JSON 顶层包含 `schemaVersion: 1`

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use binrw::BinRead;
use serde::{Deserialize, Serialize};

pub const SCHEMA_VERSION_V1: u32 = 1;

/// Type codes reported by the controller.
pub mod codes {
    pub const BOOL: u16 = 0xC1;
    pub const SINT: u16 = 0xC2;
    pub const INT: u16 = 0xC3;
    pub const DINT: u16 = 0xC4;
    pub const LINT: u16 = 0xC5;
    pub const USINT: u16 = 0xC6;
    pub const UINT: u16 = 0xC7;
    pub const UDINT: u16 = 0xC8;
    pub const ULINT: u16 = 0xC9;
    pub const REAL: u16 = 0xCA;
    pub const LREAL: u16 = 0xCB;
    pub const STIME: u16 = 0xCC;
    pub const DATE: u16 = 0xCD;
    pub const TIME_OF_DAY: u16 = 0xCE;
    pub const DATE_AND_TIME: u16 = 0xCF;
    pub const STRING: u16 = 0xD0;
    pub const BYTE: u16 = 0xD1;
    pub const WORD: u16 = 0xD2;
    pub const DWORD: u16 = 0xD3;
    pub const LWORD: u16 = 0xD4;
    pub const STRING2: u16 = 0xD5;
    pub const FTIME: u16 = 0xD6;
    pub const LTIME: u16 = 0xD7;
    pub const ITIME: u16 = 0xD8;
    pub const STRINGN: u16 = 0xD9;
    pub const SHORT_STRING: u16 = 0xDA;
    pub const TIME: u16 = 0xDB;
    pub const EPATH: u16 = 0xDC;
    pub const ENGUNIT: u16 = 0xDD;
    pub const STRINGI: u16 = 0xDE;
    pub const ABBREV_STRUCT: u16 = 0xA0;
    pub const ABBREV_ARRAY: u16 = 0xA1;
    pub const FULL_STRUCT: u16 = 0xA2;
    pub const FULL_ARRAY: u16 = 0xA3;
    pub const STRING_STRUCT: u16 = 0x8FCE;
}

const TYPE_IS_ARRAY: u16 = 0x6000;
const TYPE_IS_STRUCT: u16 = 0x8000;
const TYPE_IS_SYSTEM: u16 = 0x1000;
const TYPE_UDT_ID_MASK: u16 = 0x0FFF;

/// Fixed byte size of every STRING variant (DINT length + 82 chars + 2 pad).
pub const STRING_BYTE_LENGTH: u32 = 88;
pub const STRING_DATA_CAPACITY: u32 = 82;

const TYPE_NAMES: &[(u16, &str)] = &[
    (codes::BOOL, "BOOL"),
    (codes::SINT, "SINT"),
    (codes::INT, "INT"),
    (codes::DINT, "DINT"),
    (codes::LINT, "LINT"),
    (codes::USINT, "USINT"),
    (codes::UINT, "UINT"),
    (codes::UDINT, "UDINT"),
    (codes::ULINT, "ULINT"),
    (codes::REAL, "REAL"),
    (codes::LREAL, "LREAL"),
    (codes::STIME, "STIME"),
    (codes::DATE, "DATE"),
    (codes::TIME_OF_DAY, "TIME_OF_DAY"),
    (codes::DATE_AND_TIME, "DATE_AND_TIME"),
    (codes::STRING, "STRING"),
    (codes::BYTE, "BYTE"),
    (codes::WORD, "WORD"),
    (codes::DWORD, "DWORD"),
    (codes::LWORD, "LWORD"),
    (codes::STRING2, "STRING2"),
    (codes::FTIME, "FTIME"),
    (codes::LTIME, "LTIME"),
    (codes::ITIME, "ITIME"),
    (codes::STRINGN, "STRINGN"),
    (codes::SHORT_STRING, "SHORT_STRING"),
    (codes::TIME, "TIME"),
    (codes::EPATH, "EPATH"),
    (codes::ENGUNIT, "ENGUNIT"),
    (codes::STRINGI, "STRINGI"),
    (codes::ABBREV_STRUCT, "ABBREV_STRUCT"),
    (codes::ABBREV_ARRAY, "ABBREV_ARRAY"),
    (codes::FULL_STRUCT, "FULL_STRUCT"),
    (codes::FULL_ARRAY, "FULL_ARRAY"),
    (codes::STRING_STRUCT, "STRING"),
];

/// Canonical name for a known type code.
pub fn type_name(code: u16) -> Option<&'static str> {
    TYPE_NAMES
        .iter()
        .find(|(known, _)| *known == code)
        .map(|(_, name)| *name)
}

/// Byte width for a type code; 0 when the width is not fixed by the protocol.
pub fn type_width(code: u16) -> u32 {
    match code {
        codes::BOOL => 1,
        codes::SINT | codes::USINT | codes::BYTE => 1,
        codes::INT | codes::UINT | codes::WORD => 2,
        codes::DINT | codes::UDINT | codes::DWORD | codes::TIME => 4,
        codes::LINT | codes::ULINT | codes::LWORD | codes::DATE_AND_TIME => 8,
        codes::REAL => 4,
        codes::LREAL => 8,
        codes::STRING | codes::STRING2 | codes::STRINGI | codes::STRINGN | codes::STRING_STRUCT => {
            STRING_BYTE_LENGTH
        }
        _ => 0,
    }
}

pub fn is_string_code(code: u16) -> bool {
    matches!(
        code,
        codes::STRING | codes::STRING2 | codes::STRINGI | codes::STRINGN | codes::STRING_STRUCT
    )
}

/// Raw 16-bit type tag as received from the controller.
#[derive(BinRead, Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[br(little)]
#[serde(transparent)]
pub struct TypeCode(pub u16);

/// Wire-level classification of a type code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TypeClass {
    Array,
    Udt,
    Primitive,
}

impl TypeCode {
    pub fn raw(self) -> u16 {
        self.0
    }

    pub fn is_system(self) -> bool {
        self.0 & TYPE_IS_SYSTEM != 0
    }

    pub fn is_array(self) -> bool {
        self.0 & TYPE_IS_ARRAY != 0 && !self.is_system()
    }

    pub fn is_struct(self) -> bool {
        self.0 & TYPE_IS_STRUCT != 0 && !self.is_system()
    }

    pub fn is_string_struct(self) -> bool {
        self.0 == codes::STRING_STRUCT
    }

    pub fn is_bool(self) -> bool {
        self.0 == codes::BOOL
    }

    /// Template id carried in the low 12 bits of a struct code.
    pub fn udt_id(self) -> u16 {
        self.0 & TYPE_UDT_ID_MASK
    }

    pub fn array_base(self) -> TypeCode {
        TypeCode(self.0 & !TYPE_IS_ARRAY)
    }

    pub fn class(self) -> TypeClass {
        if self.is_array() {
            TypeClass::Array
        } else if self.is_struct() {
            TypeClass::Udt
        } else {
            TypeClass::Primitive
        }
    }
}

impl fmt::Display for TypeCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TypeKind {
    Primitive,
    String,
    Array,
    Udt,
    Program,
    System,
    Unknown,
}

impl TypeKind {
    /// Kinds that never reach the symbol table.
    pub fn is_hidden(self) -> bool {
        matches!(self, TypeKind::System | TypeKind::Unknown)
    }
}

/// Index of a `TypeNode` inside its `TypeArena`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypeId(pub u32);

/// One named slot in a type tree.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TagNode {
    pub name: String,
    pub type_id: TypeId,
    /// Byte offset within the immediate parent.
    pub offset: u32,
    /// Only meaningful for single-bit BOOL members.
    #[serde(default)]
    pub bit_offset: u8,
}

impl TagNode {
    pub fn new(name: impl Into<String>, type_id: TypeId) -> Self {
        Self {
            name: name.into(),
            type_id,
            offset: 0,
            bit_offset: 0,
        }
    }

    /// The same node re-anchored at offset 0, for reading it through its own handle.
    pub fn detached(&self) -> Self {
        Self {
            name: self.name.clone(),
            type_id: self.type_id,
            offset: 0,
            bit_offset: 0,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TypeNode {
    pub name: String,
    pub code: TypeCode,
    pub kind: TypeKind,
    pub byte_length: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dims: Vec<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TagNode>,
}

impl TypeNode {
    pub fn leaf(name: impl Into<String>, code: TypeCode, kind: TypeKind, byte_length: u32) -> Self {
        Self {
            name: name.into(),
            code,
            kind,
            byte_length,
            dims: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    pub fn child(&self, name: &str) -> Option<&TagNode> {
        self.children.iter().find(|c| c.name == name)
    }

    /// Number of elements a transport handle must request for this type.
    pub fn element_count(&self) -> u32 {
        if self.kind != TypeKind::Array || self.dims.is_empty() {
            return 1;
        }
        self.dims
            .iter()
            .fold(1u64, |acc, d| acc * u64::from((*d).max(1)))
            .min(u64::from(u32::MAX)) as u32
    }
}

/// Arena of resolved types; `udt_cache` is the per-session TypeCache.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TypeArena {
    nodes: Vec<TypeNode>,
    udt_cache: HashMap<u16, TypeId>,
    primitives: HashMap<(u16, u32), TypeId>,
}

impl TypeArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds an arena from snapshot parts; ids are not validated here.
    pub fn from_parts(nodes: Vec<TypeNode>, udt_cache: impl IntoIterator<Item = (u16, TypeId)>) -> Self {
        let mut arena = Self {
            nodes,
            udt_cache: udt_cache.into_iter().collect(),
            primitives: HashMap::new(),
        };
        arena.reindex();
        arena
    }

    pub fn nodes(&self) -> &[TypeNode] {
        &self.nodes
    }

    /// UDT cache entries ordered by template id.
    pub fn udt_entries(&self) -> BTreeMap<u16, TypeId> {
        self.udt_cache.iter().map(|(k, v)| (*k, *v)).collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn push(&mut self, node: TypeNode) -> TypeId {
        let id = TypeId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    pub fn get(&self, id: TypeId) -> Option<&TypeNode> {
        self.nodes.get(id.0 as usize)
    }

    /// Panics on a foreign id; ids only come from this arena.
    pub fn node(&self, id: TypeId) -> &TypeNode {
        &self.nodes[id.0 as usize]
    }

    pub fn cached_udt(&self, udt_id: u16) -> Option<TypeId> {
        self.udt_cache.get(&udt_id).copied()
    }

    pub fn cache_udt(&mut self, udt_id: u16, node: TypeNode) -> TypeId {
        if let Some(existing) = self.cached_udt(udt_id) {
            return existing;
        }
        let id = self.push(node);
        self.udt_cache.insert(udt_id, id);
        id
    }

    pub fn cached_udt_count(&self) -> usize {
        self.udt_cache.len()
    }

    pub fn intern_leaf(&mut self, node: TypeNode) -> TypeId {
        let key = (node.code.raw(), node.byte_length);
        if let Some(id) = self.primitives.get(&key) {
            return *id;
        }
        let id = self.push(node);
        self.primitives.insert(key, id);
        id
    }

    /// Rebuilds the leaf intern index after deserialization.
    fn reindex(&mut self) {
        self.primitives.clear();
        for (idx, node) in self.nodes.iter().enumerate() {
            let is_leaf_kind = matches!(
                node.kind,
                TypeKind::Primitive | TypeKind::System | TypeKind::Unknown
            ) || (node.kind == TypeKind::String && node.children.is_empty());
            if is_leaf_kind {
                self.primitives
                    .entry((node.code.raw(), node.byte_length))
                    .or_insert(TypeId(idx as u32));
            }
        }
    }

    pub fn contains(&self, id: TypeId) -> bool {
        (id.0 as usize) < self.nodes.len()
    }
}

/// Decoded tag value.
#[derive(Clone, Debug, PartialEq)]
pub enum TagValue {
    Bool(bool),
    SInt(i8),
    Int(i16),
    DInt(i32),
    LInt(i64),
    USInt(u8),
    UInt(u16),
    UDInt(u32),
    ULInt(u64),
    Real(f32),
    LReal(f64),
    String(String),
    Array(Vec<TagValue>),
    /// Members in declaration order.
    Struct(Vec<(String, TagValue)>),
}

impl TagValue {
    pub fn field(&self, name: &str) -> Option<&TagValue> {
        match self {
            TagValue::Struct(fields) => fields.iter().find(|(n, _)| n == name).map(|(_, v)| v),
            _ => None,
        }
    }

    pub fn index(&self, idx: usize) -> Option<&TagValue> {
        match self {
            TagValue::Array(items) => items.get(idx),
            _ => None,
        }
    }

    pub fn type_label(&self) -> &'static str {
        match self {
            TagValue::Bool(_) => "BOOL",
            TagValue::SInt(_) => "SINT",
            TagValue::Int(_) => "INT",
            TagValue::DInt(_) => "DINT",
            TagValue::LInt(_) => "LINT",
            TagValue::USInt(_) => "USINT",
            TagValue::UInt(_) => "UINT",
            TagValue::UDInt(_) => "UDINT",
            TagValue::ULInt(_) => "ULINT",
            TagValue::Real(_) => "REAL",
            TagValue::LReal(_) => "LREAL",
            TagValue::String(_) => "STRING",
            TagValue::Array(_) => "array",
            TagValue::Struct(_) => "object",
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value;
        match self {
            TagValue::Bool(v) => Value::Bool(*v),
            TagValue::SInt(v) => Value::from(*v),
            TagValue::Int(v) => Value::from(*v),
            TagValue::DInt(v) => Value::from(*v),
            TagValue::LInt(v) => Value::from(*v),
            TagValue::USInt(v) => Value::from(*v),
            TagValue::UInt(v) => Value::from(*v),
            TagValue::UDInt(v) => Value::from(*v),
            TagValue::ULInt(v) => Value::from(*v),
            TagValue::Real(v) => Value::from(f64::from(*v)),
            TagValue::LReal(v) => Value::from(*v),
            TagValue::String(v) => Value::String(v.clone()),
            TagValue::Array(items) => Value::Array(items.iter().map(TagValue::to_json).collect()),
            TagValue::Struct(fields) => {
                let mut map = serde_json::Map::new();
                for (name, value) in fields {
                    map.insert(name.clone(), value.to_json());
                }
                Value::Object(map)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_code_flags_follow_the_wire_bits() {
        let dint = TypeCode(codes::DINT);
        assert_eq!(dint.class(), TypeClass::Primitive);

        let dint_array = TypeCode(0x20C4);
        assert!(dint_array.is_array());
        assert_eq!(dint_array.array_base(), dint);

        let udt = TypeCode(0x8123);
        assert!(udt.is_struct());
        assert_eq!(udt.udt_id(), 0x123);

        // System bit masks both array and struct classification.
        let system = TypeCode(0x9123);
        assert!(system.is_system());
        assert!(!system.is_struct());
        assert_eq!(system.class(), TypeClass::Primitive);

        let string_struct = TypeCode(codes::STRING_STRUCT);
        assert!(string_struct.is_struct());
        assert!(string_struct.is_string_struct());
        assert_eq!(TypeCode(0xAFCE).array_base(), string_struct);
    }

    #[test]
    fn lookup_tables_cover_integer_float_and_string_families() {
        assert_eq!(type_name(codes::DINT), Some("DINT"));
        assert_eq!(type_width(codes::SINT), 1);
        assert_eq!(type_width(codes::UINT), 2);
        assert_eq!(type_width(codes::REAL), 4);
        assert_eq!(type_width(codes::LREAL), 8);
        assert_eq!(type_width(codes::STRINGI), STRING_BYTE_LENGTH);
        assert_eq!(type_width(codes::STIME), 0);
        assert_eq!(type_name(0x00F0), None);
    }

    #[test]
    fn udt_cache_is_append_only() {
        let mut arena = TypeArena::new();
        let first = arena.cache_udt(7, TypeNode::leaf("A", TypeCode(0x8007), TypeKind::Udt, 4));
        let second = arena.cache_udt(7, TypeNode::leaf("B", TypeCode(0x8007), TypeKind::Udt, 8));
        assert_eq!(first, second);
        assert_eq!(arena.node(first).name, "A");
        assert_eq!(arena.cached_udt_count(), 1);
    }

    #[test]
    fn element_count_is_the_product_of_dims() {
        let mut node = TypeNode::leaf("ARRAY[2] OF ARRAY[3] OF DINT", TypeCode(0x40C4), TypeKind::Array, 24);
        node.dims = vec![2, 3];
        assert_eq!(node.element_count(), 6);

        let scalar = TypeNode::leaf("DINT", TypeCode(codes::DINT), TypeKind::Primitive, 4);
        assert_eq!(scalar.element_count(), 1);
    }

    #[test]
    fn struct_values_keep_declaration_order_in_json() {
        let value = TagValue::Struct(vec![
            ("B".to_string(), TagValue::Int(2)),
            ("A".to_string(), TagValue::Bool(true)),
        ]);
        assert_eq!(value.field("A"), Some(&TagValue::Bool(true)));
        let json = value.to_json();
        assert_eq!(json["B"], serde_json::json!(2));
        assert_eq!(json["A"], serde_json::json!(true));
    }
}
