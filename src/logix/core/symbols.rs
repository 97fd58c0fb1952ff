//! 符号表（symbols）：已解析标签树的扁平索引，以及它的 JSON 快照。
//!
//! 路径采用控制器语法：`Tag.Member`、`Tag[3]`、`Program:Main.Counter`。
//! STRING 类型不再向下展开，其字符不可单独寻址。
//! 恢复快照时拒绝越界的类型引用与类型环。

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::model::{TagNode, TypeArena, TypeId, TypeKind, TypeNode, SCHEMA_VERSION_V1};
use crate::logix::error::LogixError;

#[derive(Clone, Debug, Default)]
pub struct SymbolTable {
    arena: TypeArena,
    roots: Vec<TagNode>,
    flat: HashMap<String, TagNode>,
    order: Vec<String>,
}

impl SymbolTable {
    pub fn new(arena: TypeArena, roots: Vec<TagNode>) -> Self {
        let mut table = Self {
            arena,
            roots: Vec::new(),
            flat: HashMap::new(),
            order: Vec::new(),
        };
        for root in roots {
            table.insert_root(root);
        }
        table
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn arena(&self) -> &TypeArena {
        &self.arena
    }

    pub fn roots(&self) -> &[TagNode] {
        &self.roots
    }

    pub fn len(&self) -> usize {
        self.flat.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flat.is_empty()
    }

    /// All addressable paths, parents before their members.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    pub fn get(&self, path: &str) -> Option<&TagNode> {
        self.flat.get(path)
    }

    pub fn type_of(&self, node: &TagNode) -> &TypeNode {
        self.arena.node(node.type_id)
    }

    /// Exact lookup; a miss below an existing prefix is reported as a missing member.
    pub fn lookup(&self, path: &str) -> Result<&TagNode, LogixError> {
        if let Some(node) = self.flat.get(path) {
            return Ok(node);
        }

        let mut cut = path.len();
        while let Some(pos) = path[..cut].rfind(['.', '[']) {
            if let Some(parent) = self.flat.get(&path[..pos]) {
                let member = path[pos..]
                    .trim_start_matches(['.', '['])
                    .split(['.', '[', ']'])
                    .next()
                    .unwrap_or_default();
                return Err(LogixError::MemberNotFound {
                    member: member.to_string(),
                    type_name: self.type_of(parent).name.clone(),
                });
            }
            cut = pos;
        }

        Err(LogixError::TagNotFound {
            name: path.to_string(),
        })
    }

    /// Adds a root tag and its flattened members; existing paths keep their first definition.
    pub fn insert_root(&mut self, root: TagNode) {
        if self.roots.iter().any(|r| r.name == root.name) {
            return;
        }
        let mut entries = Vec::new();
        flatten(&self.arena, &root, None, false, &mut entries);
        for (path, node) in entries {
            if !self.flat.contains_key(&path) {
                self.order.push(path.clone());
                self.flat.insert(path, node);
            }
        }
        self.roots.push(root);
    }

    /// Replaces the arena, e.g. after a single-tag load grew it.
    pub fn with_arena(mut self, arena: TypeArena) -> Self {
        self.arena = arena;
        self
    }

    pub fn snapshot(&self) -> SymbolSnapshot {
        SymbolSnapshot {
            schema_version: SCHEMA_VERSION_V1,
            created_utc: Some(Utc::now()),
            types: self.arena.nodes().to_vec(),
            udt_cache: self.arena.udt_entries().into_iter().collect(),
            tags: self.roots.clone(),
        }
    }

    pub fn from_snapshot(snapshot: SymbolSnapshot) -> Result<Self, LogixError> {
        if snapshot.schema_version != SCHEMA_VERSION_V1 {
            return Err(invalid(format!(
                "unsupported schemaVersion {}",
                snapshot.schema_version
            )));
        }

        let count = snapshot.types.len();
        let check = |id: TypeId, at: &str| -> Result<(), LogixError> {
            if (id.0 as usize) < count {
                Ok(())
            } else {
                Err(invalid(format!("{at} references missing type {}", id.0)))
            }
        };
        for node in &snapshot.types {
            for child in &node.children {
                check(child.type_id, &format!("{}.{}", node.name, child.name))?;
            }
        }
        for (udt_id, id) in &snapshot.udt_cache {
            check(*id, &format!("udtCache[{udt_id}]"))?;
        }
        for tag in &snapshot.tags {
            check(tag.type_id, &tag.name)?;
        }
        reject_type_cycles(&snapshot.types)?;

        let arena = TypeArena::from_parts(snapshot.types, snapshot.udt_cache);
        Ok(Self::new(arena, snapshot.tags))
    }

    pub fn to_json(&self) -> Result<String, LogixError> {
        serde_json::to_string_pretty(&self.snapshot()).map_err(|e| invalid(e.to_string()))
    }

    pub fn from_json(text: &str) -> Result<Self, LogixError> {
        let snapshot: SymbolSnapshot =
            serde_json::from_str(text).map_err(|e| invalid(e.to_string()))?;
        Self::from_snapshot(snapshot)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SymbolSnapshot {
    pub schema_version: u32,
    #[serde(default)]
    pub created_utc: Option<DateTime<Utc>>,
    pub types: Vec<TypeNode>,
    pub udt_cache: Vec<(u16, TypeId)>,
    pub tags: Vec<TagNode>,
}

fn flatten(
    arena: &TypeArena,
    node: &TagNode,
    parent: Option<&str>,
    parent_is_array: bool,
    out: &mut Vec<(String, TagNode)>,
) {
    let ty = arena.node(node.type_id);
    if ty.kind.is_hidden() {
        return;
    }

    let path = match parent {
        Some(parent) if parent_is_array => format!("{parent}[{}]", node.name),
        Some(parent) => format!("{parent}.{}", node.name),
        None => node.name.clone(),
    };
    out.push((path.clone(), node.clone()));

    if ty.kind == TypeKind::String {
        return;
    }
    let is_array = ty.kind == TypeKind::Array;
    for child in &ty.children {
        flatten(arena, child, Some(&path), is_array, out);
    }
}

/// Iterative DFS over child edges; a back-edge means flatten/decode would never terminate.
fn reject_type_cycles(types: &[TypeNode]) -> Result<(), LogixError> {
    const OPEN: u8 = 1;
    const DONE: u8 = 2;

    let mut state = vec![0u8; types.len()];
    for start in 0..types.len() {
        if state[start] != 0 {
            continue;
        }
        state[start] = OPEN;
        let mut stack = vec![(start, 0usize)];
        while let Some(top) = stack.last_mut() {
            let (id, next) = *top;
            let Some(child) = types[id].children.get(next) else {
                state[id] = DONE;
                stack.pop();
                continue;
            };
            top.1 += 1;
            let child_id = child.type_id.0 as usize;
            match state[child_id] {
                OPEN => {
                    return Err(invalid(format!(
                        "type cycle through {}.{}",
                        types[id].name, child.name
                    )))
                }
                DONE => {}
                _ => {
                    state[child_id] = OPEN;
                    stack.push((child_id, 0));
                }
            }
        }
    }
    Ok(())
}

fn invalid(message: String) -> LogixError {
    LogixError::InvalidSnapshot { message }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::logix::core::model::{codes, TypeCode};

    fn leaf(arena: &mut TypeArena, code: u16, name: &str, kind: TypeKind, len: u32) -> TypeId {
        arena.intern_leaf(TypeNode::leaf(name, TypeCode(code), kind, len))
    }

    fn child(name: &str, type_id: TypeId, offset: u32, bit_offset: u8) -> TagNode {
        TagNode {
            name: name.to_string(),
            type_id,
            offset,
            bit_offset,
        }
    }

    /// Motor { Running: BOOL @0.2, Name: STRING @4 }, Motors: ARRAY[2] OF Motor,
    /// Program:Main { Step: DINT }.
    fn sample() -> SymbolTable {
        let mut arena = TypeArena::new();
        let bool_id = leaf(&mut arena, codes::BOOL, "BOOL", TypeKind::Primitive, 1);
        let dint_id = leaf(&mut arena, codes::DINT, "DINT", TypeKind::Primitive, 4);
        let string_id = leaf(&mut arena, codes::STRING, "STRING", TypeKind::String, 88);

        let mut motor = TypeNode::leaf("Motor", TypeCode(0x8005), TypeKind::Udt, 92);
        motor.children = vec![child("Running", bool_id, 0, 2), child("Name", string_id, 4, 0)];
        let motor_id = arena.cache_udt(5, motor);

        let mut motors = TypeNode::leaf("ARRAY[2] OF Motor", TypeCode(0xA005), TypeKind::Array, 184);
        motors.dims = vec![2];
        motors.children = vec![child("0", motor_id, 0, 0), child("1", motor_id, 92, 0)];
        let motors_id = arena.push(motors);

        let mut program = TypeNode::leaf("Program:Main", TypeCode(0x1068), TypeKind::Program, 0);
        program.children = vec![child("Step", dint_id, 0, 0)];
        let program_id = arena.push(program);

        SymbolTable::new(
            arena,
            vec![
                TagNode::new("Program:Main", program_id),
                TagNode::new("Motors", motors_id),
                TagNode::new("Speed", dint_id),
            ],
        )
    }

    #[test]
    fn flatten_uses_brackets_for_elements_and_dots_for_members() {
        let table = sample();
        let paths: Vec<_> = table.paths().collect();
        assert_eq!(
            paths,
            vec![
                "Program:Main",
                "Program:Main.Step",
                "Motors",
                "Motors[0]",
                "Motors[0].Running",
                "Motors[0].Name",
                "Motors[1]",
                "Motors[1].Running",
                "Motors[1].Name",
                "Speed",
            ]
        );
        assert_eq!(table.get("Motors[1]").unwrap().offset, 92);
        assert_eq!(table.get("Motors[1].Running").unwrap().bit_offset, 2);
    }

    #[test]
    fn lookup_distinguishes_missing_tag_from_missing_member() {
        let table = sample();

        assert!(table.lookup("Motors[0].Running").is_ok());
        assert_eq!(
            table.lookup("Motors[0].Speed").unwrap_err(),
            LogixError::MemberNotFound {
                member: "Speed".to_string(),
                type_name: "Motor".to_string()
            }
        );
        assert_eq!(
            table.lookup("Motors[0].Name.LEN").unwrap_err(),
            LogixError::MemberNotFound {
                member: "LEN".to_string(),
                type_name: "STRING".to_string()
            }
        );
        assert_eq!(
            table.lookup("Pump.Speed").unwrap_err(),
            LogixError::TagNotFound {
                name: "Pump.Speed".to_string()
            }
        );
    }

    #[test]
    fn snapshot_round_trip_preserves_layout() {
        let table = sample();
        let json = table.to_json().unwrap();
        assert!(json.contains("\"schemaVersion\": 1"));

        let restored = SymbolTable::from_json(&json).unwrap();
        assert_eq!(
            restored.paths().collect::<Vec<_>>(),
            table.paths().collect::<Vec<_>>()
        );
        for path in table.paths() {
            assert_eq!(restored.get(path), table.get(path), "path {path}");
        }
        assert_eq!(restored.arena().nodes(), table.arena().nodes());
        assert_eq!(restored.arena().cached_udt(5), table.arena().cached_udt(5));
    }

    #[test]
    fn snapshot_with_dangling_type_is_rejected() {
        let mut snapshot = sample().snapshot();
        snapshot.tags.push(TagNode::new("Ghost", TypeId(999)));

        assert!(matches!(
            SymbolTable::from_snapshot(snapshot).unwrap_err(),
            LogixError::InvalidSnapshot { .. }
        ));

        let mut future = sample().snapshot();
        future.schema_version = 2;
        assert!(SymbolTable::from_snapshot(future).is_err());
    }

    #[test]
    fn snapshot_with_type_cycle_is_rejected() {
        let mut looped = TypeNode::leaf("Loop", TypeCode(0x8001), TypeKind::Udt, 4);
        looped.children = vec![child("Self", TypeId(0), 0, 0)];
        let snapshot = SymbolSnapshot {
            schema_version: SCHEMA_VERSION_V1,
            created_utc: None,
            types: vec![looped],
            udt_cache: vec![(1, TypeId(0))],
            tags: vec![TagNode::new("Root", TypeId(0))],
        };

        let err = SymbolTable::from_snapshot(snapshot).unwrap_err();
        assert!(
            matches!(&err, LogixError::InvalidSnapshot { message } if message.contains("cycle")),
            "{err:?}"
        );
    }

    #[test]
    fn shared_member_types_are_not_cycles() {
        let restored = SymbolTable::from_snapshot(sample().snapshot()).unwrap();
        assert!(restored.get("Motors[1].Running").is_some());
    }
}
