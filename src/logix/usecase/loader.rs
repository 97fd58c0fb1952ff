//! 标签加载（loader）：浏览控制器标签并解析为类型树。
//!
//! 输出顺序：先程序容器（`Program:*`），后控制器标签；系统/未知类型在每一层都被丢弃。

use log::debug;

use crate::logix::adapters::reader::TagReader;
use crate::logix::core::model::{TagNode, TypeArena, TypeKind, TypeNode};
use crate::logix::core::record::TagRecord;
use crate::logix::core::resolver::{TemplateSource, TypeResolver};
use crate::logix::error::LogixError;

pub use crate::logix::config::ProgramSelector;

pub const PROGRAM_PREFIX: &str = "Program:";

pub fn is_program_entry(name: &str) -> bool {
    name.starts_with(PROGRAM_PREFIX)
}

/// Full browse: controller tags plus the selected programs' local tags.
pub async fn load_tags<R: TagReader + ?Sized>(
    arena: &mut TypeArena,
    reader: &R,
    selector: &ProgramSelector,
) -> Result<Vec<TagNode>, LogixError> {
    let records = reader.read_tag_list().await?;
    let mut resolver = TypeResolver::new(arena, reader);

    let mut programs = Vec::new();
    let mut controller = Vec::new();
    for record in &records {
        if is_program_entry(&record.name) {
            if !selector.includes(&record.name) {
                debug!("[logix][load] skip program={}", record.name);
                continue;
            }
            let program_records = reader.read_program_tags(&record.name).await?;
            let children = resolve_visible(&mut resolver, &program_records).await?;

            let mut container = TypeNode::leaf(
                record.name.clone(),
                record.type_code,
                TypeKind::Program,
                0,
            );
            container.children = children;
            let id = resolver.arena_mut().push(container);
            programs.push(TagNode::new(record.name.clone(), id));
        } else if let Some(node) = resolve_one(&mut resolver, record).await? {
            controller.push(node);
        }
    }

    debug!(
        "[logix][load] programs={} controllerTags={} cachedUdts={}",
        programs.len(),
        controller.len(),
        resolver.arena().cached_udt_count()
    );
    programs.extend(controller);
    Ok(programs)
}

async fn resolve_visible<S: TemplateSource + ?Sized>(
    resolver: &mut TypeResolver<'_, S>,
    records: &[TagRecord],
) -> Result<Vec<TagNode>, LogixError> {
    let mut nodes = Vec::with_capacity(records.len());
    for record in records {
        if let Some(node) = resolve_one(resolver, record).await? {
            nodes.push(node);
        }
    }
    Ok(nodes)
}

async fn resolve_one<S: TemplateSource + ?Sized>(
    resolver: &mut TypeResolver<'_, S>,
    record: &TagRecord,
) -> Result<Option<TagNode>, LogixError> {
    if record.type_code.is_system() {
        debug!(
            "[logix][load] drop system tag={} type={}",
            record.name, record.type_code
        );
        return Ok(None);
    }
    let type_id = resolver.resolve_record(record).await?;
    let kind = resolver.arena().node(type_id).kind;
    if kind.is_hidden() {
        debug!(
            "[logix][load] drop tag={} type={} kind={:?}",
            record.name, record.type_code, kind
        );
        return Ok(None);
    }
    Ok(Some(TagNode::new(record.name.clone(), type_id)))
}

/// Resolves one tag path without a full browse, e.g. `Program:Main.Motor.Speed` or `Arr[2]`.
///
/// The returned node is named by the requested path.
pub async fn load_tag_definition<R: TagReader + ?Sized>(
    arena: &mut TypeArena,
    reader: &R,
    path: &str,
) -> Result<TagNode, LogixError> {
    let segments: Vec<&str> = path
        .split(['.', '[', ']'])
        .filter(|s| !s.is_empty())
        .collect();
    let not_found = || LogixError::TagNotFound {
        name: path.to_string(),
    };

    let (records, root_index) = match segments.first() {
        Some(first) if is_program_entry(first) => (reader.read_program_tags(first).await?, 1),
        Some(_) => (reader.read_tag_list().await?, 0),
        None => return Err(not_found()),
    };
    let root_name = segments.get(root_index).ok_or_else(not_found)?;
    let root = records
        .iter()
        .find(|r| r.name == *root_name)
        .ok_or_else(not_found)?;

    let mut resolver = TypeResolver::new(arena, reader);
    let Some(root_node) = resolve_one(&mut resolver, root).await? else {
        return Err(not_found());
    };

    let arena = resolver.arena();
    let mut current = root_node.type_id;
    for segment in &segments[root_index + 1..] {
        let parent = arena.node(current);
        let member = parent
            .child(segment)
            .ok_or_else(|| LogixError::MemberNotFound {
                member: segment.to_string(),
                type_name: parent.name.clone(),
            })?;
        current = member.type_id;
    }

    Ok(TagNode::new(path, current))
}
