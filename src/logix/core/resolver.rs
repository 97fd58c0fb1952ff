//! 类型解析（resolver）：把控制器上报的类型码展开成 `TypeArena` 中的类型树。
//!
//! - 数组：逐维合成节点（由内向外），元素偏移 = index * 内层字节长度
//! - UDT：按 12 位 id 记忆化；同一 id 只拉取一次模板
//! - 唯一的网络调用是 `TemplateSource::fetch_template`

use std::future::Future;
use std::pin::Pin;

use log::debug;

use super::model::{
    is_string_code, type_name, type_width, TagNode, TypeArena, TypeClass, TypeCode, TypeId,
    TypeKind, TypeNode, STRING_BYTE_LENGTH,
};
use super::record::{TagRecord, TemplateRecord};
use crate::logix::error::LogixError;

pub type TemplateFuture<'a> =
    Pin<Box<dyn Future<Output = Result<TemplateRecord, LogixError>> + Send + 'a>>;

pub type ResolveFuture<'a> = Pin<Box<dyn Future<Output = Result<TypeId, LogixError>> + Send + 'a>>;

pub trait TemplateSource: Send + Sync {
    fn fetch_template(&self, udt_id: u16) -> TemplateFuture<'_>;
}

pub struct TypeResolver<'a, S: TemplateSource + ?Sized> {
    arena: &'a mut TypeArena,
    source: &'a S,
}

impl<'a, S: TemplateSource + ?Sized> TypeResolver<'a, S> {
    pub fn new(arena: &'a mut TypeArena, source: &'a S) -> Self {
        Self { arena, source }
    }

    pub fn arena(&self) -> &TypeArena {
        self.arena
    }

    pub fn arena_mut(&mut self) -> &mut TypeArena {
        self.arena
    }

    pub async fn resolve_record(&mut self, record: &TagRecord) -> Result<TypeId, LogixError> {
        self.resolve(record.type_code, record.active_dims(), record.length)
            .await
    }

    /// Resolves `code`; `declared_len` is only consulted for primitives without a fixed width.
    pub fn resolve(&mut self, code: TypeCode, dims: Vec<u32>, declared_len: u16) -> ResolveFuture<'_> {
        Box::pin(async move {
            match code.class() {
                TypeClass::Array => {
                    let base = self.resolve(code.array_base(), Vec::new(), 0).await?;
                    let dims: Vec<u32> = dims.into_iter().filter(|d| *d > 0).collect();
                    Ok(self.build_array(code, base, &dims))
                }
                TypeClass::Udt if code.is_string_struct() => Ok(self.arena.intern_leaf(
                    TypeNode::leaf("STRING", code, TypeKind::String, STRING_BYTE_LENGTH),
                )),
                TypeClass::Udt => self.resolve_udt(code).await,
                TypeClass::Primitive => Ok(self.primitive(code, declared_len)),
            }
        })
    }

    fn build_array(&mut self, code: TypeCode, base: TypeId, dims: &[u32]) -> TypeId {
        let mut current = base;
        for level in (0..dims.len()).rev() {
            let dim = dims[level];
            let inner = self.arena.node(current);
            let inner_len = inner.byte_length;
            let name = format!("ARRAY[{dim}] OF {}", inner.name);

            let mut node = TypeNode::leaf(name, code, TypeKind::Array, dim.saturating_mul(inner_len));
            node.dims = dims[level..].to_vec();
            node.children = (0..dim)
                .map(|i| TagNode {
                    name: i.to_string(),
                    type_id: current,
                    offset: i.saturating_mul(inner_len),
                    bit_offset: 0,
                })
                .collect();
            current = self.arena.push(node);
        }
        current
    }

    async fn resolve_udt(&mut self, code: TypeCode) -> Result<TypeId, LogixError> {
        let udt_id = code.udt_id();
        if let Some(cached) = self.arena.cached_udt(udt_id) {
            return Ok(cached);
        }

        let template = self.source.fetch_template(udt_id).await?;
        debug!(
            "[logix][types] template udt=0x{udt_id:03X} name={} members={} size={}",
            template.name,
            template.fields.len(),
            template.instance_size
        );

        let mut children = Vec::with_capacity(template.fields.len());
        for field in &template.fields {
            let mut offset = field.offset;
            let mut bit_offset = 0u8;
            let mut dims = Vec::new();
            if field.type_code.is_bool() {
                offset += u32::from(field.metadata / 8);
                bit_offset = (field.metadata % 8) as u8;
            } else if field.type_code.is_array() {
                dims.push(u32::from(field.metadata));
            }

            let member_type = self.resolve(field.type_code, dims, 0).await?;
            if self.arena.node(member_type).kind.is_hidden() {
                debug!(
                    "[logix][types] drop member {}.{} type={}",
                    template.name, field.name, field.type_code
                );
                continue;
            }
            children.push(TagNode {
                name: field.name.clone(),
                type_id: member_type,
                offset,
                bit_offset,
            });
        }

        let kind = if template.name.contains("STRING") {
            TypeKind::String
        } else {
            TypeKind::Udt
        };
        let mut node = TypeNode::leaf(template.name, code, kind, template.instance_size);
        node.children = children;
        Ok(self.arena.cache_udt(udt_id, node))
    }

    fn primitive(&mut self, code: TypeCode, declared_len: u16) -> TypeId {
        let raw = code.raw();
        let (name, kind) = match type_name(raw) {
            Some(name) if is_string_code(raw) => (name.to_string(), TypeKind::String),
            Some(name) => (name.to_string(), TypeKind::Primitive),
            None if code.is_system() => (format!("SystemType({code})"), TypeKind::System),
            None => (format!("UnknownType({code})"), TypeKind::Unknown),
        };
        let width = match type_width(raw) {
            0 => u32::from(declared_len),
            known => known,
        };
        self.arena.intern_leaf(TypeNode::leaf(name, code, kind, width))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::logix::core::model::codes;
    use crate::logix::core::record::TemplateField;

    #[derive(Default)]
    struct CountingSource {
        templates: HashMap<u16, TemplateRecord>,
        fetches: AtomicUsize,
    }

    impl CountingSource {
        fn with(mut self, template: TemplateRecord) -> Self {
            self.templates.insert(template.id, template);
            self
        }

        fn fetches(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }
    }

    impl TemplateSource for CountingSource {
        fn fetch_template(&self, udt_id: u16) -> TemplateFuture<'_> {
            Box::pin(async move {
                self.fetches.fetch_add(1, Ordering::SeqCst);
                self.templates
                    .get(&udt_id)
                    .cloned()
                    .ok_or_else(|| LogixError::Transport {
                        message: format!("no template {udt_id}"),
                    })
            })
        }
    }

    fn field(name: &str, code: u16, metadata: u16, offset: u32) -> TemplateField {
        TemplateField {
            name: name.to_string(),
            type_code: TypeCode(code),
            metadata,
            offset,
        }
    }

    fn template(id: u16, name: &str, size: u32, fields: Vec<TemplateField>) -> TemplateRecord {
        TemplateRecord {
            id,
            member_desc_size: 0,
            instance_size: size,
            handle: 0,
            name: name.to_string(),
            fields,
        }
    }

    #[tokio::test]
    async fn same_udt_is_fetched_once_and_shared() {
        let source = CountingSource::default().with(template(
            0x20,
            "Pair",
            4,
            vec![field("A", codes::INT, 0, 0), field("B", codes::INT, 0, 2)],
        ));
        let mut arena = TypeArena::new();
        let mut resolver = TypeResolver::new(&mut arena, &source);

        let first = resolver.resolve(TypeCode(0x8020), Vec::new(), 0).await.unwrap();
        let second = resolver.resolve(TypeCode(0x8020), Vec::new(), 0).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(source.fetches(), 1);

        let pair = arena.node(first);
        assert_eq!(pair.name, "Pair");
        assert_eq!(pair.kind, TypeKind::Udt);
        assert_eq!(pair.byte_length, 4);
        let offsets: Vec<_> = pair.children.iter().map(|c| (c.name.as_str(), c.offset)).collect();
        assert_eq!(offsets, vec![("A", 0), ("B", 2)]);
        assert_eq!(arena.node(pair.children[0].type_id).name, "INT");
    }

    #[tokio::test]
    async fn multi_dim_array_builds_outermost_level_last() {
        let source = CountingSource::default();
        let mut arena = TypeArena::new();
        let mut resolver = TypeResolver::new(&mut arena, &source);

        let id = resolver.resolve(TypeCode(0x40C4), vec![2, 3, 0], 0).await.unwrap();

        let outer = arena.node(id);
        assert_eq!(outer.name, "ARRAY[2] OF ARRAY[3] OF DINT");
        assert_eq!(outer.dims, vec![2, 3]);
        assert_eq!(outer.byte_length, 24);
        assert_eq!(outer.element_count(), 6);
        let outer_offsets: Vec<_> = outer.children.iter().map(|c| c.offset).collect();
        assert_eq!(outer_offsets, vec![0, 12]);

        let inner = arena.node(outer.children[1].type_id);
        assert_eq!(inner.name, "ARRAY[3] OF DINT");
        assert_eq!(inner.dims, vec![3]);
        let inner_offsets: Vec<_> = inner.children.iter().map(|c| c.offset).collect();
        assert_eq!(inner_offsets, vec![0, 4, 8]);
    }

    #[tokio::test]
    async fn string_struct_code_is_an_opaque_leaf() {
        let source = CountingSource::default();
        let mut arena = TypeArena::new();
        let mut resolver = TypeResolver::new(&mut arena, &source);

        let id = resolver.resolve(TypeCode(codes::STRING_STRUCT), Vec::new(), 0).await.unwrap();

        let node = arena.node(id);
        assert_eq!(node.name, "STRING");
        assert_eq!(node.kind, TypeKind::String);
        assert_eq!(node.byte_length, 88);
        assert!(node.is_leaf());
        assert_eq!(source.fetches(), 0);
    }

    #[tokio::test]
    async fn member_metadata_means_bit_or_dimension() {
        let source = CountingSource::default().with(template(
            0x31,
            "Valve",
            16,
            vec![
                field("Open", codes::BOOL, 3, 0),
                field("Fault", codes::BOOL, 10, 0),
                field("Samples", 0x20C3, 4, 4),
                field("Hidden", 0x1068, 0, 12),
            ],
        ));
        let mut arena = TypeArena::new();
        let mut resolver = TypeResolver::new(&mut arena, &source);

        let id = resolver.resolve(TypeCode(0x8031), Vec::new(), 0).await.unwrap();

        let valve = arena.node(id);
        let names: Vec<_> = valve.children.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["Open", "Fault", "Samples"]);

        assert_eq!((valve.children[0].offset, valve.children[0].bit_offset), (0, 3));
        assert_eq!((valve.children[1].offset, valve.children[1].bit_offset), (1, 2));

        let samples = arena.node(valve.children[2].type_id);
        assert_eq!(samples.name, "ARRAY[4] OF INT");
        assert_eq!(samples.byte_length, 8);
    }

    #[tokio::test]
    async fn system_and_unknown_codes_are_classified() {
        let source = CountingSource::default();
        let mut arena = TypeArena::new();
        let mut resolver = TypeResolver::new(&mut arena, &source);

        let system = resolver.resolve(TypeCode(0x1068), Vec::new(), 0).await.unwrap();
        let unknown = resolver.resolve(TypeCode(0x00F0), Vec::new(), 6).await.unwrap();
        let stime = resolver.resolve(TypeCode(codes::STIME), Vec::new(), 4).await.unwrap();

        assert_eq!(arena.node(system).kind, TypeKind::System);
        assert_eq!(arena.node(unknown).kind, TypeKind::Unknown);
        assert_eq!(arena.node(unknown).byte_length, 6);
        assert_eq!(arena.node(stime).byte_length, 4);
    }

    #[tokio::test]
    async fn template_fetch_failure_propagates() {
        let source = CountingSource::default();
        let mut arena = TypeArena::new();
        let mut resolver = TypeResolver::new(&mut arena, &source);

        let err = resolver.resolve(TypeCode(0x8044), Vec::new(), 0).await.unwrap_err();
        assert!(matches!(err, LogixError::Transport { .. }));
        assert_eq!(arena.cached_udt_count(), 0);
    }
}
