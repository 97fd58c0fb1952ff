//! 目标上下文（context）：符号表、句柄缓存、订阅表与读写队列的共享状态。
//!
//! 只有 `read_now` / `write_now` / `refresh` 经传输层访问句柄缓冲区；
//! 每个句柄带一把异步锁，同一句柄上不会有两个并发的传输调用。

use std::collections::HashMap;
use std::sync::Arc;

use log::debug;
use parking_lot::{Mutex, RwLock};

use super::queue::ReadWriteQueue;
use super::subscription::SubscriptionRegistry;
use crate::logix::adapters::connection::ConnectionMonitor;
use crate::logix::adapters::reader::{TagReader, TransportTagReader};
use crate::logix::adapters::transport::{Endpoint, RawTag, Transport};
use crate::logix::config::TargetConfig;
use crate::logix::core::codec;
use crate::logix::core::model::{TagNode, TagValue, TypeKind};
use crate::logix::core::record::ControllerIdentity;
use crate::logix::core::symbols::SymbolTable;
use crate::logix::error::LogixError;

/// One transport handle; the async mutex keeps two raw calls off the same buffer.
pub struct TagHandle {
    path: String,
    raw: tokio::sync::Mutex<RawTag>,
}

impl TagHandle {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, RawTag> {
        self.raw.lock().await
    }
}

#[derive(Default)]
pub struct HandleCache {
    handles: Mutex<HashMap<String, Arc<TagHandle>>>,
}

impl HandleCache {
    pub fn get_or_create(
        &self,
        transport: &dyn Transport,
        endpoint: &Endpoint,
        path: &str,
        element_count: u32,
    ) -> Arc<TagHandle> {
        let mut handles = self.handles.lock();
        if let Some(handle) = handles.get(path) {
            return Arc::clone(handle);
        }
        let handle = Arc::new(TagHandle {
            path: path.to_string(),
            raw: tokio::sync::Mutex::new(transport.create_handle(endpoint, path, element_count)),
        });
        handles.insert(path.to_string(), Arc::clone(&handle));
        handle
    }

    pub fn get(&self, path: &str) -> Option<Arc<TagHandle>> {
        self.handles.lock().get(path).cloned()
    }

    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.lock().is_empty()
    }
}

/// A path resolved against one symbol table generation.
pub struct ResolvedTag {
    pub symbols: Arc<SymbolTable>,
    /// Anchored at offset 0: every path is read through its own handle.
    pub node: TagNode,
    pub element_count: u32,
}

pub struct DriverContext {
    pub config: TargetConfig,
    pub transport: Arc<dyn Transport>,
    pub connection: Arc<ConnectionMonitor>,
    pub handles: HandleCache,
    pub subscriptions: SubscriptionRegistry,
    pub queue: ReadWriteQueue,
    /// Serializes tag loads so concurrent first-use never fetches a template twice.
    pub load_lock: tokio::sync::Mutex<()>,
    symbols: RwLock<Arc<SymbolTable>>,
    identity: Mutex<Option<ControllerIdentity>>,
}

impl DriverContext {
    pub fn new(config: TargetConfig, transport: Arc<dyn Transport>) -> Self {
        let connection = Arc::new(ConnectionMonitor::new(config.name.clone()));
        let queue = ReadWriteQueue::new(config.name.clone());
        Self {
            config,
            transport,
            connection,
            handles: HandleCache::default(),
            subscriptions: SubscriptionRegistry::new(),
            queue,
            load_lock: tokio::sync::Mutex::new(()),
            symbols: RwLock::new(Arc::new(SymbolTable::empty())),
            identity: Mutex::new(None),
        }
    }

    pub fn target(&self) -> &str {
        &self.config.name
    }

    pub fn symbols(&self) -> Arc<SymbolTable> {
        Arc::clone(&self.symbols.read())
    }

    pub fn replace_symbols(&self, table: SymbolTable) {
        *self.symbols.write() = Arc::new(table);
    }

    pub fn reader(&self) -> TransportTagReader {
        TransportTagReader::new(
            Arc::clone(&self.transport),
            Arc::clone(&self.connection),
            self.config.endpoint(),
            self.config.timeout(),
        )
    }

    pub fn identity(&self) -> Option<ControllerIdentity> {
        self.identity.lock().clone()
    }

    pub async fn read_identity(&self) -> Result<ControllerIdentity, LogixError> {
        let identity = self.reader().read_controller_info().await?;
        *self.identity.lock() = Some(identity.clone());
        Ok(identity)
    }

    /// Program containers are not values and resolve as missing tags.
    pub fn resolve(&self, path: &str) -> Result<ResolvedTag, LogixError> {
        let symbols = self.symbols();
        let (node, element_count) = {
            let node = symbols.lookup(path)?;
            let ty = symbols.type_of(node);
            if ty.kind == TypeKind::Program {
                return Err(LogixError::TagNotFound {
                    name: path.to_string(),
                });
            }
            (node.detached(), ty.element_count())
        };
        Ok(ResolvedTag {
            symbols,
            node,
            element_count,
        })
    }

    pub fn handle_for(&self, path: &str, element_count: u32) -> Arc<TagHandle> {
        self.handles.get_or_create(
            self.transport.as_ref(),
            &self.config.endpoint(),
            path,
            element_count,
        )
    }

    /// Transport read into the handle buffer, no decode.
    pub async fn refresh(&self, handle: &TagHandle) -> Result<(), LogixError> {
        let mut raw = handle.lock().await;
        self.connection
            .guarded(self.config.timeout(), self.transport.read(&mut raw))
            .await
    }

    /// Decodes whatever the handle currently holds.
    pub async fn decode_cached(
        &self,
        tag: &ResolvedTag,
        handle: &TagHandle,
    ) -> Result<TagValue, LogixError> {
        let raw = handle.lock().await;
        Ok(codec::decode(tag.symbols.arena(), &tag.node, &raw.buffer, 0)?)
    }

    pub async fn read_now(&self, path: &str) -> Result<TagValue, LogixError> {
        let tag = self.resolve(path)?;
        let handle = self.handle_for(path, tag.element_count);

        let mut raw = handle.lock().await;
        self.connection
            .guarded(self.config.timeout(), self.transport.read(&mut raw))
            .await?;
        debug!(
            "[logix][read] target={} tag={} size={}",
            self.target(),
            path,
            raw.size()
        );
        Ok(codec::decode(tag.symbols.arena(), &tag.node, &raw.buffer, 0)?)
    }

    /// Encodes into a copy of the buffer; the handle keeps its old bytes if encode or send fails.
    pub async fn write_now(&self, path: &str, value: &TagValue) -> Result<(), LogixError> {
        let tag = self.resolve(path)?;
        let handle = self.handle_for(path, tag.element_count);
        let arena = tag.symbols.arena();

        let mut raw = handle.lock().await;
        if !raw.initialized {
            self.connection
                .guarded(self.config.timeout(), self.transport.initialize(&mut raw))
                .await?;
        }

        let byte_length = arena.node(tag.node.type_id).byte_length as usize;
        let mut scratch = raw.buffer.clone();
        if scratch.len() < byte_length {
            scratch.resize(byte_length, 0);
        }
        codec::encode(arena, &tag.node, &mut scratch, 0, value)?;

        let previous = std::mem::replace(&mut raw.buffer, scratch);
        let sent = self
            .connection
            .guarded(self.config.timeout(), self.transport.write(&mut raw))
            .await;
        if let Err(err) = sent {
            raw.buffer = previous;
            return Err(err);
        }
        debug!(
            "[logix][write] target={} tag={} size={}",
            self.target(),
            path,
            raw.size()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::logix::adapters::transport::mock::{
        MemberFixture, MockTransport, TagFixture, TemplateFixture,
    };
    use crate::logix::core::codec::EncodeError;
    use crate::logix::core::model::{codes, TypeArena};
    use crate::logix::usecase::loader::{load_tags, ProgramSelector};

    async fn loaded(mock: &Arc<MockTransport>) -> DriverContext {
        let mut config = TargetConfig::new("plc1", "10.0.0.5");
        config.timeout_ms = 200;
        let ctx = DriverContext::new(config, mock.clone());
        let mut arena = TypeArena::new();
        let roots = load_tags(&mut arena, &ctx.reader(), &ProgramSelector::All)
            .await
            .unwrap();
        ctx.replace_symbols(SymbolTable::new(arena, roots));
        ctx
    }

    fn plant() -> Arc<MockTransport> {
        Arc::new(
            MockTransport::new()
                .with_tag_list(&[
                    TagFixture::new("Speed", codes::INT),
                    TagFixture::new("Pair", 0x8011),
                    TagFixture::new("Arr", 0x20C4).dims([3, 0, 0]),
                    TagFixture::new("Program:Main", 0x1068),
                ])
                .with_program_tags("Program:Main", &[])
                .with_template(
                    &TemplateFixture::new(0x11, "Pair", 4)
                        .member(MemberFixture::new("A", codes::INT, 0))
                        .member(MemberFixture::new("B", codes::INT, 2)),
                )
                .with_tag("Speed", vec![0x2A, 0x00])
                .with_tag("Pair.B", vec![0x07, 0x00])
                .with_tag("Arr", vec![1, 0, 0, 0, 2, 0, 0, 0, 3, 0, 0, 0]),
        )
    }

    #[tokio::test]
    async fn member_and_array_reads_use_their_own_handles() {
        let mock = plant();
        let ctx = loaded(&mock).await;

        assert_eq!(ctx.read_now("Pair.B").await.unwrap(), TagValue::Int(7));
        assert_eq!(
            ctx.read_now("Arr").await.unwrap(),
            TagValue::Array(vec![TagValue::DInt(1), TagValue::DInt(2), TagValue::DInt(3)])
        );
        assert_eq!(mock.read_count("Arr"), 1);

        let arr = ctx.handles.get("Arr").unwrap();
        assert_eq!(arr.lock().await.element_count, 3);
        assert_eq!(ctx.handles.len(), 2);
    }

    #[tokio::test]
    async fn program_containers_are_not_readable() {
        let mock = plant();
        let ctx = loaded(&mock).await;

        assert_eq!(
            ctx.read_now("Program:Main").await.unwrap_err(),
            LogixError::TagNotFound {
                name: "Program:Main".to_string()
            }
        );
    }

    #[tokio::test]
    async fn first_write_initializes_the_handle() {
        let mock = plant();
        let ctx = loaded(&mock).await;

        ctx.write_now("Speed", &TagValue::Int(-2)).await.unwrap();

        assert_eq!(mock.writes_to("Speed"), vec![vec![0xFE, 0xFF]]);
        assert_eq!(mock.read_count("Speed"), 0);
        assert!(ctx.handles.get("Speed").unwrap().lock().await.initialized);
    }

    #[tokio::test]
    async fn rejected_value_leaves_buffer_and_controller_untouched() {
        let mock = plant();
        let ctx = loaded(&mock).await;
        ctx.read_now("Speed").await.unwrap();

        let err = ctx
            .write_now("Speed", &TagValue::DInt(70_000))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            LogixError::Encoding(EncodeError::OutOfRange { .. })
        ));
        assert!(mock.writes_to("Speed").is_empty());
        let handle = ctx.handles.get("Speed").unwrap();
        assert_eq!(handle.lock().await.buffer, vec![0x2A, 0x00]);
    }

    #[tokio::test]
    async fn failed_send_restores_previous_bytes() {
        let mock = plant();
        let ctx = loaded(&mock).await;
        ctx.read_now("Speed").await.unwrap();
        mock.set_offline(true);

        let err = ctx.write_now("Speed", &TagValue::Int(1)).await.unwrap_err();

        assert!(err.is_timeout());
        assert!(!ctx.connection.is_connected());
        let handle = ctx.handles.get("Speed").unwrap();
        assert_eq!(handle.lock().await.buffer, vec![0x2A, 0x00]);
    }
}
