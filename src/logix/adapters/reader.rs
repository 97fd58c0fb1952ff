//! 标签读取器（reader）：基于传输层读取浏览服务（`@tags` / `@udt` / `@raw`）并解码。
//!
//! 浏览用的句柄每次新建、用完即弃，不进入句柄缓存。

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use log::debug;

use super::connection::ConnectionMonitor;
use super::transport::{Endpoint, Transport, RAW_PATH};
use crate::logix::core::record::{
    decode_tag_list, decode_template, ControllerIdentity, TagRecord,
};
use crate::logix::core::resolver::{TemplateFuture, TemplateSource};
use crate::logix::error::LogixError;

/// Get-attributes request for the identity object (class 0x01, instance 1).
pub const IDENTITY_REQUEST: [u8; 6] = [0x01, 0x02, 0x20, 0x01, 0x24, 0x01];

pub type ReaderFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, LogixError>> + Send + 'a>>;

/// Browse-side access to a controller; `fetch_template` reads `@udt/<id>`.
pub trait TagReader: TemplateSource {
    fn read_tag_list(&self) -> ReaderFuture<'_, Vec<TagRecord>>;

    fn read_program_tags<'a>(&'a self, program: &'a str) -> ReaderFuture<'a, Vec<TagRecord>>;

    fn read_controller_info(&self) -> ReaderFuture<'_, ControllerIdentity>;

    fn read_template(&self, udt_id: u16) -> TemplateFuture<'_> {
        self.fetch_template(udt_id)
    }
}

pub struct TransportTagReader {
    transport: Arc<dyn Transport>,
    connection: Arc<ConnectionMonitor>,
    endpoint: Endpoint,
    timeout: Duration,
}

impl TransportTagReader {
    pub fn new(
        transport: Arc<dyn Transport>,
        connection: Arc<ConnectionMonitor>,
        endpoint: Endpoint,
        timeout: Duration,
    ) -> Self {
        Self {
            transport,
            connection,
            endpoint,
            timeout,
        }
    }

    async fn read_path(&self, path: &str) -> Result<Vec<u8>, LogixError> {
        let mut tag = self.transport.create_handle(&self.endpoint, path, 1);
        self.connection
            .guarded(self.timeout, self.transport.read(&mut tag))
            .await?;
        debug!(
            "[logix][browse] target={} path={} size={}",
            self.connection.target(),
            path,
            tag.size()
        );
        Ok(tag.buffer)
    }

    async fn read_records(&self, path: &str) -> Result<Vec<TagRecord>, LogixError> {
        let buf = self.read_path(path).await?;
        Ok(decode_tag_list(&buf)?)
    }
}

impl TemplateSource for TransportTagReader {
    fn fetch_template(&self, udt_id: u16) -> TemplateFuture<'_> {
        Box::pin(async move {
            let buf = self.read_path(&format!("@udt/{udt_id}")).await?;
            Ok(decode_template(&buf)?)
        })
    }
}

impl TagReader for TransportTagReader {
    fn read_tag_list(&self) -> ReaderFuture<'_, Vec<TagRecord>> {
        Box::pin(self.read_records("@tags"))
    }

    fn read_program_tags<'a>(&'a self, program: &'a str) -> ReaderFuture<'a, Vec<TagRecord>> {
        Box::pin(async move { self.read_records(&format!("{program}.@tags")).await })
    }

    fn read_controller_info(&self) -> ReaderFuture<'_, ControllerIdentity> {
        Box::pin(async move {
            let mut tag = self.transport.create_handle(&self.endpoint, RAW_PATH, 1);
            self.connection
                .guarded(self.timeout, self.transport.initialize(&mut tag))
                .await?;
            tag.buffer = IDENTITY_REQUEST.to_vec();
            self.connection
                .guarded(self.timeout, self.transport.write(&mut tag))
                .await?;
            Ok(ControllerIdentity::parse(&tag.buffer)?)
        })
    }
}
