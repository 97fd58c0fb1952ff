//! 内存 mock 控制器：离线/测试场景使用。
//!
//! 标签数据按完整路径存放；fixture 编码器生成与控制器 `@tags`、`@udt/<id>` 应答一致的字节。
//! 另记录每条路径的句柄属性与并发调用峰值，供测试断言。

use std::collections::HashMap;
use std::time::Duration;

use byteorder::{LittleEndian, WriteBytesExt};
use parking_lot::Mutex;

use super::{RawTag, Transport, TransportError, TransportFuture, RAW_PATH};

#[derive(Default)]
struct MockState {
    tags: HashMap<String, Vec<u8>>,
    failures: HashMap<String, TransportError>,
    read_counts: HashMap<String, usize>,
    writes: Vec<(String, Vec<u8>)>,
    identity: Vec<u8>,
    offline: bool,
    read_delay: Duration,
    attributes: HashMap<String, String>,
    in_flight: HashMap<String, usize>,
    max_in_flight: HashMap<String, usize>,
}

#[derive(Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
}

impl MockTransport {
    pub fn new() -> Self {
        let transport = Self::default();
        transport.set_identity("1756-L83E/B", 33, 11);
        transport
    }

    pub fn with_tag(self, path: &str, bytes: Vec<u8>) -> Self {
        self.set_tag(path, bytes);
        self
    }

    pub fn with_tag_list(self, tags: &[TagFixture]) -> Self {
        self.with_tag("@tags", encode_tag_list(tags))
    }

    pub fn with_program_tags(self, program: &str, tags: &[TagFixture]) -> Self {
        self.with_tag(&format!("{program}.@tags"), encode_tag_list(tags))
    }

    pub fn with_template(self, template: &TemplateFixture) -> Self {
        self.with_tag(&format!("@udt/{}", template.id), encode_template(template))
    }

    pub fn set_tag(&self, path: &str, bytes: Vec<u8>) {
        self.state.lock().tags.insert(path.to_string(), bytes);
    }

    pub fn tag_bytes(&self, path: &str) -> Option<Vec<u8>> {
        self.state.lock().tags.get(path).cloned()
    }

    pub fn set_identity(&self, model: &str, major: u8, minor: u8) {
        self.state.lock().identity = identity_response(model, major, minor);
    }

    /// Every call fails with a timeout while offline.
    pub fn set_offline(&self, offline: bool) {
        self.state.lock().offline = offline;
    }

    pub fn set_failure(&self, path: &str, failure: Option<TransportError>) {
        let mut state = self.state.lock();
        match failure {
            Some(err) => {
                state.failures.insert(path.to_string(), err);
            }
            None => {
                state.failures.remove(path);
            }
        }
    }

    pub fn set_read_delay(&self, delay: Duration) {
        self.state.lock().read_delay = delay;
    }

    pub fn read_count(&self, path: &str) -> usize {
        self.state.lock().read_counts.get(path).copied().unwrap_or(0)
    }

    pub fn writes(&self) -> Vec<(String, Vec<u8>)> {
        self.state.lock().writes.clone()
    }

    pub fn writes_to(&self, path: &str) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .writes
            .iter()
            .filter(|(p, _)| p == path)
            .map(|(_, bytes)| bytes.clone())
            .collect()
    }

    pub fn attributes_of(&self, path: &str) -> Option<String> {
        self.state.lock().attributes.get(path).cloned()
    }

    /// Highest number of raw calls that were running on `path` at the same time.
    pub fn max_in_flight(&self, path: &str) -> usize {
        self.state.lock().max_in_flight.get(path).copied().unwrap_or(0)
    }

    fn enter(&self, tag: &RawTag) -> InFlight<'_> {
        let mut state = self.state.lock();
        state
            .attributes
            .insert(tag.path.clone(), tag.attributes.clone());
        let running = state.in_flight.entry(tag.path.clone()).or_insert(0);
        *running += 1;
        let running = *running;
        let max = state.max_in_flight.entry(tag.path.clone()).or_insert(0);
        *max = (*max).max(running);
        InFlight {
            mock: self,
            path: tag.path.clone(),
        }
    }

    fn check(&self, path: &str) -> Result<(), TransportError> {
        let state = self.state.lock();
        if state.offline {
            return Err(TransportError::Timeout);
        }
        if let Some(err) = state.failures.get(path) {
            return Err(err.clone());
        }
        Ok(())
    }

    fn stored(&self, path: &str) -> Result<Vec<u8>, TransportError> {
        self.state
            .lock()
            .tags
            .get(path)
            .cloned()
            .ok_or_else(|| TransportError::Comm {
                message: format!("tag not found: {path}"),
            })
    }
}

/// Counts one raw call on a path until dropped, including when the call is cancelled.
struct InFlight<'a> {
    mock: &'a MockTransport,
    path: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Some(running) = self.mock.state.lock().in_flight.get_mut(&self.path) {
            *running = running.saturating_sub(1);
        }
    }
}

impl Transport for MockTransport {
    fn initialize<'a>(&'a self, tag: &'a mut RawTag) -> TransportFuture<'a> {
        Box::pin(async move {
            let _call = self.enter(tag);
            self.check(&tag.path)?;
            if tag.path != RAW_PATH {
                tag.buffer = self.stored(&tag.path)?;
            }
            tag.initialized = true;
            Ok(())
        })
    }

    fn read<'a>(&'a self, tag: &'a mut RawTag) -> TransportFuture<'a> {
        Box::pin(async move {
            let _call = self.enter(tag);
            let delay = self.state.lock().read_delay;
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            self.check(&tag.path)?;
            *self
                .state
                .lock()
                .read_counts
                .entry(tag.path.clone())
                .or_insert(0) += 1;
            tag.buffer = self.stored(&tag.path)?;
            tag.initialized = true;
            Ok(())
        })
    }

    fn write<'a>(&'a self, tag: &'a mut RawTag) -> TransportFuture<'a> {
        Box::pin(async move {
            let _call = self.enter(tag);
            self.check(&tag.path)?;
            let mut state = self.state.lock();
            state.writes.push((tag.path.clone(), tag.buffer.clone()));
            if tag.path == RAW_PATH {
                tag.buffer = state.identity.clone();
            } else {
                state.tags.insert(tag.path.clone(), tag.buffer.clone());
            }
            Ok(())
        })
    }
}

/// Identity reply: revision at bytes 10/11, product name from byte 19.
pub fn identity_response(model: &str, major: u8, minor: u8) -> Vec<u8> {
    let mut buf = vec![0u8; 19];
    buf[10] = major;
    buf[11] = minor;
    buf[18] = model.len().min(u8::MAX as usize) as u8;
    buf.extend_from_slice(model.as_bytes());
    buf.extend_from_slice(&[0, 0]);
    buf
}

#[derive(Clone, Debug)]
pub struct TagFixture {
    pub name: String,
    pub type_code: u16,
    pub instance_id: u32,
    pub length: u16,
    pub dims: [u32; 3],
}

impl TagFixture {
    pub fn new(name: &str, type_code: u16) -> Self {
        Self {
            name: name.to_string(),
            type_code,
            instance_id: 1,
            length: 0,
            dims: [0; 3],
        }
    }

    pub fn instance(mut self, id: u32) -> Self {
        self.instance_id = id;
        self
    }

    pub fn length(mut self, length: u16) -> Self {
        self.length = length;
        self
    }

    pub fn dims(mut self, dims: [u32; 3]) -> Self {
        self.dims = dims;
        self
    }
}

#[derive(Clone, Debug)]
pub struct MemberFixture {
    pub name: String,
    pub type_code: u16,
    pub metadata: u16,
    pub offset: u16,
}

impl MemberFixture {
    pub fn new(name: &str, type_code: u16, offset: u16) -> Self {
        Self {
            name: name.to_string(),
            type_code,
            metadata: 0,
            offset,
        }
    }

    pub fn metadata(mut self, metadata: u16) -> Self {
        self.metadata = metadata;
        self
    }
}

#[derive(Clone, Debug)]
pub struct TemplateFixture {
    pub id: u16,
    pub name: String,
    pub instance_size: u32,
    pub members: Vec<MemberFixture>,
}

impl TemplateFixture {
    pub fn new(id: u16, name: &str, instance_size: u32) -> Self {
        Self {
            id,
            name: name.to_string(),
            instance_size,
            members: Vec::new(),
        }
    }

    pub fn member(mut self, member: MemberFixture) -> Self {
        self.members.push(member);
        self
    }
}

// Writes into a Vec never fail.
pub fn encode_tag_list(tags: &[TagFixture]) -> Vec<u8> {
    let mut out = Vec::new();
    for tag in tags {
        let _ = out.write_u32::<LittleEndian>(tag.instance_id);
        let _ = out.write_u16::<LittleEndian>(tag.type_code);
        let _ = out.write_u16::<LittleEndian>(tag.length);
        for dim in tag.dims {
            let _ = out.write_u32::<LittleEndian>(dim);
        }
        let _ = out.write_u16::<LittleEndian>(tag.name.len() as u16);
        out.extend_from_slice(tag.name.as_bytes());
    }
    out
}

pub fn encode_template(template: &TemplateFixture) -> Vec<u8> {
    let mut out = Vec::new();
    let member_count = template.members.len() as u16;
    let _ = out.write_u16::<LittleEndian>(template.id);
    let _ = out.write_u32::<LittleEndian>(u32::from(member_count) * 8);
    let _ = out.write_u32::<LittleEndian>(template.instance_size);
    let _ = out.write_u16::<LittleEndian>(member_count);
    let _ = out.write_u16::<LittleEndian>(0);
    for member in &template.members {
        let _ = out.write_u16::<LittleEndian>(member.metadata);
        let _ = out.write_u16::<LittleEndian>(member.type_code);
        let _ = out.write_u16::<LittleEndian>(member.offset);
        let _ = out.write_u16::<LittleEndian>(0);
    }
    write_counted(&mut out, &template.name);
    for member in &template.members {
        write_counted(&mut out, &member.name);
    }
    out
}

fn write_counted(out: &mut Vec<u8>, text: &str) {
    let _ = out.write_u16::<LittleEndian>(text.len() as u16);
    out.extend_from_slice(text.as_bytes());
}
