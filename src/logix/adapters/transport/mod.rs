//! 传输层（transport）接口：对一个原始标签句柄做初始化/读/写。
//!
//! 约定：
//! - 读完成后 `RawTag.buffer` 即为该路径的完整数据（数组为全部元素）
//! - 写发送整个 `buffer`；`@raw` 这类服务型路径会把应答放回 `buffer`
//! - 超时必须以 `TransportError::Timeout` 返回，调用方不做字符串匹配

use std::future::Future;
use std::pin::Pin;

use thiserror::Error;

use crate::logix::config::PlcType;

pub mod mock;

/// Service path for unconnected raw CIP requests.
pub const RAW_PATH: &str = "@raw";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("timeout")]
    Timeout,

    #[error("comm error: {message}")]
    Comm { message: String },
}

pub type TransportFuture<'a> = Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + 'a>>;

/// 控制器地址：网关、背板路径与型号，由 `TargetConfig::endpoint` 生成。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub gateway: String,
    pub path: String,
    pub plc_type: PlcType,
}

impl Endpoint {
    /// Attribute string for one handle, e.g.
    /// `protocol=ab-eip&gateway=10.0.0.5&path=1,0&plc=controllogix&elem_count=1&name=Speed`.
    /// Micro800 has no backplane, so its route is left out.
    pub fn attributes(&self, name: &str, element_count: u32) -> String {
        let mut out = format!("protocol=ab-eip&gateway={}", self.gateway);
        let plc = match self.plc_type {
            PlcType::ControlLogix => "controllogix",
            PlcType::Micro800 => "micro800",
        };
        if self.plc_type != PlcType::Micro800 && !self.path.is_empty() {
            out.push_str("&path=");
            out.push_str(&self.path);
        }
        out.push_str(&format!("&plc={plc}&elem_count={}&name={name}", element_count.max(1)));
        out
    }
}

/// Raw handle state for one tag path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawTag {
    pub path: String,
    /// Connection attributes the transport opens the handle with.
    pub attributes: String,
    pub element_count: u32,
    pub buffer: Vec<u8>,
    pub initialized: bool,
}

impl RawTag {
    pub fn new(endpoint: &Endpoint, path: impl Into<String>, element_count: u32) -> Self {
        let path = path.into();
        Self {
            attributes: endpoint.attributes(&path, element_count),
            path,
            element_count: element_count.max(1),
            buffer: Vec::new(),
            initialized: false,
        }
    }

    pub fn size(&self) -> usize {
        self.buffer.len()
    }
}

pub trait Transport: Send + Sync {
    fn create_handle(&self, endpoint: &Endpoint, path: &str, element_count: u32) -> RawTag {
        RawTag::new(endpoint, path, element_count)
    }

    /// Creates the tag on the controller and sizes `buffer`.
    fn initialize<'a>(&'a self, tag: &'a mut RawTag) -> TransportFuture<'a>;

    fn read<'a>(&'a self, tag: &'a mut RawTag) -> TransportFuture<'a>;

    fn write<'a>(&'a self, tag: &'a mut RawTag) -> TransportFuture<'a>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(plc_type: PlcType) -> Endpoint {
        Endpoint {
            gateway: "10.0.0.5".to_string(),
            path: "1,0".to_string(),
            plc_type,
        }
    }

    #[test]
    fn handle_attributes_carry_the_route() {
        let tag = RawTag::new(&endpoint(PlcType::ControlLogix), "Arr", 3);
        assert_eq!(
            tag.attributes,
            "protocol=ab-eip&gateway=10.0.0.5&path=1,0&plc=controllogix&elem_count=3&name=Arr"
        );
    }

    #[test]
    fn micro800_attributes_have_no_backplane_path() {
        let tag = RawTag::new(&endpoint(PlcType::Micro800), "Speed", 0);
        assert_eq!(
            tag.attributes,
            "protocol=ab-eip&gateway=10.0.0.5&plc=micro800&elem_count=1&name=Speed"
        );
        assert_eq!(tag.element_count, 1);
    }
}
