//! 驱动错误分类：请求边界上返回给调用方的结构化错误。
//!
//! 只有 `TransportTimeout` 会改变共享的连接状态，其余错误只影响当前请求。

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::logix::adapters::transport::TransportError;
use crate::logix::core::codec::{DecodeError, EncodeError};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum LogixError {
    #[error("transport timeout")]
    TransportTimeout,

    #[error("transport error: {message}")]
    Transport { message: String },

    #[error("decode error: {0}")]
    Decode(DecodeError),

    #[error("unknown type code 0x{code:04X}")]
    UnknownType { code: u16 },

    #[error("tag not found: {name}")]
    TagNotFound { name: String },

    #[error("member '{member}' not found in type '{type_name}'")]
    MemberNotFound { member: String, type_name: String },

    #[error("encoding error: {0}")]
    Encoding(#[from] EncodeError),

    #[error("no connection to target: {target}")]
    NotConnected { target: String },

    #[error("operation on '{tag_name}' was canceled")]
    Canceled { tag_name: String },

    #[error("operation queue is closed")]
    QueueClosed,

    #[error("invalid symbol snapshot: {message}")]
    InvalidSnapshot { message: String },
}

impl From<TransportError> for LogixError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout => LogixError::TransportTimeout,
            TransportError::Comm { message } => LogixError::Transport { message },
        }
    }
}

impl From<DecodeError> for LogixError {
    fn from(err: DecodeError) -> Self {
        match err {
            DecodeError::UnknownType { code } => LogixError::UnknownType { code },
            other => LogixError::Decode(other),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum LogixErrorKind {
    #[serde(rename = "TransportTimeout")]
    TransportTimeout,
    #[serde(rename = "TransportError")]
    TransportError,
    #[serde(rename = "DecodeError")]
    DecodeError,
    #[serde(rename = "UnknownType")]
    UnknownType,
    #[serde(rename = "TagNotFound")]
    TagNotFound,
    #[serde(rename = "MemberNotFound")]
    MemberNotFound,
    #[serde(rename = "EncodingError")]
    EncodingError,
    #[serde(rename = "NotConnected")]
    NotConnected,
    #[serde(rename = "Canceled")]
    Canceled,
    #[serde(rename = "QueueClosed")]
    QueueClosed,
    #[serde(rename = "InvalidSnapshot")]
    InvalidSnapshot,
}

impl LogixError {
    pub fn kind(&self) -> LogixErrorKind {
        match self {
            LogixError::TransportTimeout => LogixErrorKind::TransportTimeout,
            LogixError::Transport { .. } => LogixErrorKind::TransportError,
            LogixError::Decode(_) => LogixErrorKind::DecodeError,
            LogixError::UnknownType { .. } => LogixErrorKind::UnknownType,
            LogixError::TagNotFound { .. } => LogixErrorKind::TagNotFound,
            LogixError::MemberNotFound { .. } => LogixErrorKind::MemberNotFound,
            LogixError::Encoding(_) => LogixErrorKind::EncodingError,
            LogixError::NotConnected { .. } => LogixErrorKind::NotConnected,
            LogixError::Canceled { .. } => LogixErrorKind::Canceled,
            LogixError::QueueClosed => LogixErrorKind::QueueClosed,
            LogixError::InvalidSnapshot { .. } => LogixErrorKind::InvalidSnapshot,
        }
    }

    /// Timeouts are the only errors that flip the target to disconnected.
    pub fn is_timeout(&self) -> bool {
        matches!(self, LogixError::TransportTimeout)
    }
}
