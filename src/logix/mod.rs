//! Logix 标签驱动：记录解码、类型解析、值编解码、标签加载与并发访问层。

pub mod config;
pub mod error;

pub mod adapters;
pub mod core;
pub mod usecase;

// --- Flat surface (hosts and tests use these paths) ---
pub use adapters::connection;
pub use adapters::reader;
pub use adapters::transport;
pub use core::codec;
pub use core::model;
pub use core::record;
pub use core::resolver;
pub use core::symbols;
pub use usecase::driver;
pub use usecase::loader;

pub use config::{DriverConfig, ProgramSelector, TargetConfig};
pub use error::{LogixError, LogixErrorKind};
pub use model::{TagNode, TagValue, TypeArena, TypeCode, TypeId, TypeKind, TypeNode};
pub use usecase::driver::{LogixDriver, TargetDiagnostics};
