//! 核心层（core）：纯数据与纯计算，不做 IO。

pub mod codec;
pub mod model;
pub mod record;
pub mod resolver;
pub mod symbols;
