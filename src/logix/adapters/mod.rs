//! 适配器层（adapters）：传输层接口、连接状态、mock 控制器与基于传输层的标签读取器。

pub mod connection;
pub mod reader;
pub mod transport;
