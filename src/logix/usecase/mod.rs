//! 用例层（usecase）：标签加载、订阅轮询、读写队列与驱动门面。

pub mod context;
pub mod driver;
pub mod loader;
pub mod queue;
pub mod subscription;
