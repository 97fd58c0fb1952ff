//! Logix 控制器客户端驱动：标签浏览、类型解析与强类型标签读写。
#![recursion_limit = "256"]

pub mod logix;
