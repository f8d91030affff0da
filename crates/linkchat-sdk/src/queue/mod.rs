//! 消息发送队列
//!
//! - [`send_pipeline`]：乐观写入 + 单消费者 FIFO 发送 + 失败重试
//! - [`retry_policy`]：失败原因分类与指数退避

pub mod retry_policy;
pub mod send_pipeline;

pub use retry_policy::{RetryPolicy, SendFailureReason};
pub use send_pipeline::{SendMetrics, SendPipeline};
