//! 读写队列：按 `(kind, tagName)` 去重的临时操作索引 + 两条无界通道。
//!
//! 规则：
//! - 每个周期先排空写，再处理读，总数不超过 `maxOperationsPerCycle`
//! - 同名读合并为一次传输读，所有等待者共享同一结果；读完成后才移出索引
//! - 同名写在派发前被新写替换（旧等待者收到 `Canceled`）；派发即移出索引，不可再取消
//! - 断线时队列中的操作立即以 `NotConnected` 失败

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use super::context::DriverContext;
use crate::logix::adapters::connection::wait_stop;
use crate::logix::core::model::TagValue;
use crate::logix::error::LogixError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Read,
    Write,
}

pub type OperationResult = Result<Option<TagValue>, LogixError>;

type OpKey = (OperationKind, String);

struct Pending {
    value: Option<TagValue>,
    waiters: Vec<oneshot::Sender<OperationResult>>,
}

impl Pending {
    fn complete(self, result: &OperationResult) {
        for waiter in self.waiters {
            let _ = waiter.send(result.clone());
        }
    }
}

struct Receivers {
    reads: mpsc::UnboundedReceiver<String>,
    writes: mpsc::UnboundedReceiver<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CycleStats {
    pub writes: usize,
    pub reads: usize,
    pub failed_fast: usize,
}

pub struct ReadWriteQueue {
    target: String,
    pending: Mutex<HashMap<OpKey, Pending>>,
    read_tx: mpsc::UnboundedSender<String>,
    write_tx: mpsc::UnboundedSender<String>,
    receivers: tokio::sync::Mutex<Receivers>,
    closed: AtomicBool,
}

impl ReadWriteQueue {
    pub fn new(target: impl Into<String>) -> Self {
        let (read_tx, reads) = mpsc::unbounded_channel();
        let (write_tx, writes) = mpsc::unbounded_channel();
        Self {
            target: target.into(),
            pending: Mutex::new(HashMap::new()),
            read_tx,
            write_tx,
            receivers: tokio::sync::Mutex::new(Receivers { reads, writes }),
            closed: AtomicBool::new(false),
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_pending(&self, kind: OperationKind, tag_name: &str) -> bool {
        self.pending
            .lock()
            .contains_key(&(kind, tag_name.to_string()))
    }

    /// Joins an in-flight or queued read of the same tag if there is one.
    pub fn enqueue_read(&self, tag_name: &str) -> oneshot::Receiver<OperationResult> {
        let (tx, rx) = oneshot::channel();
        if self.closed.load(Ordering::Acquire) {
            let _ = tx.send(Err(LogixError::QueueClosed));
            return rx;
        }

        let key = (OperationKind::Read, tag_name.to_string());
        let mut pending = self.pending.lock();
        if let Some(entry) = pending.get_mut(&key) {
            entry.waiters.push(tx);
            return rx;
        }
        pending.insert(
            key,
            Pending {
                value: None,
                waiters: vec![tx],
            },
        );
        if self.read_tx.send(tag_name.to_string()).is_err() {
            if let Some(entry) = pending.remove(&(OperationKind::Read, tag_name.to_string())) {
                entry.complete(&Err(LogixError::QueueClosed));
            }
        }
        rx
    }

    /// Replaces a queued write of the same tag; its waiters get `Canceled`.
    pub fn enqueue_write(&self, tag_name: &str, value: TagValue) -> oneshot::Receiver<OperationResult> {
        let (tx, rx) = oneshot::channel();
        if self.closed.load(Ordering::Acquire) {
            let _ = tx.send(Err(LogixError::QueueClosed));
            return rx;
        }

        let key = (OperationKind::Write, tag_name.to_string());
        let mut pending = self.pending.lock();
        if let Some(entry) = pending.get_mut(&key) {
            let superseded = std::mem::replace(
                entry,
                Pending {
                    value: Some(value),
                    waiters: vec![tx],
                },
            );
            debug!(
                "[logix][queue] target={} tag={} queued write replaced",
                self.target, tag_name
            );
            superseded.complete(&Err(LogixError::Canceled {
                tag_name: tag_name.to_string(),
            }));
            return rx;
        }
        pending.insert(
            key,
            Pending {
                value: Some(value),
                waiters: vec![tx],
            },
        );
        if self.write_tx.send(tag_name.to_string()).is_err() {
            if let Some(entry) = pending.remove(&(OperationKind::Write, tag_name.to_string())) {
                entry.complete(&Err(LogixError::QueueClosed));
            }
        }
        rx
    }

    pub async fn read(&self, tag_name: &str) -> Result<TagValue, LogixError> {
        match self.enqueue_read(tag_name).await {
            Ok(Ok(Some(value))) => Ok(value),
            Ok(Ok(None)) => Err(LogixError::TagNotFound {
                name: tag_name.to_string(),
            }),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(LogixError::QueueClosed),
        }
    }

    pub async fn write(&self, tag_name: &str, value: TagValue) -> Result<(), LogixError> {
        match self.enqueue_write(tag_name, value).await {
            Ok(result) => result.map(|_| ()),
            Err(_) => Err(LogixError::QueueClosed),
        }
    }

    /// Completes every queued or in-flight waiter with `err`.
    pub fn fail_all(&self, err: LogixError) -> usize {
        let drained: Vec<Pending> = self.pending.lock().drain().map(|(_, p)| p).collect();
        let count = drained.len();
        let result = Err(err);
        for entry in drained {
            entry.complete(&result);
        }
        count
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.fail_all(LogixError::QueueClosed);
    }

    pub fn reopen(&self) {
        self.closed.store(false, Ordering::Release);
    }

    fn take_write(&self, tag_name: &str) -> Option<Pending> {
        self.pending
            .lock()
            .remove(&(OperationKind::Write, tag_name.to_string()))
    }

    fn finish_read(&self, tag_name: &str, result: &OperationResult) {
        let entry = self
            .pending
            .lock()
            .remove(&(OperationKind::Read, tag_name.to_string()));
        if let Some(entry) = entry {
            entry.complete(result);
        }
    }

    fn fail_fast(&self) -> usize {
        let failed = self.fail_all(LogixError::NotConnected {
            target: self.target.clone(),
        });
        if failed > 0 {
            debug!(
                "[logix][queue] target={} failed {} queued ops: not connected",
                self.target, failed
            );
        }
        failed
    }

    /// One processing tick: writes first, then reads, capped at `maxOperationsPerCycle`.
    pub async fn process_cycle(&self, ctx: &DriverContext) -> CycleStats {
        let mut stats = CycleStats::default();
        if !ctx.connection.is_connected() {
            stats.failed_fast = self.fail_fast();
            return stats;
        }

        let mut rx = self.receivers.lock().await;
        let mut budget = ctx.config.max_operations_per_cycle;

        while budget > 0 {
            let Ok(tag_name) = rx.writes.try_recv() else {
                break;
            };
            // Keys left behind by a replaced or failed entry have no index slot.
            let Some(entry) = self.take_write(&tag_name) else {
                continue;
            };
            budget -= 1;
            stats.writes += 1;

            let result = match &entry.value {
                Some(value) => ctx.write_now(&tag_name, value).await.map(|_| None),
                None => Ok(None),
            };
            if let Err(err) = &result {
                warn!(
                    "[logix][queue] target={} tag={} write failed: {}",
                    self.target, tag_name, err
                );
            }
            entry.complete(&result);

            if !ctx.connection.is_connected() {
                stats.failed_fast = self.fail_fast();
                return stats;
            }
        }

        while budget > 0 {
            let Ok(tag_name) = rx.reads.try_recv() else {
                break;
            };
            if !self.is_pending(OperationKind::Read, &tag_name) {
                continue;
            }
            budget -= 1;
            stats.reads += 1;

            let result = ctx.read_now(&tag_name).await.map(Some);
            self.finish_read(&tag_name, &result);

            if !ctx.connection.is_connected() {
                stats.failed_fast = self.fail_fast();
                return stats;
            }
        }

        stats
    }
}

pub fn spawn_processor(ctx: Arc<DriverContext>, stop_rx: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(ctx.config.queue_rate());
        let stop = wait_stop(stop_rx);
        tokio::pin!(stop);

        loop {
            tokio::select! {
                _ = &mut stop => break,
                _ = ticker.tick() => {
                    ctx.queue.process_cycle(&ctx).await;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::logix::adapters::transport::mock::{MockTransport, TagFixture};
    use crate::logix::config::TargetConfig;
    use crate::logix::core::model::{codes, TypeArena};
    use crate::logix::core::symbols::SymbolTable;
    use crate::logix::usecase::loader::{load_tags, ProgramSelector};

    async fn context(mock: &Arc<MockTransport>, max_ops: usize) -> DriverContext {
        let mut config = TargetConfig::new("plc1", "10.0.0.5");
        config.timeout_ms = 500;
        config.max_operations_per_cycle = max_ops;
        let ctx = DriverContext::new(config, mock.clone());
        let mut arena = TypeArena::new();
        let roots = load_tags(&mut arena, &ctx.reader(), &ProgramSelector::None)
            .await
            .unwrap();
        ctx.replace_symbols(SymbolTable::new(arena, roots));
        ctx
    }

    fn mock() -> Arc<MockTransport> {
        Arc::new(
            MockTransport::new()
                .with_tag_list(&[
                    TagFixture::new("X", codes::DINT),
                    TagFixture::new("Y", codes::DINT),
                ])
                .with_tag("X", vec![5, 0, 0, 0])
                .with_tag("Y", vec![0, 0, 0, 0]),
        )
    }

    #[tokio::test]
    async fn duplicate_reads_share_one_transport_call() {
        let mock = mock();
        let ctx = context(&mock, 100).await;

        let first = ctx.queue.enqueue_read("X");
        let second = ctx.queue.enqueue_read("X");
        assert_eq!(ctx.queue.pending_count(), 1);

        let stats = ctx.queue.process_cycle(&ctx).await;

        assert_eq!(stats.reads, 1);
        assert_eq!(first.await.unwrap().unwrap(), Some(TagValue::DInt(5)));
        assert_eq!(second.await.unwrap().unwrap(), Some(TagValue::DInt(5)));
        assert_eq!(mock.read_count("X"), 1);
        assert_eq!(ctx.queue.pending_count(), 0);
    }

    #[tokio::test]
    async fn newer_write_cancels_the_queued_one() {
        let mock = mock();
        let ctx = context(&mock, 100).await;

        let old = ctx.queue.enqueue_write("Y", TagValue::DInt(1));
        let new = ctx.queue.enqueue_write("Y", TagValue::DInt(2));

        assert_eq!(
            old.await.unwrap().unwrap_err(),
            LogixError::Canceled {
                tag_name: "Y".to_string()
            }
        );

        ctx.queue.process_cycle(&ctx).await;
        assert_eq!(new.await.unwrap().unwrap(), None);
        assert_eq!(mock.writes_to("Y"), vec![vec![2, 0, 0, 0]]);
    }

    #[tokio::test]
    async fn writes_drain_before_reads_within_the_budget() {
        let mock = mock();
        let ctx = context(&mock, 2).await;

        let read = ctx.queue.enqueue_read("Y");
        let w1 = ctx.queue.enqueue_write("X", TagValue::DInt(7));
        let w2 = ctx.queue.enqueue_write("Y", TagValue::DInt(9));

        let stats = ctx.queue.process_cycle(&ctx).await;
        assert_eq!((stats.writes, stats.reads), (2, 0));
        assert!(w1.await.unwrap().is_ok());
        assert!(w2.await.unwrap().is_ok());
        assert!(ctx.queue.is_pending(OperationKind::Read, "Y"));

        let stats = ctx.queue.process_cycle(&ctx).await;
        assert_eq!(stats.reads, 1);
        assert_eq!(read.await.unwrap().unwrap(), Some(TagValue::DInt(9)));
    }

    #[tokio::test]
    async fn disconnected_cycle_fails_everything_fast() {
        let mock = mock();
        let ctx = context(&mock, 100).await;
        ctx.connection.mark_disconnected("test");

        let read = ctx.queue.enqueue_read("X");
        let write = ctx.queue.enqueue_write("Y", TagValue::DInt(1));
        let stats = ctx.queue.process_cycle(&ctx).await;

        assert_eq!(stats.failed_fast, 2);
        let not_connected = LogixError::NotConnected {
            target: "plc1".to_string(),
        };
        assert_eq!(read.await.unwrap().unwrap_err(), not_connected);
        assert_eq!(write.await.unwrap().unwrap_err(), not_connected);
        assert_eq!(mock.read_count("X"), 0);
        assert!(mock.writes_to("Y").is_empty());
    }

    #[tokio::test]
    async fn timeout_mid_cycle_fails_the_rest() {
        let mock = mock();
        let ctx = context(&mock, 100).await;
        mock.set_offline(true);

        let x = ctx.queue.enqueue_read("X");
        let y = ctx.queue.enqueue_read("Y");
        let stats = ctx.queue.process_cycle(&ctx).await;

        assert_eq!((stats.reads, stats.failed_fast), (1, 1));
        assert!(x.await.unwrap().unwrap_err().is_timeout());
        assert!(matches!(
            y.await.unwrap().unwrap_err(),
            LogixError::NotConnected { .. }
        ));
    }

    #[tokio::test]
    async fn closed_queue_rejects_new_work() {
        let mock = mock();
        let ctx = context(&mock, 100).await;
        let queued = ctx.queue.enqueue_read("X");

        ctx.queue.close();

        assert_eq!(queued.await.unwrap().unwrap_err(), LogixError::QueueClosed);
        assert_eq!(ctx.queue.read("X").await.unwrap_err(), LogixError::QueueClosed);

        ctx.queue.reopen();
        let reopened = ctx.queue.enqueue_read("X");
        ctx.queue.process_cycle(&ctx).await;
        assert_eq!(reopened.await.unwrap().unwrap(), Some(TagValue::DInt(5)));
    }
}
