//! 订阅轮询：固定周期读取热点标签，并用计数器跟踪陈旧度。
//!
//! 规则：
//! - 每个 tick 先把所有订阅的计数 +1，计数 >= `STALE_THRESHOLD` 即视为陈旧
//! - 同一时刻最多一个轮询周期在执行；上一周期未结束时本 tick 只累加计数
//! - 断线时不发起读取；单个标签读成功即清零它的计数，失败则保持陈旧
//! - 新订阅从陈旧开始，直到第一次成功轮询
//! - 收到停止信号后，进行中的周期在下一个标签前（或当前读取中）退出；轮询任务等它结束后才返回

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::context::{DriverContext, TagHandle};
use crate::logix::adapters::connection::wait_stop;

pub const STALE_THRESHOLD: u32 = 2;

pub struct Subscription {
    handle: Arc<TagHandle>,
    staleness: AtomicU32,
}

impl Subscription {
    fn new(handle: Arc<TagHandle>) -> Self {
        Self {
            handle,
            staleness: AtomicU32::new(STALE_THRESHOLD),
        }
    }

    pub fn handle(&self) -> &Arc<TagHandle> {
        &self.handle
    }

    pub fn staleness(&self) -> u32 {
        self.staleness.load(Ordering::Acquire)
    }

    pub fn is_fresh(&self) -> bool {
        self.staleness() < STALE_THRESHOLD
    }

    fn age(&self) {
        let _ = self
            .staleness
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_add(1)));
    }

    fn mark_fresh(&self) {
        self.staleness.store(0, Ordering::Release);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollOutcome {
    /// A previous cycle was still running.
    Busy,
    Disconnected,
    Completed { refreshed: usize, failed: usize },
}

pub struct SubscriptionRegistry {
    entries: RwLock<HashMap<String, Arc<Subscription>>>,
    in_flight: AtomicBool,
    cycles_started: AtomicU64,
    cycles_done: watch::Sender<u64>,
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        let (cycles_done, _rx) = watch::channel(0);
        Self {
            entries: RwLock::new(HashMap::new()),
            in_flight: AtomicBool::new(false),
            cycles_started: AtomicU64::new(0),
            cycles_done,
        }
    }

    /// Returns false if `path` was already subscribed.
    pub fn subscribe(&self, path: &str, handle: Arc<TagHandle>) -> bool {
        let mut entries = self.entries.write();
        if entries.contains_key(path) {
            return false;
        }
        entries.insert(path.to_string(), Arc::new(Subscription::new(handle)));
        true
    }

    pub fn unsubscribe(&self, path: &str) -> bool {
        self.entries.write().remove(path).is_some()
    }

    pub fn get(&self, path: &str) -> Option<Arc<Subscription>> {
        self.entries.read().get(path).cloned()
    }

    pub fn is_fresh(&self, path: &str) -> bool {
        self.get(path).is_some_and(|s| s.is_fresh())
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn is_polling(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    fn age_all(&self) {
        for entry in self.entries.read().values() {
            entry.age();
        }
    }

    fn snapshot(&self) -> Vec<(String, Arc<Subscription>)> {
        let mut list: Vec<_> = self
            .entries
            .read()
            .iter()
            .map(|(path, sub)| (path.clone(), Arc::clone(sub)))
            .collect();
        list.sort_by(|a, b| a.0.cmp(&b.0));
        list
    }

    fn try_begin(&self) -> Option<CycleGuard<'_>> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }
        let seq = self.cycles_started.fetch_add(1, Ordering::AcqRel) + 1;
        Some(CycleGuard {
            registry: self,
            seq,
        })
    }

    /// Returns once no poll cycle is running.
    pub async fn wait_until_idle(&self) {
        let mut rx = self.cycles_done.subscribe();
        let target = self.cycles_started.load(Ordering::Acquire);
        let _ = rx
            .wait_for(|done| *done >= target || !self.is_polling())
            .await;
    }

    /// Returns after a cycle that started after this call has finished.
    pub async fn wait_for_next_cycle(&self) {
        let mut rx = self.cycles_done.subscribe();
        let target = self.cycles_started.load(Ordering::Acquire) + 1;
        let _ = rx.wait_for(|done| *done >= target).await;
    }
}

struct CycleGuard<'a> {
    registry: &'a SubscriptionRegistry,
    seq: u64,
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.registry.in_flight.store(false, Ordering::Release);
        self.registry.cycles_done.send_replace(self.seq);
    }
}

/// One poll tick.
pub async fn poll_once(ctx: &DriverContext) -> PollOutcome {
    run_cycle(ctx, None).await
}

/// With a stop receiver the cycle gives up at the next tag, or drops the read in flight.
async fn run_cycle(ctx: &DriverContext, stop: Option<watch::Receiver<bool>>) -> PollOutcome {
    let registry = &ctx.subscriptions;
    registry.age_all();

    let Some(_cycle) = registry.try_begin() else {
        debug!("[logix][poll] target={} skip: previous cycle in flight", ctx.target());
        return PollOutcome::Busy;
    };
    if !ctx.connection.is_connected() {
        return PollOutcome::Disconnected;
    }

    let mut refreshed = 0;
    let mut failed = 0;
    for (path, sub) in registry.snapshot() {
        let result = match &stop {
            Some(stop) => {
                if *stop.borrow() {
                    debug!("[logix][poll] target={} stopped before tag={}", ctx.target(), path);
                    break;
                }
                tokio::select! {
                    biased;
                    _ = wait_stop(stop.clone()) => {
                        debug!("[logix][poll] target={} stopped during tag={}", ctx.target(), path);
                        break;
                    }
                    result = ctx.refresh(sub.handle()) => result,
                }
            }
            None => ctx.refresh(sub.handle()).await,
        };
        match result {
            Ok(()) => {
                sub.mark_fresh();
                refreshed += 1;
            }
            Err(err) if err.is_timeout() => {
                warn!("[logix][poll] target={} tag={} timeout", ctx.target(), path);
                failed += 1;
                break;
            }
            Err(err) => {
                warn!("[logix][poll] target={} tag={} err={}", ctx.target(), path, err);
                failed += 1;
            }
        }
    }
    PollOutcome::Completed { refreshed, failed }
}

/// Ticks at the subscription rate. A cycle runs in its own task so a slow one
/// makes the next tick skip instead of queueing behind it; the poller only
/// exits after that task has observed the stop signal and returned.
pub fn spawn_poller(ctx: Arc<DriverContext>, stop_rx: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(ctx.config.subscription_rate());
        let stop = wait_stop(stop_rx.clone());
        tokio::pin!(stop);
        let mut cycle: Option<JoinHandle<PollOutcome>> = None;

        loop {
            tokio::select! {
                _ = &mut stop => break,
                _ = ticker.tick() => {
                    if cycle.as_ref().is_some_and(|task| !task.is_finished()) {
                        ctx.subscriptions.age_all();
                        debug!("[logix][poll] target={} skip: previous cycle in flight", ctx.target());
                        continue;
                    }
                    let ctx = Arc::clone(&ctx);
                    let stop_rx = stop_rx.clone();
                    cycle = Some(tokio::spawn(async move { run_cycle(&ctx, Some(stop_rx)).await }));
                }
            }
        }

        if let Some(task) = cycle {
            let _ = task.await;
        }
    })
}
