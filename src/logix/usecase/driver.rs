//! 驱动门面（LogixDriver）：一个目标控制器的对外接口。
//!
//! 生命周期：
//! - `new`：校验配置，初始状态为 `Disconnected`
//! - `start`：身份探测 →（可选）整表浏览 → 启动轮询/队列/重连三个后台任务
//! - `stop`：发送停止信号，最多等待 1s 回收任务，队列中的操作以 `QueueClosed` 结束
//!
//! 读路径：已订阅且未陈旧 → 直接解码轮询缓冲区；断线 → `NotConnected`；否则入队合并读。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::context::DriverContext;
use super::loader::{self, ProgramSelector};
use super::queue::spawn_processor;
use super::subscription::spawn_poller;
use crate::logix::adapters::connection::{wait_stop, ConnectionState};
use crate::logix::adapters::transport::Transport;
use crate::logix::config::{ConfigError, TargetConfig};
use crate::logix::core::model::{TagNode, TagValue, TypeArena};
use crate::logix::core::symbols::{SymbolSnapshot, SymbolTable};
use crate::logix::error::LogixError;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TargetDiagnostics {
    pub connection_state: ConnectionState,
    /// `"<model> v<major>.<minor>"` once an identity probe has succeeded.
    pub controller: Option<String>,
    pub tag_count: usize,
    pub subscribed_count: usize,
    pub state_changed_utc: DateTime<Utc>,
}

struct RunHandle {
    stop_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

pub struct LogixDriver {
    ctx: Arc<DriverContext>,
    run: Mutex<Option<RunHandle>>,
}

impl LogixDriver {
    pub fn new(config: TargetConfig, transport: Arc<dyn Transport>) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            ctx: Arc::new(DriverContext::new(config, transport)),
            run: Mutex::new(None),
        })
    }

    pub fn target(&self) -> &str {
        self.ctx.target()
    }

    pub fn config(&self) -> &TargetConfig {
        &self.ctx.config
    }

    pub fn is_running(&self) -> bool {
        self.run.lock().is_some()
    }

    /// A failed probe leaves the target disconnected; the reconnect task keeps trying.
    pub async fn start(&self) -> Result<(), LogixError> {
        if self.is_running() {
            return Ok(());
        }
        self.ctx.queue.reopen();

        match self.ctx.read_identity().await {
            Ok(identity) => info!(
                "[logix][start] target={} controller={}",
                self.target(),
                identity
            ),
            Err(err) => warn!("[logix][start] target={} probe failed: {}", self.target(), err),
        }

        if self.ctx.config.tag_browser && self.ctx.connection.is_connected() {
            let selector = self.ctx.config.programs.clone();
            self.load_tags(selector).await?;
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let joins = vec![
            spawn_poller(Arc::clone(&self.ctx), stop_rx.clone()),
            spawn_processor(Arc::clone(&self.ctx), stop_rx.clone()),
            spawn_reconnect(Arc::clone(&self.ctx), stop_rx),
        ];

        let mut run = self.run.lock();
        if run.is_some() {
            // Lost a race with a concurrent start.
            let _ = stop_tx.send(true);
            return Ok(());
        }
        *run = Some(RunHandle { stop_tx, joins });
        Ok(())
    }

    /// Returns false if a task did not finish within 1s.
    pub async fn stop(&self) -> bool {
        let handle = self.run.lock().take();
        let Some(handle) = handle else {
            return false;
        };

        let _ = handle.stop_tx.send(true);
        let mut clean = true;
        for join in handle.joins {
            match tokio::time::timeout(Duration::from_secs(1), join).await {
                Ok(joined) => clean &= joined.is_ok(),
                Err(_) => clean = false,
            }
        }
        self.ctx.queue.close();
        info!("[logix][stop] target={} clean={}", self.target(), clean);
        clean
    }

    /// Full browse into a fresh arena; replaces the symbol table and returns the root tags.
    pub async fn load_tags(&self, selector: ProgramSelector) -> Result<Vec<TagNode>, LogixError> {
        let _guard = self.ctx.load_lock.lock().await;
        let mut arena = TypeArena::new();
        let roots = loader::load_tags(&mut arena, &self.ctx.reader(), &selector).await?;

        let table = SymbolTable::new(arena, roots.clone());
        info!(
            "[logix][load] target={} roots={} paths={}",
            self.target(),
            roots.len(),
            table.len()
        );
        self.ctx.replace_symbols(table);
        Ok(roots)
    }

    /// Adds one path to the current table without a full browse.
    pub async fn load_tag_definition(&self, path: &str) -> Result<TagNode, LogixError> {
        let _guard = self.ctx.load_lock.lock().await;
        let current = self.ctx.symbols();
        if let Some(node) = current.get(path) {
            return Ok(node.clone());
        }

        let mut arena = current.arena().clone();
        let node = loader::load_tag_definition(&mut arena, &self.ctx.reader(), path).await?;
        let mut table = (*current).clone().with_arena(arena);
        table.insert_root(node.clone());
        self.ctx.replace_symbols(table);
        debug!("[logix][load] target={} defined tag={}", self.target(), path);
        Ok(node)
    }

    pub async fn read_tag_value(&self, path: &str) -> Result<TagValue, LogixError> {
        let tag = self.ctx.resolve(path)?;

        if let Some(sub) = self.ctx.subscriptions.get(path) {
            if sub.is_fresh() {
                return self.ctx.decode_cached(&tag, sub.handle()).await;
            }
        }
        self.ensure_connected()?;
        self.ctx.queue.read(path).await
    }

    pub async fn write_tag_value(&self, path: &str, value: TagValue) -> Result<(), LogixError> {
        self.ctx.resolve(path)?;
        self.ensure_connected()?;
        self.ctx.queue.write(path, value).await
    }

    /// For callers outside the runtime; panics if called from a runtime thread.
    pub fn read_tag_value_blocking(&self, rt: &Handle, path: &str) -> Result<TagValue, LogixError> {
        rt.block_on(self.read_tag_value(path))
    }

    pub fn write_tag_value_blocking(
        &self,
        rt: &Handle,
        path: &str,
        value: TagValue,
    ) -> Result<(), LogixError> {
        rt.block_on(self.write_tag_value(path, value))
    }

    /// Subscribing an already subscribed path is a no-op.
    pub fn subscribe(&self, path: &str) -> Result<(), LogixError> {
        let tag = self.ctx.resolve(path)?;
        let handle = self.ctx.handle_for(path, tag.element_count);
        if self.ctx.subscriptions.subscribe(path, handle) {
            debug!("[logix][sub] target={} tag={} subscribed", self.target(), path);
        }
        Ok(())
    }

    pub fn unsubscribe(&self, path: &str) -> bool {
        self.ctx.subscriptions.unsubscribe(path)
    }

    pub fn is_connected(&self) -> bool {
        self.ctx.connection.is_connected()
    }

    /// Heartbeat probe; success marks the target connected.
    pub async fn read_controller_identity(&self) -> Result<String, LogixError> {
        Ok(self.ctx.read_identity().await?.to_string())
    }

    pub fn symbols(&self) -> Arc<SymbolTable> {
        self.ctx.symbols()
    }

    pub fn snapshot_symbols(&self) -> SymbolSnapshot {
        self.ctx.symbols().snapshot()
    }

    /// Installs a cached table so reads work without a live browse.
    pub fn restore_symbols(&self, snapshot: SymbolSnapshot) -> Result<(), LogixError> {
        let table = SymbolTable::from_snapshot(snapshot)?;
        info!(
            "[logix][load] target={} restored paths={}",
            self.target(),
            table.len()
        );
        self.ctx.replace_symbols(table);
        Ok(())
    }

    pub fn diagnostics(&self) -> TargetDiagnostics {
        TargetDiagnostics {
            connection_state: self.ctx.connection.state(),
            controller: self.ctx.identity().map(|id| id.to_string()),
            tag_count: self.ctx.symbols().len(),
            subscribed_count: self.ctx.subscriptions.len(),
            state_changed_utc: self.ctx.connection.changed_at(),
        }
    }

    /// Waits for a full subscription poll cycle that starts after this call.
    pub async fn wait_for_poll(&self) {
        self.ctx.subscriptions.wait_for_next_cycle().await;
    }

    fn ensure_connected(&self) -> Result<(), LogixError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(LogixError::NotConnected {
                target: self.target().to_string(),
            })
        }
    }
}

fn spawn_reconnect(ctx: Arc<DriverContext>, stop_rx: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(ctx.config.reconnect_interval());
        let stop = wait_stop(stop_rx);
        tokio::pin!(stop);

        loop {
            tokio::select! {
                _ = &mut stop => break,
                _ = ticker.tick() => {
                    if ctx.connection.is_connected() {
                        continue;
                    }
                    match ctx.read_identity().await {
                        Ok(identity) => info!(
                            "[logix][reconnect] target={} controller={}",
                            ctx.target(),
                            identity
                        ),
                        Err(err) => debug!(
                            "[logix][reconnect] target={} probe failed: {}",
                            ctx.target(),
                            err
                        ),
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::logix::adapters::transport::mock::{MockTransport, TagFixture};
    use crate::logix::core::model::codes;

    fn config() -> TargetConfig {
        let mut config = TargetConfig::new("plc1", "10.0.0.5");
        config.timeout_ms = 200;
        config.queue_rate_ms = 10;
        config.subscription_rate_ms = 20;
        config.reconnect_interval_ms = 50;
        config
    }

    #[test]
    fn invalid_config_is_rejected_up_front() {
        let mut bad = config();
        bad.queue_rate_ms = 0;
        let err = LogixDriver::new(bad, Arc::new(MockTransport::new()))
            .err()
            .unwrap();
        assert!(matches!(err, ConfigError::Invalid { field: "queueRateMs", .. }));
    }

    #[tokio::test]
    async fn start_probes_and_browses() {
        let mock = Arc::new(
            MockTransport::new()
                .with_tag_list(&[TagFixture::new("Counter", codes::DINT)])
                .with_tag("Counter", vec![3, 0, 0, 0]),
        );
        let driver = LogixDriver::new(config(), mock.clone()).unwrap();
        assert!(!driver.is_connected());

        driver.start().await.unwrap();

        assert!(driver.is_connected());
        assert!(driver.symbols().get("Counter").is_some());
        let diag = driver.diagnostics();
        assert_eq!(diag.connection_state, ConnectionState::Connected);
        assert_eq!(diag.controller.as_deref(), Some("1756-L83E/B v33.11"));
        assert_eq!(diag.tag_count, 1);

        assert_eq!(driver.read_tag_value("Counter").await.unwrap(), TagValue::DInt(3));
        assert!(driver.stop().await);
        assert!(!driver.stop().await);
    }

    #[tokio::test]
    async fn reloading_tags_does_not_grow_the_arena() {
        let mock = Arc::new(
            MockTransport::new()
                .with_tag_list(&[
                    TagFixture::new("Counter", codes::DINT),
                    TagFixture::new("Arr", 0x20C4).dims([3, 0, 0]),
                ])
                .with_tag("Counter", vec![3, 0, 0, 0]),
        );
        let driver = LogixDriver::new(config(), mock).unwrap();
        driver.start().await.unwrap();
        let types = driver.symbols().arena().len();

        driver.load_tags(ProgramSelector::All).await.unwrap();
        driver.load_tags(ProgramSelector::All).await.unwrap();

        assert_eq!(driver.symbols().arena().len(), types);
        assert!(driver.symbols().get("Arr[2]").is_some());
        driver.stop().await;
    }

    #[tokio::test]
    async fn unknown_paths_fail_before_touching_the_queue() {
        let driver = LogixDriver::new(config(), Arc::new(MockTransport::new())).unwrap();

        assert_eq!(
            driver.read_tag_value("Nope").await.unwrap_err(),
            LogixError::TagNotFound {
                name: "Nope".to_string()
            }
        );
        assert!(driver.subscribe("Nope").is_err());
        assert_eq!(driver.diagnostics().subscribed_count, 0);
    }

    #[tokio::test]
    async fn diagnostics_serialize_in_camel_case() {
        let driver = LogixDriver::new(config(), Arc::new(MockTransport::new())).unwrap();
        let json = serde_json::to_value(driver.diagnostics()).unwrap();

        assert_eq!(json["connectionState"], "Disconnected");
        assert_eq!(json["tagCount"], 0);
        assert!(json["controller"].is_null());
        assert!(json.get("stateChangedUtc").is_some());
    }
}
