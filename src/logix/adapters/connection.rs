//! 连接状态（connection）：每个目标控制器一份。
//!
//! 规则：
//! - 所有传输调用都经过 `guarded`，统一套用目标超时
//! - 任一调用成功即置为 `Connected`；超时置为 `Disconnected`
//! - 其他传输错误只让当前调用失败，不改变连接状态
//! - 这里不做重试；重连由探测任务负责

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::info;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use super::transport::TransportError;
use crate::logix::error::LogixError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

pub struct ConnectionMonitor {
    target: String,
    changed_at: Mutex<DateTime<Utc>>,
    state_tx: watch::Sender<ConnectionState>,
}

impl ConnectionMonitor {
    pub fn new(target: impl Into<String>) -> Self {
        let (state_tx, _rx) = watch::channel(ConnectionState::Disconnected);
        Self {
            target: target.into(),
            changed_at: Mutex::new(Utc::now()),
            state_tx,
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn changed_at(&self) -> DateTime<Utc> {
        *self.changed_at.lock()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn mark_connected(&self) {
        self.transition(ConnectionState::Connected, "ok");
    }

    pub fn mark_disconnected(&self, reason: &str) {
        self.transition(ConnectionState::Disconnected, reason);
    }

    fn transition(&self, next: ConnectionState, reason: &str) {
        let changed = self.state_tx.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            *state = next;
            true
        });
        if changed {
            *self.changed_at.lock() = Utc::now();
            info!(
                "[logix][conn] target={} state={:?} reason={}",
                self.target, next, reason
            );
        }
    }

    /// Runs one transport call under `timeout` and updates the state from its outcome.
    pub async fn guarded<T, F>(&self, timeout: Duration, call: F) -> Result<T, LogixError>
    where
        F: Future<Output = Result<T, TransportError>>,
    {
        let res = match tokio::time::timeout(timeout, call).await {
            Ok(v) => v,
            Err(_) => Err(TransportError::Timeout),
        };
        match res {
            Ok(v) => {
                self.mark_connected();
                Ok(v)
            }
            Err(TransportError::Timeout) => {
                self.mark_disconnected("timeout");
                Err(LogixError::TransportTimeout)
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// Resolves once `stop_rx` reads `true`; never resolves if the sender is gone.
pub async fn wait_stop(mut stop_rx: watch::Receiver<bool>) {
    loop {
        if *stop_rx.borrow() {
            return;
        }
        if stop_rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn success_connects_and_timeout_disconnects() {
        let monitor = ConnectionMonitor::new("plc1");
        assert!(!monitor.is_connected());

        let v = monitor
            .guarded(Duration::from_millis(50), async { Ok::<_, TransportError>(7) })
            .await
            .unwrap();
        assert_eq!(v, 7);
        assert!(monitor.is_connected());

        let err = monitor
            .guarded(Duration::from_millis(50), async {
                Err::<(), _>(TransportError::Timeout)
            })
            .await
            .unwrap_err();
        assert_eq!(err, LogixError::TransportTimeout);
        assert_eq!(monitor.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_call_is_cut_off_by_the_timeout() {
        let monitor = ConnectionMonitor::new("plc1");
        monitor.mark_connected();

        let err = monitor
            .guarded(
                Duration::from_millis(100),
                std::future::pending::<Result<(), TransportError>>(),
            )
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        assert!(!monitor.is_connected());
    }

    #[tokio::test]
    async fn comm_errors_leave_the_state_alone() {
        let monitor = ConnectionMonitor::new("plc1");
        monitor.mark_connected();
        let rx = monitor.subscribe();

        let err = monitor
            .guarded(Duration::from_millis(50), async {
                Err::<(), _>(TransportError::Comm {
                    message: "bad path".to_string(),
                })
            })
            .await
            .unwrap_err();

        assert_eq!(
            err,
            LogixError::Transport {
                message: "bad path".to_string()
            }
        );
        assert!(monitor.is_connected());
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn wait_stop_returns_after_stop_signal() {
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(wait_stop(rx));
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
