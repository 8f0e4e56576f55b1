//! 审计日志
//!
//! 请求路径上只做非阻塞入队；独立的持久化任务从有界通道读取并写库。
//! 所有发送端释放后，持久化任务处理完缓冲中的记录再退出。

use crate::metrics::Metrics;
use oculus_database::{NewAuditEntry, Store};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

/// 审计记录发送端
#[derive(Clone, Debug)]
pub struct AuditLogger {
    sender: mpsc::Sender<NewAuditEntry>,
    metrics: Metrics,
}

/// 审计记录持久化任务
pub struct AuditPersister {
    receiver: mpsc::Receiver<NewAuditEntry>,
    store: Arc<dyn Store>,
    metrics: Metrics,
}

/// 创建审计通道
pub fn audit_channel(
    capacity: usize,
    store: Arc<dyn Store>,
    metrics: Metrics,
) -> (AuditLogger, AuditPersister) {
    let (sender, receiver) = mpsc::channel(capacity.max(1));
    (
        AuditLogger {
            sender,
            metrics: metrics.clone(),
        },
        AuditPersister {
            receiver,
            store,
            metrics,
        },
    )
}

impl AuditLogger {
    /// 入队一条审计记录；通道已满或关闭时丢弃并计数，从不阻塞调用方
    pub fn log(&self, entry: NewAuditEntry) {
        match self.sender.try_send(entry) {
            Ok(()) => {}
            Err(TrySendError::Full(entry)) => {
                self.metrics.record_audit_dropped();
                warn!("Audit channel full, dropping {} {}", entry.action.as_str(), entry.entity);
            }
            Err(TrySendError::Closed(entry)) => {
                self.metrics.record_audit_dropped();
                warn!("Audit channel closed, dropping {} {}", entry.action.as_str(), entry.entity);
            }
        }
    }
}

impl AuditPersister {
    /// 运行直到所有发送端释放且缓冲被清空
    pub async fn run(mut self) {
        info!("Audit persister started");
        let mut written = 0u64;
        while let Some(entry) = self.receiver.recv().await {
            match self.store.insert_audit(entry).await {
                Ok(saved) => {
                    written += 1;
                    self.metrics.record_audit_written();
                    debug!("Audit entry {} persisted ({} {})", saved.id, saved.action.as_str(), saved.entity);
                }
                Err(e) => warn!("Failed to persist audit entry: {}", e),
            }
        }
        info!("Audit persister drained after {} entries", written);
    }
}
