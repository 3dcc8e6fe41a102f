use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

use crate::job::JobKey;

/// 订阅者信息
#[derive(Debug, Clone)]
pub struct SubscriberInfo {
    pub subscriber_id: String,
    pub remote_addr: Option<String>,
    pub attached_at: Instant,
}

impl SubscriberInfo {
    pub fn new(subscriber_id: impl Into<String>, remote_addr: Option<String>) -> Self {
        Self {
            subscriber_id: subscriber_id.into(),
            remote_addr,
            attached_at: Instant::now(),
        }
    }
}

/// 任务上下文（管理单个 (设备, 用途) 的订阅者）
///
/// 按任务键存在，任务重启时保留订阅者
#[derive(Clone)]
pub struct JobContext {
    pub key: JobKey,
    clients: Arc<RwLock<HashMap<String, SubscriberInfo>>>,
}

impl JobContext {
    pub fn new(key: JobKey) -> Self {
        Self {
            key,
            clients: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// 添加订阅者，返回当前订阅者数量
    pub async fn add_client(&self, client: SubscriberInfo) -> usize {
        let mut clients = self.clients.write().await;
        clients.insert(client.subscriber_id.clone(), client);
        clients.len()
    }

    /// 移除订阅者，返回剩余数量；重复移除无副作用
    pub async fn remove_client(&self, subscriber_id: &str) -> usize {
        let mut clients = self.clients.write().await;
        clients.remove(subscriber_id);
        clients.len()
    }

    pub async fn get_client_count(&self) -> usize {
        let clients = self.clients.read().await;
        clients.len()
    }

    pub async fn list_clients(&self) -> Vec<SubscriberInfo> {
        let clients = self.clients.read().await;
        clients.values().cloned().collect()
    }
}
