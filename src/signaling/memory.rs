//! Брокер в памяти процесса: тесты и mesh внутри одного хоста

use crate::error::{MeshError, Result};
use crate::signaling::transport::{Delivery, SignalingTransport};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

type Subscribers = HashMap<String, Vec<(u64, mpsc::UnboundedSender<String>)>>;

#[derive(Clone, Default)]
pub struct MemoryBroker {
    topics: Arc<Mutex<Subscribers>>,
    next_client: Arc<AtomicU64>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Новый клиент брокера
    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport {
            broker: self.clone(),
            client_id: self.next_client.fetch_add(1, Ordering::Relaxed) + 1,
            connected: AtomicBool::new(false),
        }
    }

    /// Наблюдатель за всем трафиком топика
    pub async fn tap(&self, topic: &str) -> mpsc::UnboundedReceiver<String> {
        let client_id = self.next_client.fetch_add(1, Ordering::Relaxed) + 1;
        self.attach(client_id, topic).await
    }

    async fn attach(&self, client_id: u64, topic: &str) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.topics
            .lock()
            .await
            .entry(topic.to_string())
            .or_default()
            .push((client_id, tx));
        rx
    }

    async fn detach(&self, client_id: u64, topic: Option<&str>) {
        let mut topics = self.topics.lock().await;
        for (name, subscribers) in topics.iter_mut() {
            if topic.map_or(true, |t| t == name) {
                subscribers.retain(|(id, _)| *id != client_id);
            }
        }
        topics.retain(|_, subscribers| !subscribers.is_empty());
    }

    async fn deliver(&self, topic: &str, payload: &str) -> usize {
        let mut topics = self.topics.lock().await;
        let Some(subscribers) = topics.get_mut(topic) else {
            return 0;
        };
        // закрытые получатели выбрасываем по пути
        subscribers.retain(|(_, tx)| tx.send(payload.to_string()).is_ok());
        subscribers.len()
    }
}

pub struct MemoryTransport {
    broker: MemoryBroker,
    client_id: u64,
    connected: AtomicBool,
}

impl MemoryTransport {
    fn ensure_connected(&self) -> Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(MeshError::transport("memory transport is not connected"))
        }
    }
}

#[async_trait]
impl SignalingTransport for MemoryTransport {
    async fn connect(&self) -> Result<()> {
        self.connected.store(true, Ordering::SeqCst);
        debug!("Memory transport {} connected", self.client_id);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<mpsc::UnboundedReceiver<String>> {
        self.ensure_connected()?;
        Ok(self.broker.attach(self.client_id, topic).await)
    }

    async fn publish(&self, topic: &str, payload: String) -> Result<Delivery> {
        self.ensure_connected()?;
        let receivers = self.broker.deliver(topic, &payload).await;
        Ok(Delivery { receivers })
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.broker.detach(self.client_id, Some(topic)).await;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        self.broker.detach(self.client_id, None).await;
        debug!("Memory transport {} disconnected", self.client_id);
        Ok(())
    }
}
