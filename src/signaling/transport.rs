use crate::error::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Итог публикации: сколько подписчиков получили сообщение
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub receivers: usize,
}

/// Канал publish/subscribe, используемый только для сигналинга
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    async fn connect(&self) -> Result<()>;

    /// Входящие сообщения топика, в порядке доставки
    async fn subscribe(&self, topic: &str) -> Result<mpsc::UnboundedReceiver<String>>;

    async fn publish(&self, topic: &str, payload: String) -> Result<Delivery>;

    async fn unsubscribe(&self, topic: &str) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;
}
