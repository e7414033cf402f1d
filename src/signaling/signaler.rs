use crate::error::Result;
use crate::peer::types::PeerId;
use crate::signaling::message::{MessageBody, SignalingMessage};
use crate::signaling::transport::{Delivery, SignalingTransport};
use std::sync::Arc;
use tracing::{debug, warn};

/// Отправка сообщений в топик встречи от имени локального пира
#[derive(Clone)]
pub struct Signaler {
    transport: Arc<dyn SignalingTransport>,
    topic: Arc<str>,
    local_id: PeerId,
}

impl Signaler {
    pub fn new(transport: Arc<dyn SignalingTransport>, topic: impl Into<Arc<str>>, local_id: PeerId) -> Self {
        Self {
            transport,
            topic: topic.into(),
            local_id,
        }
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub async fn send(&self, body: MessageBody, recipient: Option<&PeerId>) -> Result<Delivery> {
        let kind = body.kind();
        let message = SignalingMessage::new(body, self.local_id.clone(), recipient.cloned());
        let payload = message.encode()?;

        match self.transport.publish(&self.topic, payload).await {
            Ok(delivery) => {
                debug!(
                    "Sent {kind} to {} ({} receivers)",
                    recipient.map_or("everyone", |r| r.as_str()),
                    delivery.receivers
                );
                Ok(delivery)
            }
            Err(e) => {
                // повторов нет: ждём следующего естественного триггера
                warn!("Failed to publish {kind} on {}: {e}", self.topic);
                Err(e)
            }
        }
    }

    pub async fn broadcast(&self, body: MessageBody) -> Result<Delivery> {
        self.send(body, None).await
    }

    pub async fn unicast(&self, body: MessageBody, recipient: &PeerId) -> Result<Delivery> {
        self.send(body, Some(recipient)).await
    }
}
