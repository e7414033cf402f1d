//! Сообщения сигнального канала
//!
//! ```text
//! { kind: "announce"|"sdp"|"candidate"|"leave"|"heartbeat",
//!   sender, recipient: id|null, sdpType?, sdp?, candidate? }
//! ```

use crate::error::Result;
use crate::peer::types::{IceCandidate, PeerId, SdpType, SessionDescription};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MessageBody {
    Announce,
    Sdp {
        #[serde(rename = "sdpType")]
        sdp_type: SdpType,
        sdp: String,
    },
    Candidate {
        candidate: IceCandidate,
    },
    Leave,
    Heartbeat,
}

impl MessageBody {
    pub fn kind(&self) -> &'static str {
        match self {
            MessageBody::Announce => "announce",
            MessageBody::Sdp { .. } => "sdp",
            MessageBody::Candidate { .. } => "candidate",
            MessageBody::Leave => "leave",
            MessageBody::Heartbeat => "heartbeat",
        }
    }
}

impl From<SessionDescription> for MessageBody {
    fn from(desc: SessionDescription) -> Self {
        MessageBody::Sdp {
            sdp_type: desc.sdp_type,
            sdp: desc.sdp,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SignalingMessage {
    #[serde(flatten)]
    pub body: MessageBody,
    pub sender: PeerId,
    /// None = всем подписчикам канала
    #[serde(default)]
    pub recipient: Option<PeerId>,
}

impl SignalingMessage {
    pub fn new(body: MessageBody, sender: PeerId, recipient: Option<PeerId>) -> Self {
        Self {
            body,
            sender,
            recipient,
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.recipient.is_none()
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}
