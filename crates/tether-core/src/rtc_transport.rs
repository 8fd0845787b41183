//! [`PeerTransport`] backed by a WebRTC peer connection (webrtc-rs).
//!
//! Descriptions travel as the JSON form of `RTCSessionDescription`
//! (`{"type":"offer","sdp":"..."}`) and candidates as the JSON form of
//! `RTCIceCandidateInit`, the same shapes browser peers put on the relay.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::transport::{
    DescriptionKind, PeerTransport, TransportConfig, TransportError, TransportEvent,
    TransportFactory, TransportParts,
};

fn failed(e: webrtc::Error) -> TransportError {
    TransportError::Failed(e.to_string())
}

/// Creates one WebRTC peer connection per session.
#[derive(Clone, Debug, Default)]
pub struct RtcTransportFactory;

impl RtcTransportFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TransportFactory for RtcTransportFactory {
    async fn create(&self, config: &TransportConfig) -> Result<TransportParts, TransportError> {
        let mut media = MediaEngine::default();
        let registry = register_default_interceptors(Registry::new(), &mut media).map_err(failed)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = if config.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: config.ice_servers.clone(),
                ..Default::default()
            }]
        };
        let peer = api
            .new_peer_connection(RTCConfiguration {
                ice_servers,
                ..Default::default()
            })
            .await
            .map_err(failed)?;
        let peer = Arc::new(peer);

        let (events_tx, events) = mpsc::unbounded_channel();
        let channel = Arc::new(Mutex::new(None));
        watch_peer(&peer, &events_tx, &channel);

        Ok(TransportParts {
            transport: Box::new(RtcTransport {
                peer,
                channel,
                events: events_tx,
                closed: false,
            }),
            events,
        })
    }
}

fn watch_peer(
    peer: &RTCPeerConnection,
    events: &mpsc::UnboundedSender<TransportEvent>,
    channel: &Arc<Mutex<Option<Arc<RTCDataChannel>>>>,
) {
    let tx = events.clone();
    peer.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let tx = tx.clone();
        Box::pin(async move {
            // None marks the end of gathering.
            let Some(candidate) = candidate else {
                return;
            };
            match encode_candidate(&candidate) {
                Ok(line) => {
                    let _ = tx.send(TransportEvent::LocalCandidate(line));
                }
                Err(e) => warn!(error = %e, "failed to encode local candidate"),
            }
        })
    }));

    let tx = events.clone();
    peer.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let tx = tx.clone();
        Box::pin(async move {
            debug!(state = %state, "peer connection state changed");
            if state == RTCPeerConnectionState::Failed {
                let _ = tx.send(TransportEvent::Failed("peer connection failed".into()));
            }
        })
    }));

    // The answering side learns about the channel from the remote peer.
    let tx = events.clone();
    let slot = channel.clone();
    peer.on_data_channel(Box::new(move |remote: Arc<RTCDataChannel>| {
        let tx = tx.clone();
        let slot = slot.clone();
        Box::pin(async move {
            debug!(label = %remote.label(), "remote data channel announced");
            watch_channel(&remote, &tx);
            *slot.lock() = Some(remote);
        })
    }));
}

fn watch_channel(channel: &RTCDataChannel, events: &mpsc::UnboundedSender<TransportEvent>) {
    let tx = events.clone();
    channel.on_open(Box::new(move || {
        Box::pin(async move {
            let _ = tx.send(TransportEvent::ChannelOpen);
        })
    }));

    let tx = events.clone();
    channel.on_message(Box::new(move |message: DataChannelMessage| {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(TransportEvent::Data(message.data));
        })
    }));

    let tx = events.clone();
    channel.on_close(Box::new(move || {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(TransportEvent::ChannelClosed);
        })
    }));
}

fn encode_candidate(candidate: &RTCIceCandidate) -> Result<String, String> {
    let init = candidate.to_json().map_err(|e| e.to_string())?;
    serde_json::to_string(&init).map_err(|e| e.to_string())
}

fn encode_description(description: &RTCSessionDescription) -> Result<String, TransportError> {
    serde_json::to_string(description).map_err(|e| TransportError::InvalidDescription(e.to_string()))
}

fn decode_description(
    kind: DescriptionKind,
    text: &str,
) -> Result<RTCSessionDescription, TransportError> {
    let description: RTCSessionDescription = serde_json::from_str(text)
        .map_err(|e| TransportError::InvalidDescription(e.to_string()))?;
    let expected = match kind {
        DescriptionKind::Offer => RTCSdpType::Offer,
        DescriptionKind::Answer => RTCSdpType::Answer,
    };
    if description.sdp_type != expected {
        return Err(TransportError::InvalidDescription(format!(
            "expected {:?}, got {:?}",
            expected, description.sdp_type
        )));
    }
    Ok(description)
}

fn decode_candidate(text: &str) -> Result<RTCIceCandidateInit, TransportError> {
    serde_json::from_str(text).map_err(|e| TransportError::InvalidCandidate(e.to_string()))
}

pub struct RtcTransport {
    peer: Arc<RTCPeerConnection>,
    channel: Arc<Mutex<Option<Arc<RTCDataChannel>>>>,
    events: mpsc::UnboundedSender<TransportEvent>,
    closed: bool,
}

impl RtcTransport {
    fn ensure_live(&self) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl PeerTransport for RtcTransport {
    async fn create_data_channel(&mut self, label: &str) -> Result<(), TransportError> {
        self.ensure_live()?;
        let channel = self
            .peer
            .create_data_channel(label, None)
            .await
            .map_err(failed)?;
        watch_channel(&channel, &self.events);
        *self.channel.lock() = Some(channel);
        Ok(())
    }

    async fn create_offer(&mut self) -> Result<String, TransportError> {
        self.ensure_live()?;
        let offer = self.peer.create_offer(None).await.map_err(failed)?;
        self.peer
            .set_local_description(offer.clone())
            .await
            .map_err(failed)?;
        encode_description(&offer)
    }

    async fn create_answer(&mut self) -> Result<String, TransportError> {
        self.ensure_live()?;
        if self.peer.remote_description().await.is_none() {
            return Err(TransportError::NoRemoteDescription);
        }
        let answer = self.peer.create_answer(None).await.map_err(failed)?;
        self.peer
            .set_local_description(answer.clone())
            .await
            .map_err(failed)?;
        encode_description(&answer)
    }

    async fn set_remote_description(
        &mut self,
        kind: DescriptionKind,
        description: &str,
    ) -> Result<(), TransportError> {
        self.ensure_live()?;
        let description = decode_description(kind, description)?;
        self.peer
            .set_remote_description(description)
            .await
            .map_err(|e| TransportError::InvalidDescription(e.to_string()))
    }

    async fn add_ice_candidate(&mut self, candidate: &str) -> Result<(), TransportError> {
        self.ensure_live()?;
        if self.peer.remote_description().await.is_none() {
            return Err(TransportError::NoRemoteDescription);
        }
        let candidate = decode_candidate(candidate)?;
        self.peer
            .add_ice_candidate(candidate)
            .await
            .map_err(|e| TransportError::InvalidCandidate(e.to_string()))
    }

    async fn send(&mut self, data: Bytes) -> Result<(), TransportError> {
        self.ensure_live()?;
        let channel = self
            .channel
            .lock()
            .clone()
            .ok_or(TransportError::ChannelNotOpen)?;
        if channel.ready_state() != RTCDataChannelState::Open {
            return Err(TransportError::ChannelNotOpen);
        }
        channel.send(&data).await.map_err(failed)?;
        Ok(())
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.peer.close().await {
            debug!(error = %e, "peer connection close failed");
        }
    }
}

impl Drop for RtcTransport {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let peer = self.peer.clone();
        runtime.spawn(async move {
            let _ = peer.close().await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_description_kind_must_match() {
        let answer = r#"{"type":"answer","sdp":"v=0\r\n"}"#;
        assert!(decode_description(DescriptionKind::Answer, answer).is_ok());
        assert!(matches!(
            decode_description(DescriptionKind::Offer, answer),
            Err(TransportError::InvalidDescription(_))
        ));
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(matches!(
            decode_description(DescriptionKind::Offer, "loopback offer 1"),
            Err(TransportError::InvalidDescription(_))
        ));
        assert!(matches!(
            decode_candidate("not json"),
            Err(TransportError::InvalidCandidate(_))
        ));
    }

    #[test]
    fn test_candidate_json_shape() {
        let init = decode_candidate(
            r#"{"candidate":"candidate:1 1 udp 2130706431 10.0.0.2 50000 typ host","sdpMid":"0"}"#,
        )
        .unwrap();
        assert!(init.candidate.ends_with("typ host"));
        assert_eq!(init.sdp_mid.as_deref(), Some("0"));
    }

    #[tokio::test]
    async fn test_answer_needs_remote_offer() {
        let mut parts = RtcTransportFactory::new()
            .create(&TransportConfig {
                ice_servers: Vec::new(),
                channel_label: "chat".into(),
            })
            .await
            .unwrap();
        assert_eq!(
            parts.transport.create_answer().await,
            Err(TransportError::NoRemoteDescription)
        );
        assert_eq!(
            parts.transport.send(Bytes::from_static(b"x")).await,
            Err(TransportError::ChannelNotOpen)
        );
        parts.transport.close().await;
        assert_eq!(
            parts.transport.create_offer().await,
            Err(TransportError::Closed)
        );
    }
}
