//! Broker sessions used by the bridge.
//!
//! [`BrokerConnector`] and [`BrokerSession`] are the seam between the bridge's
//! reconnect loop and the MQTT client. [`MqttConnector`] is the `rumqttc`
//! implementation used by the binary.

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    SubscribeReasonCode,
};
use std::collections::VecDeque;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace};

/// Broker session errors.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Connection failed: {0}")]
    Connection(String),
    #[error("Broker refused connection: {0}")]
    Refused(String),
    #[error("Subscribe to '{topic}' failed: {message}")]
    Subscribe { topic: String, message: String },
    #[error("Connection lost: {0}")]
    Lost(String),
}

/// Parameters for opening a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionParams {
    pub client_id: String,
    pub host: String,
    pub port: u16,
    /// Empty user name means anonymous
    pub user: String,
    pub password: String,
    pub keep_alive: Duration,
}

/// A message received from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Opens broker sessions.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    type Session: BrokerSession;

    /// Open a session. Returns once the broker has accepted the connection.
    async fn connect(&self, params: &SessionParams) -> Result<Self::Session, SessionError>;
}

/// An established broker session.
#[async_trait]
pub trait BrokerSession: Send {
    /// Subscribe to `topic`. Returns once the broker has acknowledged it.
    async fn subscribe(&mut self, topic: &str) -> Result<(), SessionError>;

    /// Wait for the next message.
    ///
    /// `Ok(None)` means the session was closed without an error.
    async fn recv(&mut self) -> Result<Option<InboundMessage>, SessionError>;

    /// Close the session. Errors are not reported; the session is unusable
    /// afterwards either way.
    async fn disconnect(&mut self);
}

/// `rumqttc` backed connector.
#[derive(Debug, Clone)]
pub struct MqttConnector {
    /// Request channel capacity between client handle and event loop
    capacity: usize,
    /// How long to wait for the broker's CONNACK or a SUBACK
    ack_timeout: Duration,
}

impl MqttConnector {
    pub fn new(ack_timeout: Duration) -> Self {
        Self {
            capacity: 64,
            ack_timeout,
        }
    }
}

impl Default for MqttConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[async_trait]
impl BrokerConnector for MqttConnector {
    type Session = MqttSession;

    async fn connect(&self, params: &SessionParams) -> Result<MqttSession, SessionError> {
        if params.host.is_empty() {
            return Err(SessionError::Connection(
                "No broker address configured".to_string(),
            ));
        }

        let mut opts = MqttOptions::new(&params.client_id, &params.host, params.port);
        opts.set_keep_alive(params.keep_alive);
        opts.set_clean_session(true);
        if !params.user.is_empty() {
            opts.set_credentials(&params.user, &params.password);
        }

        let (client, mut event_loop) = AsyncClient::new(opts, self.capacity);

        tokio::time::timeout(self.ack_timeout, wait_for_connack(&mut event_loop))
            .await
            .map_err(|_| SessionError::Connection("Connection timeout".to_string()))??;

        debug!(host = %params.host, port = params.port, client_id = %params.client_id, "MQTT session established");

        Ok(MqttSession {
            client,
            event_loop,
            pending: VecDeque::new(),
            ack_timeout: self.ack_timeout,
        })
    }
}

async fn wait_for_connack(event_loop: &mut EventLoop) -> Result<(), SessionError> {
    loop {
        let event = event_loop
            .poll()
            .await
            .map_err(|e| SessionError::Connection(e.to_string()))?;

        if let Event::Incoming(Packet::ConnAck(ack)) = event {
            return match ack.code {
                ConnectReturnCode::Success => Ok(()),
                code => Err(SessionError::Refused(format!("{:?}", code))),
            };
        }
    }
}

/// A live `rumqttc` session.
pub struct MqttSession {
    client: AsyncClient,
    event_loop: EventLoop,
    /// Publishes that arrived while waiting for a SUBACK
    pending: VecDeque<InboundMessage>,
    ack_timeout: Duration,
}

impl MqttSession {
    /// Drive the event loop until the SUBACK of the request just queued.
    ///
    /// Only one subscribe is in flight at a time, so the next SUBACK is ours.
    async fn wait_for_suback(&mut self, topic: &str) -> Result<(), SessionError> {
        let failed = |message: String| SessionError::Subscribe {
            topic: topic.to_string(),
            message,
        };

        loop {
            let event = self
                .event_loop
                .poll()
                .await
                .map_err(|e| failed(e.to_string()))?;

            match event {
                Event::Incoming(Packet::SubAck(ack)) => {
                    return match ack.return_codes.first() {
                        Some(SubscribeReasonCode::Success(_)) => Ok(()),
                        Some(SubscribeReasonCode::Failure) => {
                            Err(failed("rejected by broker".to_string()))
                        }
                        None => Err(failed("empty SUBACK".to_string())),
                    };
                }
                Event::Incoming(Packet::Publish(publish)) => {
                    self.pending.push_back(InboundMessage {
                        topic: publish.topic,
                        payload: publish.payload.to_vec(),
                    });
                }
                Event::Incoming(Packet::Disconnect) => {
                    return Err(failed("broker disconnected".to_string()));
                }
                other => trace!(event = ?other, "MQTT event"),
            }
        }
    }
}

#[async_trait]
impl BrokerSession for MqttSession {
    async fn subscribe(&mut self, topic: &str) -> Result<(), SessionError> {
        self.client
            .subscribe(topic, QoS::AtMostOnce)
            .await
            .map_err(|e| SessionError::Subscribe {
                topic: topic.to_string(),
                message: e.to_string(),
            })?;

        tokio::time::timeout(self.ack_timeout, self.wait_for_suback(topic))
            .await
            .map_err(|_| SessionError::Subscribe {
                topic: topic.to_string(),
                message: "SUBACK timeout".to_string(),
            })?
    }

    async fn recv(&mut self) -> Result<Option<InboundMessage>, SessionError> {
        if let Some(message) = self.pending.pop_front() {
            return Ok(Some(message));
        }

        loop {
            let event = self
                .event_loop
                .poll()
                .await
                .map_err(|e| SessionError::Lost(e.to_string()))?;

            match event {
                Event::Incoming(Packet::Publish(publish)) => {
                    return Ok(Some(InboundMessage {
                        topic: publish.topic,
                        payload: publish.payload.to_vec(),
                    }));
                }
                Event::Incoming(Packet::Disconnect) | Event::Outgoing(Outgoing::Disconnect) => {
                    return Ok(None);
                }
                other => trace!(event = ?other, "MQTT event"),
            }
        }
    }

    async fn disconnect(&mut self) {
        if self.client.disconnect().await.is_err() {
            return;
        }

        // Drive the event loop until the DISCONNECT packet has been written.
        let flush = async {
            loop {
                match self.event_loop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        };
        let _ = tokio::time::timeout(Duration::from_secs(1), flush).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    fn params(host: &str) -> SessionParams {
        SessionParams {
            client_id: "openwb-sim-test".to_string(),
            host: host.to_string(),
            port: 1883,
            user: String::new(),
            password: String::new(),
            keep_alive: Duration::from_secs(60),
        }
    }

    async fn read_packet(stream: &mut TcpStream) -> io::Result<(u8, Vec<u8>)> {
        let header = stream.read_u8().await?;
        let mut len = 0usize;
        let mut shift = 0;
        loop {
            let byte = stream.read_u8().await?;
            len |= ((byte & 0x7F) as usize) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        let mut body = vec![0; len];
        stream.read_exact(&mut body).await?;
        Ok((header, body))
    }

    /// Minimal MQTT 3.1.1 broker for one client.
    ///
    /// Topics under `denied/` are refused in the SUBACK. Subscribing to a
    /// topic under `retained/` delivers an `on` publish before the SUBACK.
    async fn serve_client(mut stream: TcpStream) -> io::Result<()> {
        loop {
            let (header, body) = read_packet(&mut stream).await?;
            match header >> 4 {
                1 => stream.write_all(&[0x20, 0x02, 0x00, 0x00]).await?,
                8 => {
                    let topic_len = u16::from_be_bytes([body[2], body[3]]) as usize;
                    let topic = std::str::from_utf8(&body[4..4 + topic_len]).unwrap();

                    if topic.starts_with("retained/") {
                        let payload = b"on";
                        let mut publish = vec![0x30, (2 + topic_len + payload.len()) as u8];
                        publish.extend_from_slice(&(topic_len as u16).to_be_bytes());
                        publish.extend_from_slice(topic.as_bytes());
                        publish.extend_from_slice(payload);
                        stream.write_all(&publish).await?;
                    }

                    let code = if topic.starts_with("denied/") { 0x80 } else { 0x00 };
                    stream
                        .write_all(&[0x90, 0x03, body[0], body[1], code])
                        .await?;
                }
                12 => stream.write_all(&[0xD0, 0x00]).await?,
                14 => return Ok(()),
                _ => {}
            }
        }
    }

    async fn fake_broker() -> SessionParams {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve_client(stream));
            }
        });

        let mut params = params("127.0.0.1");
        params.port = port;
        params
    }

    #[tokio::test]
    async fn test_connect_without_broker_address_fails() {
        let connector = MqttConnector::default();

        let result = connector.connect(&params("")).await;
        assert!(matches!(result, Err(SessionError::Connection(_))));
    }

    #[tokio::test]
    async fn test_connect_refused_port_fails() {
        // Bind and drop a listener to get a local port nobody listens on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let connector = MqttConnector::new(Duration::from_secs(5));
        let mut params = params("127.0.0.1");
        params.port = port;

        let result = connector.connect(&params).await;
        assert!(matches!(result, Err(SessionError::Connection(_))));
    }

    #[tokio::test]
    async fn test_subscribe_more_topics_than_channel_capacity() {
        let connector = MqttConnector::new(Duration::from_secs(5));
        let mut session = connector.connect(&fake_broker().await).await.unwrap();

        let subscribe_all = async {
            for i in 0..200 {
                session.subscribe(&format!("t/{}", i)).await?;
            }
            Ok::<_, SessionError>(())
        };
        tokio::time::timeout(Duration::from_secs(10), subscribe_all)
            .await
            .expect("subscribing stalled")
            .unwrap();

        session.disconnect().await;
    }

    #[tokio::test]
    async fn test_rejected_subscription_is_an_error() {
        let connector = MqttConnector::new(Duration::from_secs(5));
        let mut session = connector.connect(&fake_broker().await).await.unwrap();

        session.subscribe("home/dimm").await.unwrap();
        let result = session.subscribe("denied/control").await;
        assert!(matches!(
            result,
            Err(SessionError::Subscribe { ref topic, .. }) if topic == "denied/control"
        ));
    }

    #[tokio::test]
    async fn test_publish_before_suback_is_delivered() {
        let connector = MqttConnector::new(Duration::from_secs(5));
        let mut session = connector.connect(&fake_broker().await).await.unwrap();

        session.subscribe("retained/dimm").await.unwrap();

        let message = tokio::time::timeout(Duration::from_secs(5), session.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message, Some(InboundMessage::new("retained/dimm", "on")));
    }
}
