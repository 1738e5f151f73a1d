//! MQTT event source.
//!
//! Subscribes to `<topic_prefix>/+`; a publish to `<topic_prefix>/<name>` with a textual
//! float payload becomes the event `(name, value)`.

use std::error::Error;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use linkme::distributed_slice;
use rumqttc::AsyncClient;
use rumqttc::Event;
use rumqttc::MqttOptions;
use rumqttc::Packet;
use rumqttc::QoS;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::EVENT_SOURCES;
use super::EventSender;
use super::EventSource;
use super::InboundEvent;
use super::SourceContext;
use super::SourceFactoryResult;
use crate::config::MqttSourceConfig;

/// MQTT message received from a subscription
#[derive(Debug, Clone)]
pub struct MqttMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Subscribe-side MQTT operations, mockable for tests
#[async_trait]
pub trait MqttClient: Send + Sync {
    async fn connect(&mut self) -> Result<(), Box<dyn Error + Send + Sync>>;

    async fn subscribe(&mut self, topic: &str) -> Result<(), Box<dyn Error + Send + Sync>>;

    /// Next message from the subscriptions, or `None` once the client has stopped
    async fn poll_message(&mut self) -> Option<MqttMessage>;
}

#[cfg(test)]
#[derive(Debug, Default)]
pub struct MockMqttClient {
    pub messages: std::collections::VecDeque<MqttMessage>,
    pub subscriptions: Vec<String>,
    pub is_connected: bool,
}

#[cfg(test)]
impl MockMqttClient {
    pub fn add_message(&mut self, topic: &str, payload: &str) {
        self.messages.push_back(MqttMessage {
            topic: topic.to_string(),
            payload: payload.as_bytes().to_vec(),
        });
    }
}

#[cfg(test)]
#[async_trait]
impl MqttClient for MockMqttClient {
    async fn connect(&mut self) -> Result<(), Box<dyn Error + Send + Sync>> {
        self.is_connected = true;
        Ok(())
    }

    async fn subscribe(&mut self, topic: &str) -> Result<(), Box<dyn Error + Send + Sync>> {
        self.subscriptions.push(topic.to_string());
        Ok(())
    }

    async fn poll_message(&mut self) -> Option<MqttMessage> {
        self.messages.pop_front()
    }
}

/// MQTT client backed by rumqttc
pub struct RumqttcClient {
    /// Kept until `connect` creates the client
    mqtt_options: MqttOptions,
    client: Option<AsyncClient>,
    message_rx: Option<mpsc::UnboundedReceiver<MqttMessage>>,
    event_loop_task: Option<JoinHandle<()>>,
}

impl RumqttcClient {
    pub fn new(config: &MqttSourceConfig) -> Self {
        let mut mqtt_options =
            MqttOptions::new(config.client_id.clone(), config.broker.clone(), config.port);
        mqtt_options.set_keep_alive(Duration::from_secs(30));

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            mqtt_options.set_credentials(username, password);
        }

        Self {
            mqtt_options,
            client: None,
            message_rx: None,
            event_loop_task: None,
        }
    }
}

#[async_trait]
impl MqttClient for RumqttcClient {
    async fn connect(&mut self) -> Result<(), Box<dyn Error + Send + Sync>> {
        let (client, mut event_loop) = AsyncClient::new(self.mqtt_options.clone(), 10);
        let (message_tx, message_rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let msg = MqttMessage {
                            topic: publish.topic.to_string(),
                            payload: publish.payload.to_vec(),
                        };
                        if message_tx.send(msg).is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        // rumqttc reconnects on the next poll
                        warn!("MQTT event loop error: {}", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
            debug!("MQTT event loop task exiting");
        });

        self.client = Some(client);
        self.message_rx = Some(message_rx);
        self.event_loop_task = Some(task);
        Ok(())
    }

    async fn subscribe(&mut self, topic: &str) -> Result<(), Box<dyn Error + Send + Sync>> {
        let client = self.client.as_ref().ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "MQTT client not connected. Call connect() first.",
            )
        })?;

        client.subscribe(topic, QoS::AtMostOnce).await?;
        Ok(())
    }

    async fn poll_message(&mut self) -> Option<MqttMessage> {
        match &mut self.message_rx {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }
}

impl Drop for RumqttcClient {
    fn drop(&mut self) {
        if let Some(task) = self.event_loop_task.take() {
            task.abort();
        }
    }
}

pub struct MqttEventSource<C: MqttClient> {
    client: C,
    topic_prefix: String,
}

impl<C: MqttClient> MqttEventSource<C> {
    pub fn new(client: C, topic_prefix: &str) -> Self {
        Self {
            client,
            topic_prefix: topic_prefix.trim_end_matches('/').to_string(),
        }
    }

    fn subscription(&self) -> String {
        format!("{}/+", self.topic_prefix)
    }

    /// Event carried by `msg`, if it is a well-formed publish under the prefix
    fn event_for(&self, msg: &MqttMessage) -> Option<InboundEvent> {
        let name = msg
            .topic
            .strip_prefix(self.topic_prefix.as_str())?
            .strip_prefix('/')?;
        if name.contains('/') {
            return None;
        }
        InboundEvent::from_payload(name, &msg.payload)
    }

    async fn start(&mut self) -> anyhow::Result<()> {
        self.client
            .connect()
            .await
            .map_err(|e| anyhow::anyhow!("{}", e))
            .context("Failed to connect to MQTT broker")?;

        let topic = self.subscription();
        self.client
            .subscribe(&topic)
            .await
            .map_err(|e| anyhow::anyhow!("{}", e))
            .with_context(|| format!("Failed to subscribe to {}", topic))?;

        info!("Subscribed to MQTT events on {}", topic);
        Ok(())
    }

    async fn pump(&mut self, events: &EventSender) {
        while let Some(msg) = self.client.poll_message().await {
            match self.event_for(&msg) {
                Some(event) => {
                    events.send(event);
                }
                None => debug!("Ignoring MQTT message on {}", msg.topic),
            }
        }
    }
}

#[async_trait]
impl<C: MqttClient + 'static> EventSource for MqttEventSource<C> {
    fn name(&self) -> &str {
        "mqtt"
    }

    async fn run(mut self: Box<Self>, events: EventSender) -> anyhow::Result<()> {
        self.start().await?;
        self.pump(&events).await;
        anyhow::bail!("MQTT message stream ended")
    }
}

#[distributed_slice(EVENT_SOURCES)]
fn init_mqtt(ctx: &SourceContext) -> SourceFactoryResult {
    let Some(config) = &ctx.config.events.mqtt else {
        return Ok(None);
    };

    let client = RumqttcClient::new(config);
    Ok(Some(Box::new(MqttEventSource::new(
        client,
        &config.topic_prefix,
    ))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::slot;

    #[tokio::test]
    async fn test_subscribes_and_forwards_latest() {
        let mut client = MockMqttClient::default();
        client.add_message("tails/events/Touch", "0.3");
        client.add_message("tails/events/Touch", "0.9");
        client.add_message("tails/events/Touch/deep", "0.5");
        client.add_message("other/Touch", "0.5");
        client.add_message("tails/events/Touch", "loud");

        let mut source = MqttEventSource::new(client, "tails/events/");
        source.start().await.unwrap();
        assert!(source.client.is_connected);
        assert_eq!(source.client.subscriptions, vec!["tails/events/+".to_string()]);

        let (tx, mut rx) = slot::channel();
        source.pump(&tx).await;

        assert_eq!(rx.try_recv(), Some(InboundEvent::new("Touch", 0.9)));
        assert_eq!(rx.replaced(), 1);
    }

    #[tokio::test]
    async fn test_run_fails_when_stream_ends() {
        let source = Box::new(MqttEventSource::new(MockMqttClient::default(), "tails/events"));
        let (tx, _rx) = slot::channel();

        let err = source.run(tx).await.unwrap_err();
        assert!(err.to_string().contains("stream ended"));
    }
}
