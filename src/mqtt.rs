use std::time::Duration;

use log::{debug, error, info};
use rumqttc::{MqttOptions, QoS, SubscribeFilter};
use serde_derive::Serialize;
use tokio::sync::broadcast;

use crate::config;
use crate::messages::{DevicePresence, RemoteCommand};
use crate::sampler::NO_SIGNAL_DBM;

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct MqttClient {
    client: rumqttc::AsyncClient,
    publisher_id: String,
    topic_path: String,
}

#[derive(Debug, Serialize)]
struct DeviceMqttMessage {
    name: String,
    #[serde(rename = "id")]
    mac_address: String,
    confidence: u8,
    rssi: i8,
    retained: bool,
}

impl MqttClient {
    pub fn new(config: &config::MqttConfig) -> (Self, rumqttc::EventLoop) {
        let publisher_id = config
            .publisher_id
            .as_ref()
            .unwrap_or(&"proximity-rs".to_string())
            .to_string();

        let mut mqttoptions = MqttOptions::new(
            publisher_id.clone(),
            config.host.clone(),
            config.port.unwrap_or(1883),
        );

        mqttoptions.set_keep_alive(Duration::from_secs(config.keep_alive_seconds.unwrap_or(5)));

        if let (Some(username), Some(password)) =
            (config.username.as_ref(), config.password.as_ref())
        {
            mqttoptions.set_credentials(username.clone(), password.clone());
        }

        let (client, eventloop) = rumqttc::AsyncClient::new(mqttoptions, 10);

        (
            MqttClient {
                client,
                publisher_id,
                topic_path: config.topic_path.clone().unwrap_or("proximity".to_string()),
            },
            eventloop,
        )
    }

    pub async fn subscribe(&self) -> Result<(), rumqttc::ClientError> {
        self.client
            .subscribe_many(vec![
                SubscribeFilter::new(format!("{}/enable", self.topic_path), QoS::AtMostOnce),
                SubscribeFilter::new(format!("{}/disable", self.topic_path), QoS::AtMostOnce),
            ])
            .await?;

        Ok(())
    }

    pub async fn event_loop(
        &self,
        eventloop: &mut rumqttc::EventLoop,
        tx: broadcast::Sender<RemoteCommand>,
    ) {
        loop {
            match eventloop.poll().await {
                Ok(notification) => match notification {
                    rumqttc::Event::Incoming(rumqttc::Packet::Publish(p)) => {
                        debug!("Received MQTT message on topic {}: {:?}", p.topic, p.payload);

                        let Some(command) = command_for_topic(&self.topic_path, &p.topic) else {
                            continue;
                        };
                        if let Err(err) = tx.send(command) {
                            error!("Error forwarding remote command: {:?}", err);
                        }
                    }
                    rumqttc::Event::Incoming(rumqttc::Packet::SubAck(_)) => {
                        debug!("Subscription acknowledged");
                    }
                    rumqttc::Event::Incoming(rumqttc::Packet::ConnAck(_)) => {
                        debug!("Connection acknowledged");
                        if let Err(err) = self.subscribe().await {
                            error!("Error subscribing to MQTT topics: {:?}", err);
                        }
                    }
                    _ => {}
                },
                Err(e) => {
                    error!("Error polling MQTT event loop: {:?}", e);
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            }
        }
    }

    /// Queues a presence message without blocking; safe to call from the
    /// sampling thread.
    pub fn announce_device(
        &self,
        name: &str,
        mac_address: &str,
        presence: DevicePresence,
        rssi: Option<i8>,
    ) -> Result<(), rumqttc::ClientError> {
        info!(
            "Announcing device {} (confidence: {}) on MQTT",
            name,
            presence.confidence()
        );
        let message = DeviceMqttMessage {
            name: name.to_string(),
            mac_address: mac_address.to_string(),
            confidence: presence.confidence(),
            rssi: rssi.unwrap_or(NO_SIGNAL_DBM),
            retained: false,
        };
        let payload = match serde_json::to_string(&message) {
            Ok(payload) => payload,
            Err(err) => {
                error!("Error encoding presence message: {:?}", err);
                return Ok(());
            }
        };
        self.client.try_publish(
            device_topic(&self.topic_path, &self.publisher_id, name),
            QoS::AtMostOnce,
            false,
            payload,
        )
    }

    pub async fn disconnect(&self) -> Result<(), rumqttc::ClientError> {
        debug!("Disconnecting MQTT client");
        self.client.disconnect().await
    }
}

fn command_for_topic(topic_path: &str, topic: &str) -> Option<RemoteCommand> {
    match topic.strip_prefix(topic_path)?.strip_prefix('/')? {
        "enable" => Some(RemoteCommand::Enable),
        "disable" => Some(RemoteCommand::Disable),
        _ => None,
    }
}

fn device_topic(topic_path: &str, publisher_id: &str, name: &str) -> String {
    format!("{}/{}/{}", topic_path, publisher_id, sanitize_name(name))
}

fn sanitize_name(name: &str) -> String {
    // Remove any non-alphanumeric characters and replace spaces with underscores
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect::<String>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_name() {
        let name = "Test's Device 123";
        let sanitized = super::sanitize_name(name);
        assert_eq!(sanitized, "test_s_device_123");
    }

    #[test]
    fn test_device_topic() {
        assert_eq!(
            device_topic("proximity", "desk", "[TV] stua"),
            "proximity/desk/_tv__stua"
        );
    }

    #[test]
    fn test_command_for_topic() {
        assert_eq!(
            command_for_topic("proximity", "proximity/enable"),
            Some(RemoteCommand::Enable)
        );
        assert_eq!(
            command_for_topic("proximity", "proximity/disable"),
            Some(RemoteCommand::Disable)
        );
        assert_eq!(command_for_topic("proximity", "proximity/other"), None);
        assert_eq!(command_for_topic("proximity", "proximityenable"), None);
        assert_eq!(command_for_topic("proximity", "elsewhere/enable"), None);
    }

    #[test]
    fn test_message_payload() {
        let message = DeviceMqttMessage {
            name: "Phone".to_string(),
            mac_address: "AA:BB:CC:DD:EE:FF".to_string(),
            confidence: DevicePresence::Absent.confidence(),
            rssi: NO_SIGNAL_DBM,
            retained: false,
        };
        let json: serde_json::Value = serde_json::to_value(&message).unwrap();
        assert_eq!(json["id"], "AA:BB:CC:DD:EE:FF");
        assert_eq!(json["confidence"], 0);
        assert_eq!(json["rssi"], -99);
    }
}
