use lapin::BasicProperties;

/// One message received from the queue.
///
/// Detached from the lapin consumer so handlers never touch the channel: the
/// broker has already acknowledged it by the time it is handed out.
#[derive(Debug, Clone, Default)]
pub struct Delivery {
    pub data: Vec<u8>,
    pub consumer_tag: String,
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: BasicProperties,
}

impl Delivery {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            ..Default::default()
        }
    }

    pub fn from_lapin(delivery: lapin::message::Delivery, consumer_tag: &str) -> Self {
        Self {
            data: delivery.data,
            consumer_tag: consumer_tag.to_string(),
            delivery_tag: delivery.delivery_tag,
            exchange: delivery.exchange.as_str().to_string(),
            routing_key: delivery.routing_key.as_str().to_string(),
            redelivered: delivery.redelivered,
            properties: delivery.properties,
        }
    }

    pub fn payload_preview(&self, max_chars: usize) -> String {
        String::from_utf8_lossy(&self.data)
            .chars()
            .take(max_chars)
            .collect()
    }
}
