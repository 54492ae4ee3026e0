use futures::future::BoxFuture;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::ClientConfig;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::{KeyStrategy, RecordSink, SerializerHandle};
use crate::config::KafkaConfig;
use crate::mapper::StructuredRecord;
use crate::serializer::{RecordSerializer, SerializerCache};
use crate::{Error, Result};

const FLUSH_TIMEOUT: Duration = Duration::from_secs(30);

/// Publishes records to a single Kafka topic.
pub struct KafkaSink {
    producer: FutureProducer,
    topic: String,
    key_strategy: KeyStrategy,
    serializer: SerializerHandle,
}

impl KafkaSink {
    pub fn new(config: &KafkaConfig, cache: Arc<SerializerCache<RecordSerializer>>) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", config.brokers.join(","))
            .set("compression.type", &config.compression)
            .set("acks", &config.acks)
            .set("linger.ms", config.linger_ms.to_string())
            .create()?;

        info!(brokers = ?config.brokers, topic = %config.topic, "Kafka producer created");
        Ok(Self {
            producer,
            topic: config.topic.clone(),
            key_strategy: config.key_strategy.clone(),
            serializer: SerializerHandle::new(cache),
        })
    }
}

impl RecordSink for KafkaSink {
    fn send<'a>(&'a mut self, record: &'a StructuredRecord) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let payload = self.serializer.get()?.encode(record)?;
            let key = self.key_strategy.extract_key(record);

            let mut message = FutureRecord::<String, Vec<u8>>::to(&self.topic).payload(&payload);
            if let Some(key) = key.as_ref() {
                message = message.key(key);
            }

            let (partition, offset) = self
                .producer
                .send(message, Timeout::Never)
                .await
                .map_err(|(e, _)| Error::Kafka(e))?;
            debug!(topic = %self.topic, partition, offset, "Delivered record");
            Ok(())
        })
    }

    fn flush(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.producer.flush(Timeout::After(FLUSH_TIMEOUT))?;
            Ok(())
        })
    }
}
