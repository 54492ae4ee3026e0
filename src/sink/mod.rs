//! Destinations for [`StructuredRecord`]s.
//!
//! Every sink encodes through a shared [`SerializerCache`], so all sinks of
//! a process reuse one serializer per record schema.

pub mod kafka;
pub mod key_strategy;

use futures::future::BoxFuture;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::mapper::StructuredRecord;
use crate::serializer::{Cached, RecordSerializer, SerializerCache};
use crate::Result;

pub use kafka::KafkaSink;
pub use key_strategy::KeyStrategy;

pub trait RecordSink: Send {
    fn send<'a>(&'a mut self, record: &'a StructuredRecord) -> BoxFuture<'a, Result<()>>;

    /// Resolves once everything sent so far is durable at the destination.
    fn flush(&mut self) -> BoxFuture<'_, Result<()>>;
}

/// Holds a sink's serializer so the cache entry stays live while the sink does.
pub(crate) struct SerializerHandle {
    cache: Arc<SerializerCache<RecordSerializer>>,
    current: Option<Arc<Cached<RecordSerializer>>>,
}

impl SerializerHandle {
    pub(crate) fn new(cache: Arc<SerializerCache<RecordSerializer>>) -> Self {
        Self {
            cache,
            current: None,
        }
    }

    /// Only the first call reaches the cache, so a sink blocks on a
    /// concurrent build at most once.
    pub(crate) fn get(&mut self) -> Result<Arc<Cached<RecordSerializer>>> {
        if let Some(serializer) = &self.current {
            return Ok(serializer.clone());
        }
        let serializer = self.cache.get(&StructuredRecord::schema())?;
        self.current = Some(serializer.clone());
        Ok(serializer)
    }
}

/// Writes one JSON document per line.
pub struct JsonLinesSink<W> {
    writer: W,
    serializer: SerializerHandle,
}

impl JsonLinesSink<tokio::io::Stdout> {
    pub fn stdout(cache: Arc<SerializerCache<RecordSerializer>>) -> Self {
        Self::new(tokio::io::stdout(), cache)
    }
}

impl<W: AsyncWrite + Unpin + Send> JsonLinesSink<W> {
    pub fn new(writer: W, cache: Arc<SerializerCache<RecordSerializer>>) -> Self {
        Self {
            writer,
            serializer: SerializerHandle::new(cache),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: AsyncWrite + Unpin + Send> RecordSink for JsonLinesSink<W> {
    fn send<'a>(&'a mut self, record: &'a StructuredRecord) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut line = self.serializer.get()?.encode(record)?;
            line.push(b'\n');
            self.writer.write_all(&line).await?;
            Ok(())
        })
    }

    fn flush(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.writer.flush().await?;
            Ok(())
        })
    }
}
