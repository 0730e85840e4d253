//! Topic to decoder mapping. Payloads are decoded right before they are processed, and the
//! decoded message lives only for the duration of one `process` call.

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;

use crate::{Error, Result};

/// Decodes the raw payload of a topic into the message type `M` handed to the processor.
pub trait Decoder<M>: Send + Sync {
    fn decode(&self, payload: &[u8]) -> Result<M>;
}

/// Any closure returning a displayable error is a decoder.
impl<M, F, E> Decoder<M> for F
where
    F: Fn(&[u8]) -> std::result::Result<M, E> + Send + Sync,
    E: fmt::Display,
{
    fn decode(&self, payload: &[u8]) -> Result<M> {
        self(payload).map_err(|e| Error::Decode(e.to_string()))
    }
}

/// Decodes JSON payloads with serde.
pub struct JsonDecoder<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonDecoder<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonDecoder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: DeserializeOwned> Decoder<T> for JsonDecoder<T> {
    fn decode(&self, payload: &[u8]) -> Result<T> {
        serde_json::from_slice(payload).map_err(|e| Error::Decode(format!("invalid json: {e}")))
    }
}

/// Decodes protobuf payloads with prost.
pub struct ProtoDecoder<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> ProtoDecoder<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for ProtoDecoder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: prost::Message + Default> Decoder<T> for ProtoDecoder<T> {
    fn decode(&self, payload: &[u8]) -> Result<T> {
        T::decode(payload).map_err(|e| Error::Decode(format!("invalid protobuf: {e}")))
    }
}

/// DecoderRegistry maps topic names to decoders. It is filled at configuration time and shared
/// read-only with the engine afterwards.
pub struct DecoderRegistry<M> {
    decoders: HashMap<String, Arc<dyn Decoder<M>>>,
}

impl<M> Default for DecoderRegistry<M> {
    fn default() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }
}

impl<M> fmt::Debug for DecoderRegistry<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut topics: Vec<&String> = self.decoders.keys().collect();
        topics.sort();
        f.debug_struct("DecoderRegistry")
            .field("topics", &topics)
            .finish()
    }
}

impl<M> DecoderRegistry<M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `decoder` for `topic`, replacing any earlier registration.
    pub fn register(&mut self, topic: impl Into<String>, decoder: impl Decoder<M> + 'static) {
        self.decoders.insert(topic.into(), Arc::new(decoder));
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.decoders.contains_key(topic)
    }

    pub fn decode(&self, topic: &str, payload: &[u8]) -> Result<M> {
        let decoder = self
            .decoders
            .get(topic)
            .ok_or_else(|| Error::UnregisteredTopic(topic.to_string()))?;
        decoder.decode(payload)
    }
}
