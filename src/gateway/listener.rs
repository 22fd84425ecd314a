use std::collections::HashMap;

use log::debug;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::payload::Payload;

type RawListener = Box<dyn Fn(&Payload) + Send + Sync>;
type EventListener = Box<dyn Fn(&Value) + Send + Sync>;

/// Subscriptions keyed by dispatch name (`"MESSAGE_CREATE"`, ...).
///
/// Listeners run synchronously on the connection task, in the order the
/// frames arrived. Raw listeners see every frame before any typed decode is
/// attempted. Keep them short; anything slow should be handed to a channel.
#[derive(Default)]
pub struct Listeners {
    raw: Vec<RawListener>,
    events: HashMap<String, Vec<EventListener>>,
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every decoded frame, whatever its opcode.
    pub fn on_raw(&mut self, listener: impl Fn(&Payload) + Send + Sync + 'static) -> &mut Self {
        self.raw.push(Box::new(listener));
        self
    }

    /// `d` of every dispatch named `event`, untyped.
    pub fn on(
        &mut self,
        event: impl Into<String>,
        listener: impl Fn(&Value) + Send + Sync + 'static,
    ) -> &mut Self {
        self.events
            .entry(event.into())
            .or_default()
            .push(Box::new(listener));
        self
    }

    /// Like [`on`](Self::on) but decoded into `T` first. Payloads that
    /// don't decode are dropped with a debug log.
    pub fn on_event<T, F>(&mut self, event: impl Into<String>, listener: F) -> &mut Self
    where
        T: DeserializeOwned,
        F: Fn(T) + Send + Sync + 'static,
    {
        let event = event.into();
        let name = event.clone();
        self.on(event, move |data| match T::deserialize(data) {
            Ok(value) => listener(value),
            Err(e) => debug!("Dropping {} payload that failed to decode: {}", name, e),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty() && self.events.is_empty()
    }

    pub(crate) fn emit_raw(&self, payload: &Payload) {
        for listener in &self.raw {
            listener(payload);
        }
    }

    pub(crate) fn emit(&self, event: &str, data: &Value) {
        if let Some(listeners) = self.events.get(event) {
            for listener in listeners {
                listener(data);
            }
        }
    }
}
