//! Routes state-change events between the relay controller and the broker.
//!
//! Every event is applied to the side opposite its origin and nowhere else.
//! Applying an event never emits a new one, so a change cannot echo back.

use crate::event::{Event, Provider};
use async_trait::async_trait;
use log::{debug, info};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Buffer size of the event channel shared by both producers.
pub const EVENT_BUFFER: usize = 16;

/// One side of the bridge that accepts relay state changes.
#[async_trait]
pub trait SwitchSink: Send + Sync {
    /// Apply a state change. Failures are logged by the sink, never returned.
    async fn apply(&self, switch_id: &str, on: bool);
}

pub fn event_channel() -> (mpsc::Sender<Event>, mpsc::Receiver<Event>) {
    mpsc::channel(EVENT_BUFFER)
}

pub struct Router {
    events: mpsc::Receiver<Event>,
    device: Arc<dyn SwitchSink>,
    broker: Arc<dyn SwitchSink>,
}

impl Router {
    pub fn new(
        events: mpsc::Receiver<Event>,
        device: Arc<dyn SwitchSink>,
        broker: Arc<dyn SwitchSink>,
    ) -> Self {
        Self {
            events,
            device,
            broker,
        }
    }

    /// Route events until `cancel` fires or every producer is gone.
    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = self.events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            self.route(event).await;
        }
        info!("[Router] Stopped");
    }

    async fn route(&self, event: Event) {
        debug!(
            "[Router] Event from {} relay {} state -> {}",
            event.provider, event.switch_id, event.on
        );
        match event.provider {
            Provider::Broker => self.device.apply(&event.switch_id, event.on).await,
            Provider::Device => self.broker.apply(&event.switch_id, event.on).await,
        }
    }
}
