use chunkstream_cache::ResidencyEvent;
use crossbeam_channel::{Receiver, Sender};

/// Broadcast of chunk residency changes to renderers
///
/// Each subscriber gets its own unbounded channel. Subscribers that dropped
/// their receiver are pruned on the next emit.
#[derive(Debug, Default)]
pub struct ResidencySignal {
    subscribers: Vec<Sender<ResidencyEvent>>,
}

impl ResidencySignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self) -> Receiver<ResidencyEvent> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.subscribers.push(tx);
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn emit(&mut self, events: &[ResidencyEvent]) {
        if events.is_empty() {
            return;
        }
        self.subscribers
            .retain(|subscriber| events.iter().all(|event| subscriber.send(*event).is_ok()));
    }
}
