//! Broadcast sink that also remembers recent console output, so a client
//! that connects mid-run can be sent what it missed.

use crate::rpc::{ClientHub, ConsoleSnapshot, EventSink, ServerMessage};
use parking_lot::Mutex;
use std::collections::BTreeMap;

/// Bytes of console history kept per worker.
pub const CONSOLE_HISTORY: usize = 64 * 1024;

pub struct ServerEvents {
    hub: ClientHub,
    consoles: Mutex<BTreeMap<i32, Vec<u8>>>,
}

impl ServerEvents {
    pub fn new(hub: ClientHub) -> Self {
        Self {
            hub,
            consoles: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn hub(&self) -> &ClientHub {
        &self.hub
    }

    pub fn console_snapshots(&self) -> Vec<ConsoleSnapshot> {
        self.consoles
            .lock()
            .iter()
            .map(|(index, data)| ConsoleSnapshot {
                index: *index,
                data: data.clone(),
            })
            .collect()
    }

    fn record(&self, index: i32, data: &[u8]) {
        let mut consoles = self.consoles.lock();
        let buf = consoles.entry(index).or_default();
        buf.extend_from_slice(data);
        if buf.len() > CONSOLE_HISTORY {
            let excess = buf.len() - CONSOLE_HISTORY;
            buf.drain(..excess);
        }
    }
}

impl EventSink for ServerEvents {
    fn publish(&self, message: ServerMessage) {
        if let ServerMessage::OnConsoleUpdate(update) = &message {
            self.record(update.index, &update.data);
        }
        self.hub.publish(message);
    }
}
