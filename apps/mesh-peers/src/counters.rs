use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Lifecycle counters shown to whoever drives the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    DataChannelsOpened,
    DataChannelsClosed,
    ReceivedMessages,
    FailedConnections,
    FailedIceConnections,
    DataChannelErrors,
    SignalingErrors,
}

const COUNTER_SLOTS: usize = 7;

#[derive(Debug, Default)]
pub struct MeshCounters {
    slots: [AtomicU64; COUNTER_SLOTS],
}

impl MeshCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(&self, counter: Counter) {
        self.slots[counter as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.slots[counter as usize].load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            data_channels_opened: self.get(Counter::DataChannelsOpened),
            data_channels_closed: self.get(Counter::DataChannelsClosed),
            received_message_count: self.get(Counter::ReceivedMessages),
            failed_connection_count: self.get(Counter::FailedConnections),
            failed_ice_connection_count: self.get(Counter::FailedIceConnections),
            data_channel_errors: self.get(Counter::DataChannelErrors),
            signaling_errors: self.get(Counter::SignalingErrors),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterSnapshot {
    pub data_channels_opened: u64,
    pub data_channels_closed: u64,
    pub received_message_count: u64,
    pub failed_connection_count: u64,
    pub failed_ice_connection_count: u64,
    pub data_channel_errors: u64,
    pub signaling_errors: u64,
}
