//! Message payloads carried by the typed queues.
//!
//! Prices are fixed-point (`price_ticks` in the instrument's minimum price
//! increment) so messages stay `Copy` and compare exactly.

/// One market-data update.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Tick {
    pub instrument: u32,
    /// Runtime clock when the update was produced.
    pub ts_us: u64,
    pub price_ticks: i64,
    pub size: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

/// An execution against a working order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Fill {
    pub order_id: u64,
    pub instrument: u32,
    pub side: Side,
    pub price_ticks: i64,
    pub qty: u64,
    pub ts_us: u64,
}

/// Generic inter-unit notification: a kind tag plus a small payload.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Event {
    pub kind: u32,
    pub seq: u64,
    pub ts_us: u64,
    pub payload: Vec<u8>,
}

impl Event {
    pub fn new(kind: u32, seq: u64) -> Self {
        Self {
            kind,
            seq,
            ts_us: 0,
            payload: Vec::new(),
        }
    }

    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn at(mut self, ts_us: u64) -> Self {
        self.ts_us = ts_us;
        self
    }
}
