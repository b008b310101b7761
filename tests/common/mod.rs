// tests/common/mod.rs
//
// Shared fakes for the integration tests: a counting provider client whose
// answers are computed per request.
#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use market_ingest::error::IngestError;
use market_ingest::ingest::connector::ProviderClient;
use market_ingest::ingest::types::{FetchRequest, RawResponse};

type Reply = Box<dyn Fn(&FetchRequest) -> Result<RawResponse, IngestError> + Send + Sync>;

/// Counts every call and answers through a swappable closure.
pub struct CountingClient {
    calls: AtomicU32,
    reply: Mutex<Reply>,
    seen: Mutex<Vec<FetchRequest>>,
}

impl CountingClient {
    pub fn new<F>(reply: F) -> Self
    where
        F: Fn(&FetchRequest) -> Result<RawResponse, IngestError> + Send + Sync + 'static,
    {
        Self {
            calls: AtomicU32::new(0),
            reply: Mutex::new(Box::new(reply)),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Always answers 200 with a one-day quote for the requested symbol.
    pub fn quotes(close: f64) -> Self {
        Self::new(move |req| Ok(RawResponse::ok(&req.provider_id, quote_body(&req.entity_key, close))))
    }

    pub fn set_reply<F>(&self, reply: F)
    where
        F: Fn(&FetchRequest) -> Result<RawResponse, IngestError> + Send + Sync + 'static,
    {
        *self.reply.lock().unwrap() = Box::new(reply);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<FetchRequest> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProviderClient for CountingClient {
    async fn fetch(&self, req: &FetchRequest) -> Result<RawResponse, IngestError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(req.clone());
        let reply = self.reply.lock().unwrap();
        (*reply)(req)
    }
}

pub fn quote_body(symbol: &str, close: f64) -> String {
    format!(r#"{{"symbol": "{symbol}", "date": "2024-05-31", "close": {close}, "volume": 1200}}"#)
}

pub fn entities(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}
