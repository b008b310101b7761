//! history.rs: bounded in-memory log of ingestion run reports (for /debug).

use std::sync::Mutex;

use crate::ingest::orchestrator::{ReportSink, RunReport};

#[derive(Debug)]
pub struct RunHistory {
    inner: Mutex<Vec<RunReport>>,
    cap: usize,
}

impl RunHistory {
    pub fn with_capacity(cap: usize) -> Self {
        let cap = cap.clamp(1, 10_000);
        Self {
            inner: Mutex::new(Vec::with_capacity(cap)),
            cap,
        }
    }

    pub fn push(&self, report: RunReport) {
        let mut v = self.inner.lock().expect("history mutex poisoned");
        v.push(report);
        if v.len() > self.cap {
            let excess = v.len() - self.cap;
            v.drain(0..excess);
        }
    }

    pub fn last(&self) -> Option<RunReport> {
        self.inner
            .lock()
            .expect("history mutex poisoned")
            .last()
            .cloned()
    }

    pub fn snapshot_last_n(&self, n: usize) -> Vec<RunReport> {
        let v = self.inner.lock().expect("history mutex poisoned");
        let start = v.len().saturating_sub(n);
        v[start..].to_vec()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("history mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ReportSink for RunHistory {
    fn emit(&self, report: &RunReport) {
        self.push(report.clone());
    }
}
