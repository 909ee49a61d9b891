#![allow(dead_code)]

use locked_session::{IdGenerator, SessionData, Value};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Always generates the same id.
#[derive(Debug)]
pub struct ConstantIdGenerator(pub &'static str);

impl IdGenerator for ConstantIdGenerator {
    fn generate(&self) -> String {
        self.0.to_owned()
    }
}

/// Always generates the same id, and counts how often it did.
#[derive(Debug)]
pub struct CountingIdGenerator {
    id: &'static str,
    calls: AtomicUsize,
}

impl CountingIdGenerator {
    pub fn new(id: &'static str) -> Self {
        Self {
            id,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl IdGenerator for CountingIdGenerator {
    fn generate(&self) -> String {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.id.to_owned()
    }
}

/// Build session data from `(key, value)` pairs.
pub fn data<const N: usize>(pairs: [(&str, Value); N]) -> SessionData {
    pairs
        .into_iter()
        .map(|(key, value)| (key.to_owned(), value))
        .collect()
}

/// Extracts the `name=value` pair of a `Set-Cookie` header, as a client would send it back.
pub fn cookie_pair(set_cookie: &str) -> String {
    set_cookie.split("; ").next().unwrap().to_owned()
}
