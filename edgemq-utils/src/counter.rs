use std::fmt;
use std::sync::atomic::{AtomicIsize, Ordering};

use serde_json::json;

/// Gauge tracking a current value and the highest value it ever reached.
#[derive(Default)]
pub struct Counter {
    current: AtomicIsize,
    max: AtomicIsize,
}

impl Clone for Counter {
    fn clone(&self) -> Self {
        Counter { current: AtomicIsize::new(self.count()), max: AtomicIsize::new(self.max()) }
    }
}

impl fmt::Debug for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, r#"{{ "count":{}, "max":{} }}"#, self.count(), self.max())
    }
}

impl Counter {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn inc(&self) {
        self.incs(1);
    }

    #[inline]
    pub fn incs(&self, c: isize) {
        let prev = self.current.fetch_add(c, Ordering::SeqCst);
        self.max.fetch_max(prev + c, Ordering::SeqCst);
    }

    #[inline]
    pub fn dec(&self) {
        self.decs(1)
    }

    #[inline]
    pub fn decs(&self, c: isize) {
        self.current.fetch_sub(c, Ordering::SeqCst);
    }

    #[inline]
    pub fn sets(&self, c: isize) {
        self.current.store(c, Ordering::SeqCst);
        self.max.fetch_max(c, Ordering::SeqCst);
    }

    #[inline]
    pub fn count(&self) -> isize {
        self.current.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn max(&self) -> isize {
        self.max.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "count": self.count(),
            "max": self.max()
        })
    }
}
