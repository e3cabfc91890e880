use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;
use crate::channel::{Connector, Link};

/// In-process connector. Every successful connect hands the far end of a
/// fresh [`Link`] to whoever holds the accept receiver (a relay, or a test).
pub struct MemoryConnector {
    accept: mpsc::UnboundedSender<Link>,
    failures: parking_lot::Mutex<u32>,
    attempts: parking_lot::Mutex<Vec<Instant>>,
}

impl MemoryConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Link>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Self {
            accept: tx,
            failures: parking_lot::Mutex::new(0),
            attempts: parking_lot::Mutex::new(Vec::new()),
        };
        (connector, rx)
    }

    /// Makes the next `n` connects (and probes) fail.
    pub fn fail_next(&self, n: u32) {
        *self.failures.lock() = n;
    }

    /// When each connect or probe was attempted.
    pub fn attempts(&self) -> Vec<Instant> {
        self.attempts.lock().clone()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, url: &str) -> anyhow::Result<Link> {
        self.attempts.lock().push(Instant::now());
        {
            let mut failures = self.failures.lock();
            if *failures > 0 {
                *failures -= 1;
                anyhow::bail!("connection to {} refused", url);
            }
        }
        let (near, far) = Link::pair();
        self.accept
            .send(far)
            .map_err(|_| anyhow::anyhow!("nothing is accepting on {}", url))?;
        Ok(near)
    }

    async fn probe(&self, url: &str) -> anyhow::Result<()> {
        self.attempts.lock().push(Instant::now());
        let mut failures = self.failures.lock();
        if *failures > 0 {
            *failures -= 1;
            anyhow::bail!("probe of {} failed", url);
        }
        Ok(())
    }
}
