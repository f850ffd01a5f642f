//! In-memory stand-in for `finance_fabric::bus::EventBus`, so the
//! replication and snapshot pipelines can be driven end-to-end in tests
//! without a live broker.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use finance_fabric::bus::{Bus, Consumer, Delivery};
use finance_fabric::error::FabricResult;
use tokio::sync::mpsc;

struct Queue {
    tx: mpsc::UnboundedSender<Delivery>,
    rx: Option<mpsc::UnboundedReceiver<Delivery>>,
}

#[derive(Default)]
struct Inner {
    /// exchange -> bound queue names.
    exchanges: HashMap<String, Vec<String>>,
    queues: HashMap<String, Queue>,
    anon_counter: u64,
}

#[derive(Default)]
pub struct FakeBus {
    inner: Mutex<Inner>,
}

impl FakeBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn create_queue(&self, name: &str) -> String {
        let mut inner = self.inner.lock().unwrap();
        let name = if name.is_empty() {
            inner.anon_counter += 1;
            format!("anon-{}", inner.anon_counter)
        } else {
            name.to_string()
        };
        inner.queues.entry(name.clone()).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            Queue { tx, rx: Some(rx) }
        });
        name
    }
}

#[async_trait]
impl Bus for FakeBus {
    async fn declare_fanout(&self, name: &str, _durable: bool) -> FabricResult<()> {
        self.inner.lock().unwrap().exchanges.entry(name.to_string()).or_default();
        Ok(())
    }

    async fn declare_queue(&self, name: &str, _durable: bool, _exclusive: bool) -> FabricResult<String> {
        Ok(self.create_queue(name))
    }

    async fn bind_queue(&self, queue: &str, exchange: &str) -> FabricResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.exchanges.entry(exchange.to_string()).or_default().push(queue.to_string());
        Ok(())
    }

    async fn publish_to_exchange(
        &self,
        exchange: &str,
        body: &[u8],
        reply_to: Option<&str>,
        correlation_id: Option<&str>,
    ) -> FabricResult<()> {
        let targets = self.inner.lock().unwrap().exchanges.get(exchange).cloned().unwrap_or_default();
        for queue in targets {
            self.publish_to_queue(&queue, body, reply_to, correlation_id).await?;
        }
        Ok(())
    }

    async fn publish_to_queue(
        &self,
        queue: &str,
        body: &[u8],
        reply_to: Option<&str>,
        correlation_id: Option<&str>,
    ) -> FabricResult<()> {
        let inner = self.inner.lock().unwrap();
        if let Some(q) = inner.queues.get(queue) {
            let delivery = Delivery::without_backend(body.to_vec(), reply_to.map(str::to_string), correlation_id.map(str::to_string));
            let _ = q.tx.send(delivery);
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, _consumer_tag: &str) -> FabricResult<Box<dyn Consumer>> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.queues.entry(queue.to_string()).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            Queue { tx, rx: Some(rx) }
        });
        let rx = entry.rx.take().expect("queue already has a consumer");
        Ok(Box::new(FakeConsumer(rx)))
    }
}

struct FakeConsumer(mpsc::UnboundedReceiver<Delivery>);

#[async_trait]
impl Consumer for FakeConsumer {
    async fn recv(&mut self) -> Option<Delivery> {
        self.0.recv().await
    }
}
