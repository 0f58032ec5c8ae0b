use tokio::sync::broadcast;

/// In-process telemetry fan-out. Lossy on purpose: nothing here carries
/// correctness, the bus of record is Redis.
#[derive(Clone)]
pub(crate) struct RingBus<T: Clone + Send + Sync + 'static> {
    tx: broadcast::Sender<T>,
}

impl<T: Clone + Send + Sync + 'static> RingBus<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(16));
        Self { tx }
    }

    /// Publish only when somebody is listening; a lagging subscriber loses
    /// events rather than applying backpressure to the pipeline.
    pub(crate) fn publish_lossy(&self, event: T) -> bool {
        if self.tx.receiver_count() == 0 {
            return false;
        }
        self.tx.send(event).is_ok()
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<T> {
        self.tx.subscribe()
    }

    pub(crate) fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
