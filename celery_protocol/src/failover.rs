use crate::backend::Broker;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Chooses the next broker to try from a non-empty list, typically after a
/// previous publish attempt failed.
pub trait FailoverStrategy: Send + Sync {
    /// Picks a broker out of `brokers`, which is never empty.
    fn choose<'a>(&self, brokers: &'a [Arc<dyn Broker>]) -> &'a Arc<dyn Broker>;
}

/// Cycles through the broker list with an independent counter, wrapping
/// around. The built-in default strategy.
#[derive(Default)]
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl RoundRobin {
    /// Creates a fresh round-robin strategy starting at the first broker.
    pub fn new() -> Self {
        Self::default()
    }
}

impl FailoverStrategy for RoundRobin {
    fn choose<'a>(&self, brokers: &'a [Arc<dyn Broker>]) -> &'a Arc<dyn Broker> {
        let index = self.counter.fetch_add(1, Ordering::Relaxed) % brokers.len();
        &brokers[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    struct NamedBroker(&'static str);

    #[async_trait::async_trait]
    impl Broker for NamedBroker {
        async fn publish(
            &self,
            _envelope: &crate::envelope::TaskEnvelope,
        ) -> Result<String, crate::backend::TransportError> {
            unimplemented!()
        }
        async fn close(&self) {}
        fn name(&self) -> &str {
            self.0
        }
    }

    #[test]
    fn cycles_through_brokers_independently_per_strategy_instance() {
        // Given
        let brokers: Vec<Arc<dyn Broker>> =
            vec![Arc::new(NamedBroker("a")), Arc::new(NamedBroker("b")), Arc::new(NamedBroker("c"))];
        let strategy = RoundRobin::new();

        // When
        let picks: Vec<&str> =
            (0..5).map(|_| strategy.choose(&brokers).name()).collect();

        // Then
        assert_eq!(picks, vec!["a", "b", "c", "a", "b"]);
    }
}
