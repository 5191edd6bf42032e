use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};

use super::connection::{ConnectionFactory, LinkEvent, LinkEventSink};
use super::link::PeerLink;
use crate::error::Result;
use crate::signaling::PeerId;

/// One [`PeerLink`] per remote participant.
pub struct ConnectionRegistry {
    factory: Arc<dyn ConnectionFactory>,
    events: mpsc::UnboundedSender<LinkEvent>,
    links: RwLock<HashMap<PeerId, Arc<PeerLink>>>,
}

impl ConnectionRegistry {
    /// Callbacks of every connection opened here are delivered to `events`.
    pub fn new(factory: Arc<dyn ConnectionFactory>, events: mpsc::UnboundedSender<LinkEvent>) -> Self {
        Self {
            factory,
            events,
            links: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the link for `peer_id`, creating it on first use.
    pub async fn open(&self, peer_id: &str) -> Result<Arc<PeerLink>> {
        if let Some(link) = self.links.read().await.get(peer_id) {
            return Ok(Arc::clone(link));
        }

        let mut links = self.links.write().await;
        // Someone may have opened it between the two locks.
        if let Some(link) = links.get(peer_id) {
            return Ok(Arc::clone(link));
        }

        let sink = LinkEventSink::new(peer_id.to_string(), self.events.clone());
        let connection = self.factory.create(sink).await?;
        let link = Arc::new(PeerLink::new(peer_id.to_string(), connection));
        links.insert(peer_id.to_string(), Arc::clone(&link));
        info!("Opened link to {}", peer_id);
        Ok(link)
    }

    pub async fn get(&self, peer_id: &str) -> Option<Arc<PeerLink>> {
        self.links.read().await.get(peer_id).cloned()
    }

    /// Closes and forgets the link; unknown ids are ignored.
    pub async fn close(&self, peer_id: &str) {
        let link = self.links.write().await.remove(peer_id);
        if let Some(link) = link {
            link.close().await;
            info!("Closed link to {}", peer_id);
        }
    }

    pub async fn close_all(&self) {
        let links: Vec<(PeerId, Arc<PeerLink>)> = self.links.write().await.drain().collect();
        for (peer_id, link) in links {
            debug!("Closing link to {}", peer_id);
            link.close().await;
        }
    }

    pub async fn peer_ids(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self.links.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn links(&self) -> Vec<Arc<PeerLink>> {
        self.links.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.links.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.links.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::loopback::LoopbackFactory;

    fn registry() -> (ConnectionRegistry, Arc<LoopbackFactory>, mpsc::UnboundedReceiver<LinkEvent>) {
        let factory = Arc::new(LoopbackFactory::new());
        let (tx, rx) = mpsc::unbounded_channel();
        (ConnectionRegistry::new(factory.clone(), tx), factory, rx)
    }

    #[tokio::test]
    async fn test_open_is_idempotent() {
        let (registry, factory, _rx) = registry();
        let first = registry.open("b").await.unwrap();
        let second = registry.open("b").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(factory.created(), 1);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_close_then_open_creates_fresh_link() {
        let (registry, factory, _rx) = registry();
        let first = registry.open("b").await.unwrap();
        registry.close("b").await;
        assert!(registry.get("b").await.is_none());

        let second = registry.open("b").await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(factory.created(), 2);
    }

    #[tokio::test]
    async fn test_close_releases_connection() {
        let (registry, factory, _rx) = registry();
        registry.open("b").await.unwrap();
        let conn = factory.connection("b").await.unwrap();
        registry.close("b").await;
        assert!(conn.record().await.closed);
    }

    #[tokio::test]
    async fn test_close_absent_is_noop() {
        let (registry, _factory, _rx) = registry();
        registry.close("nobody").await;
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_close_all() {
        let (registry, factory, _rx) = registry();
        for id in ["b", "c", "d"] {
            registry.open(id).await.unwrap();
        }
        assert_eq!(registry.peer_ids().await, vec!["b", "c", "d"]);

        registry.close_all().await;
        assert!(registry.is_empty().await);
        for id in ["b", "c", "d"] {
            assert!(factory.connection(id).await.unwrap().record().await.closed);
        }
    }

    #[tokio::test]
    async fn test_callbacks_are_tagged_with_peer() {
        let (registry, _factory, mut rx) = registry();
        let link = registry.open("b").await.unwrap();
        link.close().await;

        let event = rx.try_recv().unwrap();
        assert_eq!(event.peer_id, "b");
    }
}
