/// Message filters: buffered, decrypted subscriptions drained by clients
use crate::error::{BenchError, Result};
use crate::identity::NodeId;
use crate::messaging::envelope::{Envelope, EnvelopeHash, SymKey, Topic};
use std::collections::{HashMap, HashSet};
use tokio::sync::watch;
use uuid::Uuid;

/// What a filter accepts
#[derive(Debug, Clone)]
pub struct Criteria {
    pub sym_key_id: String,
    pub topics: Vec<Topic>,
    /// Accept envelopes delivered point-to-point (by a mail server)
    pub allow_p2p: bool,
}

/// A decrypted message waiting in a filter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub hash: EnvelopeHash,
    pub topic: Topic,
    pub payload: Vec<u8>,
    pub sent: u64,
    pub ttl: u32,
    pub p2p: bool,
    pub from: Option<NodeId>,
}

struct Filter {
    key: SymKey,
    topics: HashSet<Topic>,
    allow_p2p: bool,
    buffer: Vec<ReceivedMessage>,
    seen: HashSet<EnvelopeHash>,
    arrivals: watch::Sender<u64>,
}

impl Filter {
    fn deliver(&mut self, envelope: &Envelope, hash: EnvelopeHash, p2p: bool, from: Option<&NodeId>) -> bool {
        if p2p && !self.allow_p2p {
            return false;
        }
        if !self.topics.contains(&envelope.topic) || self.seen.contains(&hash) {
            return false;
        }
        let Some(payload) = envelope.open(&self.key) else {
            return false;
        };

        self.seen.insert(hash);
        self.buffer.push(ReceivedMessage {
            hash,
            topic: envelope.topic,
            payload,
            sent: envelope.sent(),
            ttl: envelope.ttl,
            p2p,
            from: from.cloned(),
        });
        self.arrivals.send_modify(|n| *n += 1);
        true
    }
}

/// All filters installed on one messaging service
#[derive(Default)]
pub struct Filters {
    filters: HashMap<String, Filter>,
}

impl Filters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a filter and return its id
    pub fn install(&mut self, key: SymKey, criteria: &Criteria) -> Result<String> {
        if criteria.topics.is_empty() {
            return Err(BenchError::Filter("Filter needs at least one topic".to_string()));
        }

        let id = Uuid::new_v4().simple().to_string();
        let (arrivals, _) = watch::channel(0);
        self.filters.insert(
            id.clone(),
            Filter {
                key,
                topics: criteria.topics.iter().copied().collect(),
                allow_p2p: criteria.allow_p2p,
                buffer: Vec::new(),
                seen: HashSet::new(),
                arrivals,
            },
        );
        Ok(id)
    }

    /// Take everything buffered since the last drain
    pub fn drain(&mut self, id: &str) -> Result<Vec<ReceivedMessage>> {
        let filter = self
            .filters
            .get_mut(id)
            .ok_or_else(|| BenchError::Filter(format!("filter {} not found", id)))?;
        Ok(std::mem::take(&mut filter.buffer))
    }

    pub fn uninstall(&mut self, id: &str) -> bool {
        self.filters.remove(id).is_some()
    }

    /// Counter bumped on every message accepted by the filter
    pub fn arrivals(&self, id: &str) -> Option<watch::Receiver<u64>> {
        self.filters.get(id).map(|f| f.arrivals.subscribe())
    }

    /// Offer an envelope to every filter; returns how many accepted it
    pub fn notify(&mut self, envelope: &Envelope, p2p: bool, from: Option<&NodeId>) -> usize {
        if self.filters.is_empty() {
            return 0;
        }
        let hash = envelope.hash();
        let mut accepted = 0;
        for filter in self.filters.values_mut() {
            if filter.deliver(envelope, hash, p2p, from) {
                accepted += 1;
            }
        }
        accepted
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOPIC: Topic = Topic::new([1, 2, 3, 4]);

    fn criteria(allow_p2p: bool) -> Criteria {
        Criteria {
            sym_key_id: "k".to_string(),
            topics: vec![TOPIC],
            allow_p2p,
        }
    }

    fn sealed(password: &str, topic: Topic) -> Envelope {
        Envelope::seal(&SymKey::from_password(password), topic, b"payload", 60, 0).unwrap()
    }

    #[test]
    fn test_matching_envelope_is_buffered_once() {
        let mut filters = Filters::new();
        let id = filters
            .install(SymKey::from_password("pw"), &criteria(false))
            .unwrap();

        let env = sealed("pw", TOPIC);
        assert_eq!(filters.notify(&env, false, None), 1);
        assert_eq!(filters.notify(&env, false, None), 0);

        let drained = filters.drain(&id).unwrap();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].payload, b"payload");
        assert!(filters.drain(&id).unwrap().is_empty());

        // Already counted: a redelivery after the drain is not recounted
        filters.notify(&env, false, None);
        assert!(filters.drain(&id).unwrap().is_empty());
    }

    #[test]
    fn test_topic_and_key_must_match() {
        let mut filters = Filters::new();
        let id = filters
            .install(SymKey::from_password("pw"), &criteria(false))
            .unwrap();

        assert_eq!(filters.notify(&sealed("pw", Topic::new([0; 4])), false, None), 0);
        assert_eq!(filters.notify(&sealed("other", TOPIC), false, None), 0);
        assert!(filters.drain(&id).unwrap().is_empty());
    }

    #[test]
    fn test_p2p_requires_allow_p2p() {
        let mut filters = Filters::new();
        let plain = filters
            .install(SymKey::from_password("pw"), &criteria(false))
            .unwrap();
        let p2p = filters
            .install(SymKey::from_password("pw"), &criteria(true))
            .unwrap();

        let env = sealed("pw", TOPIC);
        assert_eq!(filters.notify(&env, true, None), 1);
        assert!(filters.drain(&plain).unwrap().is_empty());
        let got = filters.drain(&p2p).unwrap();
        assert_eq!(got.len(), 1);
        assert!(got[0].p2p);
    }

    #[test]
    fn test_notify_counts_every_accepting_filter() {
        let mut filters = Filters::new();
        let ids: Vec<String> = (0..3)
            .map(|_| filters.install(SymKey::from_password("pw"), &criteria(false)).unwrap())
            .collect();
        assert_eq!(filters.len(), 3);

        assert_eq!(filters.notify(&sealed("pw", TOPIC), false, None), 3);
        for id in &ids {
            assert_eq!(filters.drain(id).unwrap().len(), 1);
        }
    }

    #[test]
    fn test_deleted_filter_cannot_be_drained() {
        let mut filters = Filters::new();
        let id = filters
            .install(SymKey::from_password("pw"), &criteria(false))
            .unwrap();
        assert!(filters.uninstall(&id));
        assert!(!filters.uninstall(&id));
        assert!(matches!(filters.drain(&id), Err(BenchError::Filter(_))));
        assert!(filters.arrivals(&id).is_none());
    }

    #[test]
    fn test_empty_topics_rejected() {
        let mut filters = Filters::new();
        let mut c = criteria(false);
        c.topics.clear();
        assert!(filters.install(SymKey::from_password("pw"), &c).is_err());
        assert!(filters.is_empty());
    }

    #[test]
    fn test_arrivals_counter_tracks_accepted_messages() {
        let mut filters = Filters::new();
        let id = filters
            .install(SymKey::from_password("pw"), &criteria(false))
            .unwrap();
        let rx = filters.arrivals(&id).unwrap();

        filters.notify(&sealed("pw", TOPIC), false, None);
        filters.notify(&sealed("pw", TOPIC), false, None);
        filters.notify(&sealed("nope", TOPIC), false, None);
        assert_eq!(*rx.borrow(), 2);
    }
}
