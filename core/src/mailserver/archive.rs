/// Mail archive: envelopes stored in sled, keyed by send time
use crate::error::{BenchError, Result};
use crate::messaging::envelope::{Envelope, Topic};
use std::path::Path;

/// Key length: 8 bytes of send time, then the envelope hash
const KEY_LEN: usize = 8 + 32;

fn key(sent: u64, envelope: &Envelope) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    key[..8].copy_from_slice(&sent.to_be_bytes());
    key[8..].copy_from_slice(&envelope.hash().0);
    key
}

#[derive(Clone)]
pub struct Archive {
    db: sled::Db,
}

impl Archive {
    /// Open the archive under `data_dir`
    pub fn open(data_dir: &Path) -> Result<Self> {
        let db = sled::open(data_dir.join("mail.db"))
            .map_err(|e| BenchError::Storage(format!("Failed to open mail DB: {}", e)))?;
        Ok(Self { db })
    }

    /// Archive that lives only as long as the process
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| BenchError::Storage(format!("Failed to open mail DB: {}", e)))?;
        Ok(Self { db })
    }

    /// Store an envelope; returns `false` if it was already archived
    pub fn save(&self, envelope: &Envelope) -> Result<bool> {
        let value = serde_json::to_vec(envelope)?;
        let previous = self
            .db
            .insert(key(envelope.sent(), envelope), value)
            .map_err(|e| BenchError::Storage(format!("Failed to archive envelope: {}", e)))?;
        Ok(previous.is_none())
    }

    /// Envelopes on `topic` sent within `[from, to]`, oldest first
    pub fn query(&self, from: u64, to: u64, topic: Topic, limit: usize) -> Result<Vec<Envelope>> {
        if from > to || limit == 0 {
            return Ok(Vec::new());
        }

        let mut start = [0u8; KEY_LEN];
        start[..8].copy_from_slice(&from.to_be_bytes());
        let mut end = [0xffu8; KEY_LEN];
        end[..8].copy_from_slice(&to.to_be_bytes());

        let mut found = Vec::new();
        for entry in self.db.range(start..=end) {
            let (_, value) =
                entry.map_err(|e| BenchError::Storage(format!("Failed to read archive: {}", e)))?;
            let envelope: Envelope = serde_json::from_slice(&value)?;
            if envelope.topic == topic {
                found.push(envelope);
                if found.len() >= limit {
                    break;
                }
            }
        }
        Ok(found)
    }

    pub fn count(&self) -> usize {
        self.db.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::envelope::SymKey;
    use tempfile::TempDir;

    const TOPIC: Topic = Topic::new([1, 2, 3, 4]);

    fn envelope(topic: Topic, now: u64, body: &[u8]) -> Envelope {
        Envelope::seal(&SymKey::from_password("pw"), topic, body, 100, now).unwrap()
    }

    #[test]
    fn test_save_is_idempotent() {
        let archive = Archive::temporary().unwrap();
        let env = envelope(TOPIC, 1_000, b"a");
        assert!(archive.save(&env).unwrap());
        assert!(!archive.save(&env).unwrap());
        assert_eq!(archive.count(), 1);
    }

    #[test]
    fn test_query_by_time_and_topic() {
        let archive = Archive::temporary().unwrap();
        let other = Topic::new([9, 9, 9, 9]);
        for (now, topic) in [(1_000, TOPIC), (2_000, TOPIC), (2_500, other), (3_000, TOPIC)] {
            archive.save(&envelope(topic, now, b"x")).unwrap();
        }

        let hits = archive.query(1_500, 3_000, TOPIC, 10).unwrap();
        let sent: Vec<u64> = hits.iter().map(Envelope::sent).collect();
        assert_eq!(sent, vec![2_000, 3_000]);

        assert_eq!(archive.query(0, u64::MAX, TOPIC, 2).unwrap().len(), 2);
        assert!(archive.query(3_000, 1_000, TOPIC, 10).unwrap().is_empty());
    }

    #[test]
    fn test_reopen_keeps_envelopes() {
        let dir = TempDir::new().unwrap();
        {
            let archive = Archive::open(dir.path()).unwrap();
            archive.save(&envelope(TOPIC, 1_000, b"kept")).unwrap();
            archive.db.flush().unwrap();
        }
        let archive = Archive::open(dir.path()).unwrap();
        assert_eq!(archive.count(), 1);
    }
}
