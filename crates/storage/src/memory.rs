//! In-memory mailbox and presence adapters for tests and single-process
//! development. Same contracts as the PostgreSQL/Redis backends, no I/O.

use crate::{Mailbox, PresenceState, PresenceStore, QueuedMessage, StorageError};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::Mutex;

#[derive(Default)]
pub struct MemoryMailbox {
    next_id: AtomicI64,
    rows: Mutex<Vec<QueuedMessage>>,
}

impl MemoryMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    async fn insert(
        &self,
        sender: i64,
        recipient: i64,
        content: &[u8],
        delivered: bool,
    ) -> QueuedMessage {
        let now = Utc::now();
        let message = QueuedMessage {
            id: self.next_id.fetch_add(1, Ordering::Relaxed) + 1,
            sender_id: sender,
            recipient_id: recipient,
            content: content.to_vec(),
            created_at: now,
            delivered,
            delivered_at: delivered.then_some(now),
            is_read: false,
            read_at: None,
        };
        self.rows.lock().await.push(message.clone());
        message
    }
}

#[async_trait]
impl Mailbox for MemoryMailbox {
    async fn store(
        &self,
        sender: i64,
        recipient: i64,
        content: &[u8],
    ) -> Result<QueuedMessage, StorageError> {
        Ok(self.insert(sender, recipient, content, false).await)
    }

    async fn store_delivered(
        &self,
        sender: i64,
        recipient: i64,
        content: &[u8],
    ) -> Result<QueuedMessage, StorageError> {
        Ok(self.insert(sender, recipient, content, true).await)
    }

    async fn fetch_undelivered_after(
        &self,
        recipient: i64,
        after: i64,
        limit: i64,
    ) -> Result<Vec<QueuedMessage>, StorageError> {
        let rows = self.rows.lock().await;
        Ok(rows
            .iter()
            .filter(|row| row.recipient_id == recipient && row.id > after && !row.delivered)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn mark_delivered(&self, ids: &[i64]) -> Result<u64, StorageError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let now = Utc::now();
        let mut rows = self.rows.lock().await;
        let mut count = 0;
        for row in rows.iter_mut() {
            if !row.delivered && ids.contains(&row.id) {
                row.delivered = true;
                row.delivered_at = Some(now);
                count += 1;
            }
        }
        Ok(count)
    }

    async fn mark_read(&self, recipient: i64, ids: &[i64]) -> Result<u64, StorageError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let now = Utc::now();
        let mut rows = self.rows.lock().await;
        let mut count = 0;
        for row in rows.iter_mut() {
            if row.recipient_id == recipient && !row.is_read && ids.contains(&row.id) {
                row.is_read = true;
                row.read_at = Some(now);
                count += 1;
            }
        }
        Ok(count)
    }

    async fn purge_delivered(&self, retention: Duration) -> Result<u64, StorageError> {
        let cutoff = Utc::now() - retention;
        let mut rows = self.rows.lock().await;
        let before = rows.len();
        rows.retain(|row| {
            !(row.delivered && row.delivered_at.map(|at| at <= cutoff).unwrap_or(false))
        });
        Ok((before - rows.len()) as u64)
    }
}

#[derive(Default)]
pub struct MemoryPresence {
    entries: Mutex<HashMap<i64, (PresenceState, DateTime<Utc>)>>,
}

impl MemoryPresence {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PresenceStore for MemoryPresence {
    async fn set_online(&self, peer: i64, ttl_seconds: i64) -> Result<(), StorageError> {
        let expires_at = Utc::now() + Duration::seconds(ttl_seconds.max(0));
        self.entries
            .lock()
            .await
            .insert(peer, (PresenceState::Online, expires_at));
        Ok(())
    }

    async fn set_offline(&self, peer: i64) -> Result<(), StorageError> {
        let expires_at = Utc::now() + Duration::seconds(crate::OFFLINE_TTL_SECONDS);
        self.entries
            .lock()
            .await
            .insert(peer, (PresenceState::Offline, expires_at));
        Ok(())
    }

    async fn is_online(&self, peer: i64) -> Result<bool, StorageError> {
        let entries = self.entries.lock().await;
        Ok(entries
            .get(&peer)
            .map(|(state, expires_at)| *state == PresenceState::Online && *expires_at > Utc::now())
            .unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mailbox_preserves_per_recipient_fifo() {
        let mailbox = MemoryMailbox::new();
        mailbox.store(1, 2, b"first").await.unwrap();
        mailbox.store(3, 9, b"other recipient").await.unwrap();
        mailbox.store(1, 2, b"second").await.unwrap();
        mailbox.store(4, 2, b"third").await.unwrap();
        let pending = mailbox.fetch_undelivered(2, 128).await.unwrap();
        let contents: Vec<&[u8]> = pending.iter().map(|m| m.content.as_slice()).collect();
        assert_eq!(contents, vec![&b"first"[..], &b"second"[..], &b"third"[..]]);
    }

    #[tokio::test]
    async fn fetch_respects_limit() {
        let mailbox = MemoryMailbox::new();
        for index in 0..5 {
            mailbox
                .store(1, 2, format!("msg-{}", index).as_bytes())
                .await
                .unwrap();
        }
        let pending = mailbox.fetch_undelivered(2, 3).await.unwrap();
        assert_eq!(pending.len(), 3);
        assert_eq!(pending[0].content, b"msg-0");
    }

    #[tokio::test]
    async fn fetch_after_resumes_past_the_cursor() {
        let mailbox = MemoryMailbox::new();
        let first = mailbox.store(1, 2, b"one").await.unwrap();
        mailbox.store(1, 2, b"two").await.unwrap();
        mailbox.store(1, 2, b"three").await.unwrap();

        let tail = mailbox
            .fetch_undelivered_after(2, first.id, 128)
            .await
            .unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].content, b"two");
        assert_eq!(tail[1].content, b"three");
    }

    #[tokio::test]
    async fn store_never_deduplicates() {
        let mailbox = MemoryMailbox::new();
        let first = mailbox.store(1, 2, b"same").await.unwrap();
        let second = mailbox.store(1, 2, b"same").await.unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(mailbox.fetch_undelivered(2, 128).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn mark_delivered_is_idempotent() {
        let mailbox = MemoryMailbox::new();
        let message = mailbox.store(1, 2, b"payload").await.unwrap();
        assert_eq!(mailbox.mark_delivered(&[message.id]).await.unwrap(), 1);
        let delivered_at = mailbox.rows.lock().await[0].delivered_at;
        assert!(delivered_at.is_some());
        assert_eq!(mailbox.mark_delivered(&[message.id]).await.unwrap(), 0);
        assert_eq!(mailbox.rows.lock().await[0].delivered_at, delivered_at);
        assert!(mailbox.fetch_undelivered(2, 128).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_id_set_is_a_noop() {
        let mailbox = MemoryMailbox::new();
        mailbox.store(1, 2, b"payload").await.unwrap();
        assert_eq!(mailbox.mark_delivered(&[]).await.unwrap(), 0);
        assert_eq!(mailbox.mark_read(2, &[]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn mark_read_is_scoped_to_recipient() {
        let mailbox = MemoryMailbox::new();
        let mine = mailbox.store(1, 2, b"mine").await.unwrap();
        let theirs = mailbox.store(1, 3, b"theirs").await.unwrap();
        let count = mailbox.mark_read(2, &[mine.id, theirs.id]).await.unwrap();
        assert_eq!(count, 1);
        let rows = mailbox.rows.lock().await;
        assert!(rows[0].is_read);
        assert!(!rows[1].is_read);
    }

    #[tokio::test]
    async fn store_delivered_skips_undelivered_fetch() {
        let mailbox = MemoryMailbox::new();
        let archived = mailbox.store_delivered(1, 2, b"history").await.unwrap();
        assert!(archived.delivered);
        assert!(archived.delivered_at.is_some());
        assert!(mailbox.fetch_undelivered(2, 128).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn purge_honors_retention_window() {
        let mailbox = MemoryMailbox::new();
        let kept = mailbox.store(1, 2, b"undelivered").await.unwrap();
        let gone = mailbox.store(1, 2, b"delivered").await.unwrap();
        mailbox.mark_delivered(&[gone.id]).await.unwrap();
        assert_eq!(mailbox.purge_delivered(Duration::days(30)).await.unwrap(), 0);
        assert_eq!(mailbox.purge_delivered(Duration::zero()).await.unwrap(), 1);
        let rows = mailbox.rows.lock().await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, kept.id);
    }

    #[tokio::test]
    async fn presence_ttl_gates_online() {
        let presence = MemoryPresence::new();
        assert!(!presence.is_online(7).await.unwrap());
        presence.set_online(7, 60).await.unwrap();
        assert!(presence.is_online(7).await.unwrap());
        presence.set_online(7, 0).await.unwrap();
        assert!(!presence.is_online(7).await.unwrap());
    }

    #[tokio::test]
    async fn explicit_offline_overrides_online() {
        let presence = MemoryPresence::new();
        presence.set_online(7, 60).await.unwrap();
        presence.set_offline(7).await.unwrap();
        assert!(!presence.is_online(7).await.unwrap());
    }
}
