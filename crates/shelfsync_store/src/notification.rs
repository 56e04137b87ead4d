//! Save notifications for observing committed working-copy changes.
//!
//! Every successful save on a [`Context`](crate::Context) emits one
//! [`SaveNotification`] to all subscribers of that context's feed. The
//! notification carries full copies of the saved books, so a subscriber can
//! merge it into another working copy without touching the source.

use crate::book::Book;
use crate::id::EntityId;
use parking_lot::RwLock;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// The changes committed by one save.
#[derive(Debug, Clone, PartialEq)]
pub struct SaveNotification {
    /// Name of the context that saved.
    pub context: String,
    /// Store commit sequence of the save.
    pub sequence: u64,
    /// Books that did not exist before the save.
    pub inserted: Vec<Book>,
    /// Books that existed and were modified.
    pub updated: Vec<Book>,
    /// Books that were deleted.
    pub deleted: Vec<EntityId>,
}

impl SaveNotification {
    /// Returns the IDs of inserted and updated books.
    pub fn changed_ids(&self) -> Vec<EntityId> {
        self.inserted
            .iter()
            .chain(self.updated.iter())
            .map(|book| book.id)
            .collect()
    }

    /// Returns true if the save touched no books.
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }
}

/// Distributes save notifications to subscribers.
///
/// The feed:
/// - Emits only committed saves
/// - Preserves save order
/// - Drops subscribers whose receiver has gone away
pub struct SaveFeed {
    subscribers: RwLock<Vec<UnboundedSender<SaveNotification>>>,
}

impl SaveFeed {
    /// Creates a feed with no subscribers.
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
        }
    }

    /// Subscribes to all future notifications.
    ///
    /// Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> UnboundedReceiver<SaveNotification> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.write().push(tx);
        rx
    }

    /// Emits a notification to every live subscriber.
    pub fn emit(&self, notification: &SaveNotification) {
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|tx| tx.send(notification.clone()).is_ok());
    }

    /// Returns the number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

impl Default for SaveFeed {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notification(sequence: u64) -> SaveNotification {
        SaveNotification {
            context: "viewContext".into(),
            sequence,
            inserted: vec![Book::new_manual("Foo")],
            updated: vec![],
            deleted: vec![],
        }
    }

    #[test]
    fn multiple_subscribers() {
        let feed = SaveFeed::new();
        let mut rx1 = feed.subscribe();
        let mut rx2 = feed.subscribe();

        let note = notification(1);
        feed.emit(&note);

        assert_eq!(rx1.try_recv().unwrap(), note);
        assert_eq!(rx2.try_recv().unwrap(), note);
    }

    #[test]
    fn subscriber_cleanup() {
        let feed = SaveFeed::new();
        let rx = feed.subscribe();
        assert_eq!(feed.subscriber_count(), 1);

        drop(rx);
        feed.emit(&notification(1));
        assert_eq!(feed.subscriber_count(), 0);
    }

    #[test]
    fn changed_ids_cover_inserts_and_updates() {
        let mut note = notification(2);
        let updated = Book::new_manual("Bar");
        note.updated.push(updated.clone());

        let ids = note.changed_ids();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&updated.id));
        assert!(!note.is_empty());
    }
}
