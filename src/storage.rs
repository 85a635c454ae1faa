use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{event, Level};

use crate::dialog::{sort_pair, Contact, Dialog, Message};
use crate::errors::StorageError;
use crate::time::create_timestamp;

pub const CONTACTS_FILE: &str = "contacts.json";
pub const DEFAULT_MESSAGE_LIMIT: usize = 50;

/// One row of `list_dialogs`: a dialog as seen from a single participant.
#[derive(Debug, Clone)]
pub struct DialogSummary {
    pub participants: [String; 2],
    pub other_participant: String,
    pub last_message: Option<Message>,
    pub unread_count: usize,
    pub last_activity: u64,
}

/// Durable per-pair message log plus the contact directory, persisted as one
/// JSON document per dialog and a single contacts document under `data_dir`.
///
/// Mutating operations serialize per dialog key, so logically concurrent
/// appends to the same pair cannot clobber each other's read-modify-write.
/// Every persist goes through write-temp-then-rename so a crash mid-write
/// never corrupts an existing record.
pub struct ConversationStore {
    data_dir: PathBuf,
    dialog_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    contacts_lock: Mutex<()>,
}

impl ConversationStore {
    pub fn new<P: AsRef<Path>>(data_dir: P) -> crate::Result<ConversationStore> {
        let data_dir = data_dir.as_ref().to_path_buf();
        fs::create_dir_all(&data_dir).map_err(StorageError::Io)?;
        Ok(ConversationStore {
            data_dir,
            dialog_locks: Mutex::new(HashMap::new()),
            contacts_lock: Mutex::new(()),
        })
    }

    /// Storage key for the unordered pair: a fixed-width content hash of the
    /// sorted identities. Hashing instead of truncating a sanitized literal
    /// keeps two distinct long pairs from ever colliding on one record.
    pub fn dialog_key(a: &str, b: &str) -> String {
        let (lo, hi) = sort_pair(a, b);
        blake3::hash(format!("{}|{}", lo, hi).as_bytes())
            .to_hex()
            .to_string()
    }

    pub fn dialog_path(&self, a: &str, b: &str) -> PathBuf {
        self.data_dir
            .join(format!("{}.json", ConversationStore::dialog_key(a, b)))
    }

    async fn key_lock(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.dialog_locks.lock().await;
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Returns the dialog for the sorted pair, creating and persisting an
    /// empty one if absent. Safe to call concurrently for the same pair.
    pub async fn get_or_create_dialog(&self, a: &str, b: &str) -> crate::Result<Dialog> {
        let key = ConversationStore::dialog_key(a, b);
        let lock = self.key_lock(&key).await;
        let _guard = lock.lock().await;
        self.get_or_create_dialog_locked(a, b)
    }

    fn get_or_create_dialog_locked(&self, a: &str, b: &str) -> crate::Result<Dialog> {
        let path = self.dialog_path(a, b);
        match read_json::<Dialog>(&path)? {
            Some(dialog) => Ok(dialog),
            None => {
                let dialog = Dialog::new(a, b);
                write_json(&path, &dialog)?;
                Ok(dialog)
            }
        }
    }

    /// The single mutation path for new messages, locally sent or received
    /// from the transport. Appends to the pair's dialog, persists the whole
    /// record, and create-or-touches both contact entries.
    pub async fn append_message(
        &self,
        from: &str,
        to: &str,
        text: &str,
        timestamp: u64,
    ) -> crate::Result<Message> {
        let key = ConversationStore::dialog_key(from, to);
        let lock = self.key_lock(&key).await;
        let message = {
            let _guard = lock.lock().await;
            let mut dialog = self.get_or_create_dialog_locked(from, to)?;
            let message = Message::new(from, to, text, timestamp);
            dialog.messages.push(message.clone());
            dialog.updated_at = create_timestamp();
            write_json(&self.dialog_path(from, to), &dialog)?;
            message
        };
        self.touch_contacts(&[from, to], timestamp).await?;
        Ok(message)
    }

    /// Every persisted dialog involving `address`, most recent activity
    /// first. Unreadable or corrupt records are skipped with a warning.
    pub async fn list_dialogs(&self, address: &str) -> crate::Result<Vec<DialogSummary>> {
        let mut summaries = Vec::new();
        let entries = fs::read_dir(&self.data_dir).map_err(StorageError::Io)?;
        for entry in entries {
            let entry = entry.map_err(StorageError::Io)?;
            let path = entry.path();
            if path.extension().map(|ext| ext != "json").unwrap_or(true) {
                continue;
            }
            if path.file_name().map(|n| n == CONTACTS_FILE).unwrap_or(false) {
                continue;
            }
            let dialog = match read_json::<Dialog>(&path) {
                Ok(Some(dialog)) => dialog,
                Ok(None) => continue,
                Err(err) => {
                    event!(
                        Level::WARN,
                        "skipping unreadable dialog record {}: {}",
                        path.display(),
                        err
                    );
                    continue;
                }
            };
            if !dialog.involves(address) {
                continue;
            }
            summaries.push(DialogSummary {
                other_participant: dialog.other_participant(address).to_string(),
                last_message: dialog.last_message().cloned(),
                unread_count: dialog.unread_count(address),
                last_activity: dialog.last_activity(),
                participants: dialog.participants,
            });
        }
        summaries.sort_by(|x, y| y.last_activity.cmp(&x.last_activity));
        Ok(summaries)
    }

    /// Messages for the pair sorted ascending by timestamp, truncated to the
    /// most recent `limit` (default 50).
    pub async fn list_messages(
        &self,
        a: &str,
        b: &str,
        limit: Option<usize>,
    ) -> crate::Result<Vec<Message>> {
        let limit = limit.unwrap_or(DEFAULT_MESSAGE_LIMIT);
        let mut messages = match read_json::<Dialog>(&self.dialog_path(a, b))? {
            Some(dialog) => dialog.messages,
            None => return Ok(vec![]),
        };
        messages.sort_by_key(|m| m.timestamp);
        if messages.len() > limit {
            messages.drain(..messages.len() - limit);
        }
        Ok(messages)
    }

    /// Flips `read` on every message in the pair's dialog addressed to
    /// `reader`. Persists only when at least one flag actually flipped.
    pub async fn mark_read(&self, a: &str, b: &str, reader: &str) -> crate::Result<usize> {
        let key = ConversationStore::dialog_key(a, b);
        let lock = self.key_lock(&key).await;
        let _guard = lock.lock().await;
        let mut dialog = match read_json::<Dialog>(&self.dialog_path(a, b))? {
            Some(dialog) => dialog,
            None => return Ok(0),
        };
        let mut flipped = 0;
        for message in dialog.messages.iter_mut() {
            if message.to == reader && !message.read {
                message.read = true;
                flipped += 1;
            }
        }
        if flipped > 0 {
            dialog.updated_at = create_timestamp();
            write_json(&self.dialog_path(a, b), &dialog)?;
        }
        Ok(flipped)
    }

    pub async fn unread_total(&self, address: &str) -> crate::Result<usize> {
        let dialogs = self.list_dialogs(address).await?;
        Ok(dialogs.iter().map(|d| d.unread_count).sum())
    }

    pub async fn contacts(&self) -> crate::Result<Vec<Contact>> {
        let _guard = self.contacts_lock.lock().await;
        Ok(read_json::<Vec<Contact>>(&self.data_dir.join(CONTACTS_FILE))?.unwrap_or_default())
    }

    async fn touch_contacts(&self, addresses: &[&str], timestamp: u64) -> crate::Result<()> {
        let _guard = self.contacts_lock.lock().await;
        let path = self.data_dir.join(CONTACTS_FILE);
        let mut contacts = read_json::<Vec<Contact>>(&path)?.unwrap_or_default();
        for address in addresses {
            match contacts.iter_mut().find(|c| c.address == *address) {
                Some(contact) => {
                    if timestamp > contact.last_message_at {
                        contact.last_message_at = timestamp;
                    }
                }
                None => contacts.push(Contact {
                    address: address.to_string(),
                    added_at: create_timestamp(),
                    last_message_at: timestamp,
                }),
            }
        }
        write_json(&path, &contacts)?;
        Ok(())
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> std::result::Result<Option<T>, StorageError> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(StorageError::Io(err)),
    };
    let mut raw = String::new();
    file.read_to_string(&mut raw).map_err(StorageError::Io)?;
    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|err| StorageError::Corrupt {
            path: path.display().to_string(),
            detail: err.to_string(),
        })
}

/// Write to a sibling temp file, then rename over the target. Rename within
/// one directory is atomic, so readers never observe a half-written record.
fn write_json<T: Serialize>(path: &Path, value: &T) -> std::result::Result<(), StorageError> {
    let raw = serde_json::to_vec_pretty(value)?;
    let tmp_path = path.with_extension("json.tmp");
    let mut tmp = File::create(&tmp_path).map_err(StorageError::Io)?;
    tmp.write_all(&raw).map_err(StorageError::Io)?;
    tmp.sync_all().map_err(StorageError::Io)?;
    fs::rename(&tmp_path, path).map_err(StorageError::Io)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store() -> (tempfile::TempDir, ConversationStore) {
        let dir = tempdir().unwrap();
        let store = ConversationStore::new(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn dialog_key_is_pair_order_independent() {
        let (_dir, store) = store();
        assert_eq!(store.dialog_path("X", "Y"), store.dialog_path("Y", "X"));
        assert_ne!(store.dialog_path("X", "Y"), store.dialog_path("X", "X"));
    }

    #[test]
    fn dialog_key_has_fixed_width_for_long_identities() {
        let long_a = "A".repeat(4096);
        let long_b = "B".repeat(4096);
        let key_ab = ConversationStore::dialog_key(&long_a, &long_b);
        let key_aa = ConversationStore::dialog_key(&long_a, &long_a);
        assert_eq!(key_ab.len(), 64);
        assert_ne!(key_ab, key_aa);
    }

    #[tokio::test]
    async fn append_then_list_returns_the_message_last() {
        let (_dir, store) = store();
        store.append_message("A", "B", "one", 1000).await.unwrap();
        let sent = store.append_message("A", "B", "two", 2000).await.unwrap();
        let messages = store.list_messages("A", "B", None).await.unwrap();
        assert_eq!(messages.last().unwrap(), &sent);
    }

    #[tokio::test]
    async fn list_messages_sorts_by_timestamp_and_truncates() {
        let (_dir, store) = store();
        store.append_message("A", "B", "late", 3000).await.unwrap();
        store.append_message("A", "B", "early", 1000).await.unwrap();
        store.append_message("A", "B", "mid", 2000).await.unwrap();
        let all = store.list_messages("A", "B", None).await.unwrap();
        let texts: Vec<&str> = all.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["early", "mid", "late"]);
        let last_two = store.list_messages("A", "B", Some(2)).await.unwrap();
        let texts: Vec<&str> = last_two.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["mid", "late"]);
    }

    #[tokio::test]
    async fn sender_view_has_no_unread() {
        let (_dir, store) = store();
        store.append_message("A", "B", "hi", 1000).await.unwrap();
        let dialogs = store.list_dialogs("A").await.unwrap();
        assert_eq!(dialogs.len(), 1);
        assert_eq!(dialogs[0].other_participant, "B");
        assert_eq!(dialogs[0].last_message.as_ref().unwrap().text, "hi");
        assert_eq!(dialogs[0].unread_count, 0);
    }

    #[tokio::test]
    async fn recipient_unread_clears_after_mark_read() {
        let (_dir, store) = store();
        store.append_message("A", "B", "hi", 1000).await.unwrap();
        let dialogs = store.list_dialogs("B").await.unwrap();
        assert_eq!(dialogs[0].unread_count, 1);
        assert_eq!(store.unread_total("B").await.unwrap(), 1);

        assert_eq!(store.mark_read("A", "B", "B").await.unwrap(), 1);
        assert_eq!(store.unread_total("B").await.unwrap(), 0);
        // Idempotent: nothing left to flip.
        assert_eq!(store.mark_read("A", "B", "B").await.unwrap(), 0);
        assert_eq!(store.unread_total("B").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unread_total_sums_across_dialogs() {
        let (_dir, store) = store();
        store.append_message("A", "X", "one", 1000).await.unwrap();
        store.append_message("B", "X", "two", 2000).await.unwrap();
        store.append_message("B", "X", "three", 3000).await.unwrap();
        store.append_message("X", "A", "reply", 4000).await.unwrap();
        let dialogs = store.list_dialogs("X").await.unwrap();
        let by_hand: usize = dialogs.iter().map(|d| d.unread_count).sum();
        assert_eq!(by_hand, 3);
        assert_eq!(store.unread_total("X").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn dialogs_order_by_most_recent_activity() {
        let (_dir, store) = store();
        store.append_message("A", "B", "old", 1000).await.unwrap();
        store.append_message("A", "C", "new", 2000).await.unwrap();
        // A dialog with no messages sorts by its updated_at.
        store.get_or_create_dialog("A", "D").await.unwrap();
        let dialogs = store.list_dialogs("A").await.unwrap();
        assert_eq!(dialogs.len(), 3);
        assert_eq!(dialogs[0].other_participant, "D");
        assert_eq!(dialogs[1].other_participant, "C");
        assert_eq!(dialogs[2].other_participant, "B");
    }

    #[tokio::test]
    async fn self_dialog_is_retrievable() {
        let (_dir, store) = store();
        let dialog = store.get_or_create_dialog("A", "A").await.unwrap();
        assert_eq!(dialog.participants, ["A".to_string(), "A".to_string()]);
        let dialogs = store.list_dialogs("A").await.unwrap();
        assert_eq!(dialogs.len(), 1);
        assert_eq!(dialogs[0].other_participant, "A");
    }

    #[tokio::test]
    async fn contacts_are_touched_never_duplicated() {
        let (_dir, store) = store();
        store.append_message("A", "B", "one", 1000).await.unwrap();
        store.append_message("A", "B", "two", 2000).await.unwrap();
        let contacts = store.contacts().await.unwrap();
        assert_eq!(contacts.len(), 2);
        let b = contacts.iter().find(|c| c.address == "B").unwrap();
        assert_eq!(b.last_message_at, 2000);
    }

    #[tokio::test]
    async fn concurrent_appends_to_one_pair_lose_nothing() {
        let (_dir, store) = store();
        let store = Arc::new(store);
        let mut handles = vec![];
        for i in 0..8u64 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .append_message("A", "B", &format!("m{}", i), 1000 + i)
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        let messages = store.list_messages("A", "B", None).await.unwrap();
        assert_eq!(messages.len(), 8);
    }

    #[tokio::test]
    async fn corrupt_records_are_skipped_in_scans() {
        let (dir, store) = store();
        store.append_message("A", "B", "ok", 1000).await.unwrap();
        fs::write(dir.path().join("deadbeef.json"), b"{ not json").unwrap();
        let dialogs = store.list_dialogs("A").await.unwrap();
        assert_eq!(dialogs.len(), 1);
        assert_eq!(dialogs[0].other_participant, "B");
    }

    #[tokio::test]
    async fn concurrent_get_or_create_never_loses_the_dialog() {
        let (_dir, store) = store();
        let store = Arc::new(store);
        let first = store.clone();
        let second = store.clone();
        let (one, two) = tokio::join!(
            tokio::spawn(async move { first.get_or_create_dialog("A", "B").await.unwrap() }),
            tokio::spawn(async move { second.get_or_create_dialog("B", "A").await.unwrap() }),
        );
        assert_eq!(one.unwrap().participants, two.unwrap().participants);
    }
}
