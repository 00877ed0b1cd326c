//! Session/entry persistence boundary (SPEC_FULL §3A).
//!
//! Durable storage is explicitly out of scope (spec.md §1); this trait is
//! the seam a real deployment would implement against. `InMemoryStore` is
//! the implementation this crate ships for tests and standalone runs,
//! grounded on the map-of-`Arc<Session>` shape this workspace's session
//! registry already uses elsewhere.

use dashmap::DashMap;
use std::sync::Arc;

use crate::error::{Result, RuntimeError};
use crate::types::{Entry, EntryBody, EntryId, Session, SessionId};

pub trait SessionStore: Send + Sync {
    fn create(&self, parent: Option<SessionId>) -> Session;
    fn get(&self, id: &SessionId) -> Result<Session>;
    fn append_entry(&self, id: &SessionId, body: EntryBody) -> Result<Entry>;
    fn entry(&self, id: &SessionId, entry_id: &EntryId) -> Result<Entry>;
    /// The branch from root to the session's current leaf, in root-first
    /// order.
    fn branch(&self, id: &SessionId) -> Result<Vec<Entry>>;
    fn list(&self) -> Vec<SessionId>;
    fn delete(&self, id: &SessionId) -> Result<()>;
    /// Deep-copy the branch ending at `leaf` (or the session's current leaf
    /// if `None`) into a brand-new session with fresh entry ids and parent
    /// pointers rewritten to the clones (SPEC_FULL §8 Fork copy law).
    fn fork(&self, id: &SessionId, leaf: Option<EntryId>) -> Result<Session>;
    /// Move the session's leaf pointer to an existing entry (or back to the
    /// root with `None`), without touching any entry. Used by
    /// `brain.run.regenerate`/`edit_rerun`: later entries stay in the DAG but
    /// drop out of the branch, and the next `append_entry` starts a new
    /// child of `leaf`.
    fn rewind(&self, id: &SessionId, leaf: Option<EntryId>) -> Result<Session>;
    /// Best-effort title set on a session, tagged with its `source` (e.g.
    /// `"auto"` for the loop's end-of-run title refresh, `"user"` for an
    /// explicit rename).
    fn set_title(&self, id: &SessionId, title: String, source: String) -> Result<Session>;
    /// Record the tab ids a run declared it shares (SPEC_FULL §3A Session
    /// metadata "shared tabs, primary tab id"), inferring `primary_tab_id`
    /// as the first one when the session didn't already have one. Returns
    /// whether the primary tab id was freshly inferred, so the caller can
    /// tell `input.shared_tabs` apart from `input.tab_ids_inferred`.
    fn set_shared_tabs(&self, id: &SessionId, tab_ids: Vec<String>) -> Result<(Session, bool)>;
}

struct SessionRecord {
    session: Session,
    entries: Vec<Entry>,
}

pub struct InMemoryStore {
    sessions: DashMap<SessionId, SessionRecord>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }
}

impl SessionStore for InMemoryStore {
    fn create(&self, parent: Option<SessionId>) -> Session {
        let mut session = Session::new(SessionId::generate());
        session.parent = parent;
        self.sessions.insert(
            session.id.clone(),
            SessionRecord {
                session: session.clone(),
                entries: Vec::new(),
            },
        );
        session
    }

    fn get(&self, id: &SessionId) -> Result<Session> {
        self.sessions
            .get(id)
            .map(|r| r.session.clone())
            .ok_or_else(|| RuntimeError::session_not_found(id.as_str()))
    }

    fn append_entry(&self, id: &SessionId, body: EntryBody) -> Result<Entry> {
        let mut record = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| RuntimeError::session_not_found(id.as_str()))?;
        let parent_id = record.session.leaf.clone();
        let entry = Entry::new(parent_id, body);
        record.session.leaf = Some(entry.id.clone());
        record.entries.push(entry.clone());
        Ok(entry)
    }

    fn entry(&self, id: &SessionId, entry_id: &EntryId) -> Result<Entry> {
        let record = self
            .sessions
            .get(id)
            .ok_or_else(|| RuntimeError::session_not_found(id.as_str()))?;
        record
            .entries
            .iter()
            .find(|e| &e.id == entry_id)
            .cloned()
            .ok_or_else(|| RuntimeError::internal(format!("entry not found: {entry_id}")))
    }

    fn branch(&self, id: &SessionId) -> Result<Vec<Entry>> {
        let record = self
            .sessions
            .get(id)
            .ok_or_else(|| RuntimeError::session_not_found(id.as_str()))?;
        walk_branch(&record.entries, record.session.leaf.clone())
    }

    fn list(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|kv| kv.key().clone()).collect()
    }

    fn delete(&self, id: &SessionId) -> Result<()> {
        self.sessions
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| RuntimeError::session_not_found(id.as_str()))
    }

    fn fork(&self, id: &SessionId, leaf: Option<EntryId>) -> Result<Session> {
        let source_branch = {
            let record = self
                .sessions
                .get(id)
                .ok_or_else(|| RuntimeError::session_not_found(id.as_str()))?;
            let leaf = leaf.or_else(|| record.session.leaf.clone());
            walk_branch(&record.entries, leaf)?
        };

        let mut new_session = Session::new(SessionId::generate());
        new_session.parent = Some(id.clone());
        new_session.metadata.forked_from = Some(id.clone());

        let mut id_map: std::collections::HashMap<EntryId, EntryId> =
            std::collections::HashMap::new();
        let mut cloned = Vec::with_capacity(source_branch.len());
        for entry in &source_branch {
            let new_id = EntryId::generate();
            id_map.insert(entry.id.clone(), new_id.clone());
            let new_parent = entry
                .parent_id
                .as_ref()
                .and_then(|p| id_map.get(p).cloned());
            cloned.push(Entry {
                id: new_id,
                parent_id: new_parent,
                timestamp: entry.timestamp,
                body: entry.body.clone(),
            });
        }
        new_session.leaf = cloned.last().map(|e| e.id.clone());

        self.sessions.insert(
            new_session.id.clone(),
            SessionRecord {
                session: new_session.clone(),
                entries: cloned,
            },
        );
        Ok(new_session)
    }

    fn rewind(&self, id: &SessionId, leaf: Option<EntryId>) -> Result<Session> {
        let mut record = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| RuntimeError::session_not_found(id.as_str()))?;
        if let Some(leaf_id) = &leaf {
            if !record.entries.iter().any(|e| &e.id == leaf_id) {
                return Err(RuntimeError::args(format!("unknown entry id: {leaf_id}")));
            }
        }
        record.session.leaf = leaf;
        Ok(record.session.clone())
    }

    fn set_title(&self, id: &SessionId, title: String, source: String) -> Result<Session> {
        let mut record = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| RuntimeError::session_not_found(id.as_str()))?;
        record.session.metadata.title = Some(title);
        record.session.metadata.title_source = Some(source);
        Ok(record.session.clone())
    }

    fn set_shared_tabs(&self, id: &SessionId, tab_ids: Vec<String>) -> Result<(Session, bool)> {
        let mut record = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| RuntimeError::session_not_found(id.as_str()))?;
        record.session.metadata.shared_tabs = tab_ids.clone();
        let inferred = record.session.metadata.primary_tab_id.is_none();
        if inferred {
            record.session.metadata.primary_tab_id = tab_ids.into_iter().next();
        }
        Ok((record.session.clone(), inferred))
    }
}

/// Walk leaf→root via `parent_id`, then reverse into root-first order.
/// Guards against a cyclic chain (SPEC_FULL §8 invariant: acyclic,
/// every entry exactly once) by bounding the walk to `entries.len()` steps.
fn walk_branch(entries: &[Entry], leaf: Option<EntryId>) -> Result<Vec<Entry>> {
    let Some(mut cursor) = leaf else {
        return Ok(Vec::new());
    };
    let by_id: std::collections::HashMap<&EntryId, &Entry> =
        entries.iter().map(|e| (&e.id, e)).collect();
    let mut out = Vec::new();
    let mut seen = std::collections::HashSet::new();
    loop {
        if !seen.insert(cursor.clone()) {
            return Err(RuntimeError::internal("cyclic entry chain detected"));
        }
        let entry = by_id
            .get(&cursor)
            .ok_or_else(|| RuntimeError::internal(format!("dangling parent id: {cursor}")))?;
        out.push((*entry).clone());
        match &entry.parent_id {
            Some(p) => cursor = p.clone(),
            None => break,
        }
        if out.len() > entries.len() {
            return Err(RuntimeError::internal("cyclic entry chain detected"));
        }
    }
    out.reverse();
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_is_root_first_and_acyclic() {
        let store = InMemoryStore::new();
        let session = store.create(None);
        store
            .append_entry(
                &session.id,
                EntryBody::Message {
                    role: crate::types::Role::User,
                    text: "hi".into(),
                    tool_name: None,
                    tool_call_id: None,
                },
            )
            .unwrap();
        store
            .append_entry(
                &session.id,
                EntryBody::Message {
                    role: crate::types::Role::Assistant,
                    text: "hello".into(),
                    tool_name: None,
                    tool_call_id: None,
                },
            )
            .unwrap();
        let branch = store.branch(&session.id).unwrap();
        assert_eq!(branch.len(), 2);
        assert!(branch[1].parent_id.as_ref() == Some(&branch[0].id));
    }

    #[test]
    fn fork_copies_branch_with_fresh_ids() {
        let store = InMemoryStore::new();
        let session = store.create(None);
        for i in 0..3 {
            store
                .append_entry(
                    &session.id,
                    EntryBody::Message {
                        role: crate::types::Role::User,
                        text: format!("msg {i}"),
                        tool_name: None,
                        tool_call_id: None,
                    },
                )
                .unwrap();
        }
        let forked = store.fork(&session.id, None).unwrap();
        let original_branch = store.branch(&session.id).unwrap();
        let forked_branch = store.branch(&forked.id).unwrap();
        assert_eq!(original_branch.len(), forked_branch.len());
        for (a, b) in original_branch.iter().zip(forked_branch.iter()) {
            assert_ne!(a.id, b.id);
        }
        assert_eq!(forked.metadata.forked_from, Some(session.id));
    }

    #[test]
    fn delete_unknown_session_errors() {
        let store = InMemoryStore::new();
        assert!(store.delete(&SessionId::new("missing")).is_err());
    }

    #[test]
    fn rewind_drops_later_entries_from_the_branch() {
        let store = InMemoryStore::new();
        let session = store.create(None);
        let first = store
            .append_entry(
                &session.id,
                EntryBody::Message {
                    role: crate::types::Role::User,
                    text: "first".into(),
                    tool_name: None,
                    tool_call_id: None,
                },
            )
            .unwrap();
        store
            .append_entry(
                &session.id,
                EntryBody::Message {
                    role: crate::types::Role::Assistant,
                    text: "second".into(),
                    tool_name: None,
                    tool_call_id: None,
                },
            )
            .unwrap();

        store.rewind(&session.id, Some(first.id.clone())).unwrap();
        let branch = store.branch(&session.id).unwrap();
        assert_eq!(branch.len(), 1);
        assert_eq!(branch[0].id, first.id);

        let appended = store
            .append_entry(
                &session.id,
                EntryBody::Message {
                    role: crate::types::Role::Assistant,
                    text: "regenerated".into(),
                    tool_name: None,
                    tool_call_id: None,
                },
            )
            .unwrap();
        assert_eq!(appended.parent_id, Some(first.id));
    }

    #[test]
    fn rewind_rejects_unknown_entry_id() {
        let store = InMemoryStore::new();
        let session = store.create(None);
        assert!(store
            .rewind(&session.id, Some(EntryId::new("missing")))
            .is_err());
    }

    #[test]
    fn set_title_updates_metadata() {
        let store = InMemoryStore::new();
        let session = store.create(None);
        let updated = store
            .set_title(&session.id, "My Session".into(), "auto".into())
            .unwrap();
        assert_eq!(updated.metadata.title.as_deref(), Some("My Session"));
        assert_eq!(updated.metadata.title_source.as_deref(), Some("auto"));
    }

    #[test]
    fn set_shared_tabs_infers_primary_once() {
        let store = InMemoryStore::new();
        let session = store.create(None);

        let (updated, inferred) = store
            .set_shared_tabs(&session.id, vec!["tab-1".into(), "tab-2".into()])
            .unwrap();
        assert!(inferred);
        assert_eq!(updated.metadata.shared_tabs, vec!["tab-1", "tab-2"]);
        assert_eq!(updated.metadata.primary_tab_id.as_deref(), Some("tab-1"));

        let (updated, inferred) = store.set_shared_tabs(&session.id, vec!["tab-3".into()]).unwrap();
        assert!(!inferred);
        assert_eq!(updated.metadata.primary_tab_id.as_deref(), Some("tab-1"));
        assert_eq!(updated.metadata.shared_tabs, vec!["tab-3"]);
    }
}
