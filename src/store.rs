//! Session persistence.
//!
//! One JSON snapshot per session under the store root, replaced atomically
//! (write to a temp file, then rename) so a crash mid-write leaves the
//! previous snapshot intact. The scheduler saves on every state transition;
//! `load` gives back everything needed to rehydrate after a restart.

use crate::errors::EngineError;
use crate::session::MigrationSession;
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct SessionStore {
    root: PathBuf,
}

impl SessionStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, EngineError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|source| EngineError::Store {
            path: root.clone(),
            source,
        })?;
        Ok(Self { root })
    }

    fn session_path(&self, id: Uuid) -> PathBuf {
        self.root.join(format!("{id}.json"))
    }

    /// Persist a full snapshot of the session.
    pub fn save(&self, session: &MigrationSession) -> Result<(), EngineError> {
        let path = self.session_path(session.id);
        let tmp = path.with_extension("json.tmp");

        let json = serde_json::to_vec_pretty(session).map_err(|e| {
            EngineError::Fatal(format!("failed to serialize session {}: {e}", session.id))
        })?;

        fs::write(&tmp, json).map_err(|source| EngineError::Store {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, &path).map_err(|source| EngineError::Store { path, source })?;
        Ok(())
    }

    /// Load a session snapshot.
    pub fn load(&self, id: Uuid) -> Result<MigrationSession, EngineError> {
        let path = self.session_path(id);
        let bytes = fs::read(&path).map_err(|source| match source.kind() {
            std::io::ErrorKind::NotFound => EngineError::SessionNotFound(id),
            _ => EngineError::Store {
                path: path.clone(),
                source,
            },
        })?;
        serde_json::from_slice(&bytes)
            .map_err(|e| EngineError::Fatal(format!("corrupt session snapshot {id}: {e}")))
    }

    /// Ids of every persisted session.
    pub fn list(&self) -> Result<Vec<Uuid>, EngineError> {
        let mut ids = Vec::new();
        let entries = fs::read_dir(&self.root).map_err(|source| EngineError::Store {
            path: self.root.clone(),
            source,
        })?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if let Ok(id) = stem.parse::<Uuid>() {
                    ids.push(id);
                }
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    /// Delete a session snapshot. Missing snapshots are fine.
    pub fn remove(&self, id: Uuid) -> Result<(), EngineError> {
        let path = self.session_path(id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(EngineError::Store { path, source }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::Operation;
    use crate::plan::{PlanBuilder, StepSpec};
    use crate::session::{SessionConfig, SessionStatus, StepStatus};
    use tempfile::tempdir;

    fn sample_session() -> MigrationSession {
        let graph = PlanBuilder::new(vec![
            StepSpec::new("a", Operation::Version),
            StepSpec::new("b", Operation::Monitor).depends_on(&["a"]),
        ])
        .build()
        .unwrap();
        MigrationSession::from_plan(&graph, SessionConfig::default())
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempdir().unwrap();
        let store = SessionStore::open(dir.path()).unwrap();

        let mut session = sample_session();
        session.status = SessionStatus::Running;
        session.step_mut("a").unwrap().status = StepStatus::Succeeded;
        session.completion_order.push("a".into());
        store.save(&session).unwrap();

        let loaded = store.load(session.id).unwrap();
        assert_eq!(loaded.id, session.id);
        assert_eq!(loaded.status, SessionStatus::Running);
        assert_eq!(loaded.step("a").unwrap().status, StepStatus::Succeeded);
        assert_eq!(loaded.completion_order, vec!["a".to_string()]);
    }

    #[test]
    fn test_load_missing_is_session_not_found() {
        let dir = tempdir().unwrap();
        let store = SessionStore::open(dir.path()).unwrap();
        let err = store.load(Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, EngineError::SessionNotFound(_)));
    }

    #[test]
    fn test_save_replaces_previous_snapshot() {
        let dir = tempdir().unwrap();
        let store = SessionStore::open(dir.path()).unwrap();

        let mut session = sample_session();
        store.save(&session).unwrap();

        session.status = SessionStatus::Completed;
        store.save(&session).unwrap();

        let loaded = store.load(session.id).unwrap();
        assert_eq!(loaded.status, SessionStatus::Completed);
        // No stray temp file left behind.
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .filter(|e| e.path().extension().and_then(|x| x.to_str()) == Some("tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_list_and_remove() {
        let dir = tempdir().unwrap();
        let store = SessionStore::open(dir.path()).unwrap();

        let first = sample_session();
        let second = sample_session();
        store.save(&first).unwrap();
        store.save(&second).unwrap();

        let ids = store.list().unwrap();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&first.id));

        store.remove(first.id).unwrap();
        assert_eq!(store.list().unwrap().len(), 1);

        // Removing twice is not an error.
        store.remove(first.id).unwrap();
    }

    #[test]
    fn test_recovery_after_restart() {
        let dir = tempdir().unwrap();
        let id;
        {
            let store = SessionStore::open(dir.path()).unwrap();
            let mut session = sample_session();
            session.status = SessionStatus::Paused;
            id = session.id;
            store.save(&session).unwrap();
        }
        {
            let store = SessionStore::open(dir.path()).unwrap();
            let loaded = store.load(id).unwrap();
            assert_eq!(loaded.status, SessionStatus::Paused);
            assert!(loaded.rebuild_graph().is_ok());
        }
    }
}
