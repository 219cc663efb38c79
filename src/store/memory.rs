use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;

use super::{BatchRows, ContextVectorRow, IngestStore, MetaRow, SourceProgress, StoreError, ViewRow};

#[derive(Debug, Default)]
struct State {
    sources: Vec<(String, SourceProgress)>,
    meta: Vec<(i64, MetaRow)>,
    views: Vec<ViewRow>,
    context_vectors: Vec<ContextVectorRow>,
    advance_calls: u64,
    commits: u64,
    pending_conflicts: u32,
    disconnect_after: Option<u64>,
}

/// In-process [IngestStore] with the same transactional semantics as Postgres.
///
/// Clones share state, so a "restarted" run can reopen the store a crashed run used.
/// Conflicts and lost connections can be injected to exercise retry and resume.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The next `n` commits fail with a retryable conflict and change nothing.
    pub fn inject_conflicts(&self, n: u32) {
        self.state().pending_conflicts = n;
    }

    /// After `commits` more successful commits, the next one fails as if the
    /// connection dropped. Fires once.
    pub fn disconnect_after(&self, commits: u64) {
        let mut state = self.state();
        state.disconnect_after = Some(state.commits + commits);
    }

    pub fn source(&self, name: &str) -> Option<SourceProgress> {
        self.state()
            .sources
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, p)| p.clone())
    }

    pub fn advance_calls(&self) -> u64 {
        self.state().advance_calls
    }

    pub fn meta_rows(&self) -> Vec<MetaRow> {
        self.state().meta.iter().map(|(_, row)| row.clone()).collect()
    }

    pub fn view_rows(&self) -> Vec<ViewRow> {
        self.state().views.clone()
    }

    pub fn context_vector_rows(&self) -> Vec<ContextVectorRow> {
        self.state().context_vectors.clone()
    }
}

#[async_trait]
impl IngestStore for MemoryStore {
    async fn get_or_create_source(&mut self, name: &str) -> Result<SourceProgress, StoreError> {
        let mut state = self.state();
        if let Some((_, progress)) = state.sources.iter().find(|(n, _)| n == name) {
            return Ok(progress.clone());
        }
        let progress = SourceProgress {
            id: state.sources.len() as i64 + 1,
            urls_inserted: 0,
            finished_at: None,
        };
        state.sources.push((name.to_string(), progress.clone()));
        Ok(progress)
    }

    async fn commit_batch(&mut self, source_id: i64, rows: &BatchRows) -> Result<i64, StoreError> {
        let mut state = self.state();
        if state.pending_conflicts > 0 {
            state.pending_conflicts -= 1;
            return Err(StoreError::Conflict);
        }
        if state.disconnect_after == Some(state.commits) {
            state.disconnect_after = None;
            return Err(StoreError::Disconnected);
        }

        state.advance_calls += 1;
        let progress = state
            .sources
            .iter_mut()
            .map(|(_, p)| p)
            .find(|p| p.id == source_id)
            .ok_or(StoreError::MissingSource(source_id))?;
        progress.urls_inserted += rows.attempted as i64;
        let urls_inserted = progress.urls_inserted;

        state
            .meta
            .extend(rows.meta.iter().map(|row| (source_id, row.clone())));
        state.views.extend(rows.views.iter().cloned());
        state
            .context_vectors
            .extend(rows.context_vectors.iter().cloned());
        state.commits += 1;
        Ok(urls_inserted)
    }

    async fn finish_source(&mut self, source_id: i64) -> Result<(), StoreError> {
        let mut state = self.state();
        let progress = state
            .sources
            .iter_mut()
            .map(|(_, p)| p)
            .find(|p| p.id == source_id)
            .ok_or(StoreError::MissingSource(source_id))?;
        progress.finished_at = Some(Utc::now());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_or_create_returns_existing_source() {
        let mut store = MemoryStore::new();
        let first = store.get_or_create_source("a").await.unwrap();
        let again = store.get_or_create_source("a").await.unwrap();
        let other = store.get_or_create_source("b").await.unwrap();
        assert_eq!(first, again);
        assert_ne!(first.id, other.id);
        assert!(!first.is_finished());

        store.finish_source(first.id).await.unwrap();
        assert!(store.get_or_create_source("a").await.unwrap().is_finished());
    }

    #[tokio::test]
    async fn failed_commits_change_nothing() {
        let mut store = MemoryStore::new();
        let source = store.get_or_create_source("a").await.unwrap();
        let rows = BatchRows {
            attempted: 5,
            ..BatchRows::default()
        };

        store.inject_conflicts(1);
        assert!(store.commit_batch(source.id, &rows).await.unwrap_err().is_conflict());
        assert_eq!(store.commit_batch(source.id, &rows).await.unwrap(), 5);

        store.disconnect_after(1);
        assert_eq!(store.commit_batch(source.id, &rows).await.unwrap(), 10);
        assert!(matches!(
            store.commit_batch(source.id, &rows).await,
            Err(StoreError::Disconnected)
        ));
        assert_eq!(store.source("a").unwrap().urls_inserted, 10);
        assert_eq!(store.advance_calls(), 2);
    }
}
