use crate::config::WatchConfig;
use crate::status::StatusPublisher;
use crate::storage::HistoryStore;

/// Read-only handles onto the watcher's state directory.
#[derive(Debug, Clone)]
pub struct AppState {
    pub status: StatusPublisher,
    pub history: HistoryStore,
}

impl AppState {
    pub fn from_config(cfg: &WatchConfig) -> Self {
        Self {
            status: StatusPublisher::new(cfg.paths.status_path()),
            history: HistoryStore::new(cfg.paths.history_path()),
        }
    }
}
