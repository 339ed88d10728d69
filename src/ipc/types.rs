use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

use crate::schedule::SchedulePattern;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Runtime configuration, held on AppState and passed into handlers —
/// never process-global. `lesson_minutes` feeds absence bookkeeping.
pub struct Config {
    pub lesson_minutes: i64,
    pub schedule: SchedulePattern,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            lesson_minutes: 45,
            schedule: SchedulePattern::default(),
        }
    }
}

pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    pub config: Config,
}
