use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::info;

/// A persisted story as served by the API. Immutable once created.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Story {
    pub id: String,
    pub number: i64,
    pub title: String,
    pub content: String,
    pub prompt: String,
    pub model: String,
    pub created_at: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct NewStory {
    pub title: String,
    pub content: String,
    pub prompt: String,
    pub model: String,
}

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS stories (
    id TEXT PRIMARY KEY,
    number INTEGER NOT NULL UNIQUE,
    title TEXT NOT NULL,
    content TEXT NOT NULL,
    prompt TEXT NOT NULL,
    model TEXT NOT NULL,
    created_at DATETIME DEFAULT CURRENT_TIMESTAMP
)";

/// SQLite-backed story persistence. Display numbers are unique and strictly
/// increasing in creation order, also under concurrent creations: the number
/// is computed inside the INSERT itself and every creation goes through the
/// connection lock.
pub struct StoryStore {
    db: Arc<Mutex<Connection>>,
}

impl StoryStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let db = Connection::open(path)?;
        db.execute(SCHEMA, [])?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let db = Connection::open_in_memory()?;
        db.execute(SCHEMA, [])?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }

    pub fn get_db(&self) -> Arc<Mutex<Connection>> {
        self.db.clone()
    }

    /// Persist a finished story and assign its display number. The
    /// `max(number) + 1` subselect runs inside the INSERT, so a stale maximum
    /// cannot be observed by a racing creation.
    pub async fn create(&self, new: NewStory) -> Result<Story> {
        let db = self.db.lock().await;
        let id = uuid::Uuid::new_v4().to_string();
        db.execute(
            "INSERT INTO stories (id, number, title, content, prompt, model)
             VALUES (?1, (SELECT COALESCE(MAX(number), 0) + 1 FROM stories), ?2, ?3, ?4, ?5)",
            params![id, new.title, new.content, new.prompt, new.model],
        )?;
        let story = db.query_row(
            "SELECT id, number, title, content, prompt, model, created_at
             FROM stories WHERE id = ?1",
            params![id],
            row_to_story,
        )?;
        info!("Persisted story #{} ({})", story.number, story.model);
        Ok(story)
    }

    pub async fn get_by_number(&self, number: i64) -> Result<Option<Story>> {
        let db = self.db.lock().await;
        let story = db
            .query_row(
                "SELECT id, number, title, content, prompt, model, created_at
                 FROM stories WHERE number = ?1",
                params![number],
                row_to_story,
            )
            .optional()?;
        Ok(story)
    }
}

fn row_to_story(row: &rusqlite::Row<'_>) -> rusqlite::Result<Story> {
    Ok(Story {
        id: row.get(0)?,
        number: row.get(1)?,
        title: row.get(2)?,
        content: row.get(3)?,
        prompt: row.get(4)?,
        model: row.get(5)?,
        created_at: row.get(6)?,
    })
}
