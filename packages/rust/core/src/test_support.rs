//! Fakes and fixtures shared by the pipeline tests.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use leadscout_remote::{InteractionStatus, Reformatter, RemoteState, ResearchService};
use leadscout_shared::{LeadScoutError, Result};
use leadscout_storage::Storage;
use uuid::Uuid;

/// Fresh temp file path for a test database.
pub(crate) fn temp_db_path() -> PathBuf {
    std::env::temp_dir().join(format!("ls_core_test_{}.db", Uuid::now_v7()))
}

/// Create a temp file storage for testing.
pub(crate) async fn test_storage() -> Storage {
    Storage::open(&temp_db_path()).await.expect("open test db")
}

/// Second raw connection to a test database, for tampering with the schema
/// underneath a [`Storage`]. Keep the database handle alive alongside it.
pub(crate) async fn side_connection(path: &Path) -> (libsql::Database, libsql::Connection) {
    let db = libsql::Builder::new_local(path)
        .build()
        .await
        .expect("open side db");
    let conn = db.connect().expect("connect side db");
    (db, conn)
}

enum Scripted {
    Status(InteractionStatus),
    Error(String),
}

/// Scripted research service. Interactions report `running` until a
/// status is scripted for them.
#[derive(Default)]
pub(crate) struct FakeResearch {
    fail_submit: bool,
    next_id: AtomicUsize,
    statuses: Mutex<HashMap<String, Scripted>>,
    prompts: Mutex<Vec<String>>,
    status_calls: AtomicUsize,
}

impl FakeResearch {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn failing_submit() -> Self {
        Self {
            fail_submit: true,
            ..Self::default()
        }
    }

    pub(crate) fn complete(&self, handle: &str, payload: &str) {
        self.script(
            handle,
            Scripted::Status(InteractionStatus {
                state: RemoteState::Completed,
                payload: Some(payload.to_string()),
                error: None,
            }),
        );
    }

    pub(crate) fn finish(&self, handle: &str, state: RemoteState, error: Option<&str>) {
        self.script(
            handle,
            Scripted::Status(InteractionStatus {
                state,
                payload: None,
                error: error.map(str::to_string),
            }),
        );
    }

    pub(crate) fn break_status(&self, handle: &str, message: &str) {
        self.script(handle, Scripted::Error(message.to_string()));
    }

    pub(crate) fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    pub(crate) fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    fn script(&self, handle: &str, scripted: Scripted) {
        self.statuses
            .lock()
            .unwrap()
            .insert(handle.to_string(), scripted);
    }
}

#[async_trait]
impl ResearchService for FakeResearch {
    async fn submit(&self, prompt: &str, _schema: &serde_json::Value) -> Result<String> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        if self.fail_submit {
            return Err(LeadScoutError::RemoteCall("HTTP 429: quota exceeded".into()));
        }
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("int-{n}"))
    }

    async fn get_status(&self, interaction_id: &str) -> Result<InteractionStatus> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        match self.statuses.lock().unwrap().get(interaction_id) {
            Some(Scripted::Status(status)) => Ok(status.clone()),
            Some(Scripted::Error(message)) => Err(LeadScoutError::RemoteCall(message.clone())),
            None => Ok(InteractionStatus {
                state: RemoteState::Running,
                payload: None,
                error: None,
            }),
        }
    }
}

/// Reformatter returning a fixed answer, or failing when it has none.
pub(crate) struct FakeReformatter {
    answer: Option<String>,
    calls: AtomicUsize,
}

impl FakeReformatter {
    pub(crate) fn answering(answer: &str) -> Self {
        Self {
            answer: Some(answer.to_string()),
            calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn failing() -> Self {
        Self {
            answer: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Reformatter for FakeReformatter {
    async fn reformat(&self, _raw_text: &str, _schema: &serde_json::Value) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.answer
            .clone()
            .ok_or_else(|| LeadScoutError::RemoteCall("model unavailable".into()))
    }
}
