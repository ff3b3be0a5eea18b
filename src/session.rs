use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::model::Category;

/// Where a user currently is in the task-creation flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Idle,
    AwaitingCategory,
    AwaitingName,
    AwaitingDeadline,
}

/// The partially built task accumulated across flow steps.
#[derive(Debug, Default)]
pub struct Draft {
    pub category: Option<Category>,
    pub name: Option<String>,
}

/// Per-user conversation state. Held only in process memory; a restart
/// drops every in-progress flow back to Idle.
#[derive(Debug)]
pub struct Session {
    pub step: Step,
    pub draft: Draft,
}

impl Session {
    fn new() -> Session {
        Session {
            step: Step::Idle,
            draft: Draft::default(),
        }
    }

    /// Drop the draft and return to Idle.
    pub fn reset(&mut self) {
        self.step = Step::Idle;
        self.draft = Draft::default();
    }
}

/// Session storage keyed by user id. Each session sits behind its own
/// lock; the dispatcher holds that lock for the whole event, so events
/// for one user are handled one at a time while different users
/// proceed concurrently.
#[derive(Debug, Default)]
pub struct SessionMap {
    inner: Mutex<HashMap<i64, Arc<Mutex<Session>>>>,
}

impl SessionMap {
    pub fn new() -> SessionMap {
        SessionMap::default()
    }

    /// Fetch the session handle for a user, creating an idle one on
    /// first contact.
    pub fn get(&self, user_id: i64) -> Arc<Mutex<Session>> {
        let mut map = self.inner.lock().unwrap();
        map.entry(user_id)
            .or_insert_with(|| Arc::new(Mutex::new(Session::new())))
            .clone()
    }
}
