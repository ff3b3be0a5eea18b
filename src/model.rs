use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use rusqlite::{params, Connection, Row};
use thiserror::Error;

/// The fixed set of task categories a task is filed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Analytics,
    Development,
    Design,
    Marketing,
    Meeting,
    Other,
}

/// Raised when the database holds a category slug no variant matches.
#[derive(Debug, Error)]
#[error("unknown category slug: {0}")]
pub struct UnknownCategory(pub String);

impl Category {
    pub const ALL: [Category; 6] = [
        Category::Analytics,
        Category::Development,
        Category::Design,
        Category::Marketing,
        Category::Meeting,
        Category::Other,
    ];

    /// The stable identifier stored in the database and carried in
    /// callback payloads.
    pub fn slug(&self) -> &'static str {
        match self {
            Category::Analytics => "analytics",
            Category::Development => "development",
            Category::Design => "design",
            Category::Marketing => "marketing",
            Category::Meeting => "meeting",
            Category::Other => "other",
        }
    }

    /// The label shown to the user.
    pub fn label(&self) -> &'static str {
        match self {
            Category::Analytics => "📊 Аналитика",
            Category::Development => "💻 Разработка",
            Category::Design => "🎨 Дизайн",
            Category::Marketing => "📈 Маркетинг",
            Category::Meeting => "🤝 Встречи",
            Category::Other => "📌 Прочее",
        }
    }

    /// Parse a category from its slug.
    pub fn parse(s: &str) -> Option<Category> {
        Category::ALL.iter().copied().find(|c| c.slug() == s)
    }
}

/// A single task, saved as an entry in the tasks table.
#[derive(Debug)]
pub struct Task {
    pub id: i64,
    pub owner_id: i64,
    pub local_id: u32,
    pub category: Category,
    pub name: String,
    pub deadline: Option<DateTime<Local>>,
    pub completed: bool,
    pub completed_at: Option<DateTime<Local>>,
    pub created_at: DateTime<Local>,
}

impl Task {
    pub fn fmt_deadline(&self) -> String {
        match self.deadline {
            Some(d) => d.format("%d.%m.%Y %H:%M").to_string(),
            None => "–".to_string(),
        }
    }

    pub fn fmt_completed_at(&self) -> String {
        match self.completed_at {
            Some(d) => d.format("%d.%m.%Y %H:%M").to_string(),
            None => "?".to_string(),
        }
    }
}

/// A chat user, recorded on first contact.
#[derive(Debug, Clone)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub first_name: String,
    pub last_name: String,
}

/// Initialize the task database.
pub fn init_db(db: &Connection) -> Result<()> {
    db.execute(
        "CREATE TABLE if not exists users (
                  user_id         INTEGER PRIMARY KEY,
                  username        TEXT NOT NULL,
                  first_name      TEXT NOT NULL,
                  last_name       TEXT NOT NULL,
                  created_at      TEXT NOT NULL
                  )",
        [],
    )
    .context("Failed to create users table.")?;

    db.execute(
        "CREATE TABLE if not exists tasks (
                  id              INTEGER PRIMARY KEY AUTOINCREMENT,
                  owner_id        INTEGER NOT NULL,
                  local_id        INTEGER NOT NULL,
                  category        TEXT NOT NULL,
                  name            TEXT NOT NULL,
                  deadline        TEXT,
                  completed       INTEGER NOT NULL DEFAULT 0,
                  completed_at    TEXT,
                  created_at      TEXT NOT NULL
                  )",
        [],
    )
    .context("Failed to create tasks table.")?;

    db.execute(
        "CREATE UNIQUE INDEX owner_local_id ON tasks (owner_id, local_id)",
        [],
    )
    .context("Failed to create unique index on tasks table.")?;

    Ok(())
}

/// Record a user on first contact. Name fields are refreshed on every
/// call; created_at is written once and never touched again.
pub fn upsert_user(db: &Connection, user: &User) -> Result<()> {
    db.execute(
        "INSERT INTO users (user_id, username, first_name, last_name, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(user_id) DO UPDATE SET username = ?2, first_name = ?3, last_name = ?4",
        params![user.id, user.username, user.first_name, user.last_name, Local::now()],
    )
    .context("Failed to upsert user into database.")?;
    Ok(())
}

/// Return the number of tasks an owner has, completed ones included.
pub fn task_count(db: &Connection, owner_id: i64) -> Result<u32> {
    let count = db
        .query_row(
            "SELECT count(*) FROM tasks WHERE owner_id = ?1",
            params![owner_id],
            |row| row.get::<_, u32>(0),
        )
        .context("Failed to count tasks from database.")?;
    Ok(count)
}

/// Add a task for an owner. The task takes the next free local id,
/// counting across both active and completed tasks. The count and the
/// insert run in one transaction so two creates for the same owner
/// cannot race to the same local id.
pub fn create_task(
    db: &mut Connection,
    owner_id: i64,
    category: Category,
    name: &str,
    deadline: Option<DateTime<Local>>,
) -> Result<Task> {
    let tx = db
        .transaction()
        .context("Failed to open transaction for task creation.")?;

    let local_id = tx
        .query_row(
            "SELECT count(*) FROM tasks WHERE owner_id = ?1",
            params![owner_id],
            |row| row.get::<_, u32>(0),
        )
        .context("Failed to count tasks from database.")?
        + 1;

    let created_at = Local::now();
    tx.execute(
        "INSERT INTO tasks (owner_id, local_id, category, name, deadline, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![owner_id, local_id, category.slug(), name, deadline, created_at],
    )
    .context("Failed to insert task into database.")?;
    let id = tx.last_insert_rowid();

    tx.commit()
        .context("Failed to commit task creation.")?;

    Ok(Task {
        id,
        owner_id,
        local_id,
        category,
        name: name.to_string(),
        deadline,
        completed: false,
        completed_at: None,
        created_at,
    })
}

/// Return an owner's active tasks, ordered by local id.
pub fn active_tasks(db: &Connection, owner_id: i64) -> Result<Vec<Task>> {
    tasks_with_state(db, owner_id, false)
}

/// Return an owner's completed tasks, ordered by local id.
pub fn completed_tasks(db: &Connection, owner_id: i64) -> Result<Vec<Task>> {
    tasks_with_state(db, owner_id, true)
}

fn tasks_with_state(db: &Connection, owner_id: i64, completed: bool) -> Result<Vec<Task>> {
    let mut stmt = db
        .prepare(
            "SELECT id, owner_id, local_id, category, name, deadline, completed, completed_at, created_at
             FROM tasks WHERE owner_id = ?1 AND completed = ?2 ORDER BY local_id",
        )
        .context("Failed to prepare task query.")?;
    let mapped_rows = stmt
        .query_map(params![owner_id, completed], |row| task_from_row(row))
        .context("Failed to fetch tasks from database.")?;

    let mut tasks = Vec::new();
    for task in mapped_rows {
        tasks.push(task.context("Failed to read task row from database.")?);
    }

    Ok(tasks)
}

/// Mark a task as completed. Returns whether a row matched; a missing
/// task or one owned by someone else is a no-op, not an error.
pub fn complete_task(db: &Connection, id: i64, owner_id: i64) -> Result<bool> {
    let changed = db
        .execute(
            "UPDATE tasks SET completed = 1, completed_at = ?3 WHERE id = ?1 AND owner_id = ?2",
            params![id, owner_id, Local::now()],
        )
        .context("Failed to complete task in database.")?;
    Ok(changed > 0)
}

/// Put a completed task back on the active list, clearing its
/// completion timestamp. Same ownership rules as complete_task.
pub fn restore_task(db: &Connection, id: i64, owner_id: i64) -> Result<bool> {
    let changed = db
        .execute(
            "UPDATE tasks SET completed = 0, completed_at = NULL WHERE id = ?1 AND owner_id = ?2",
            params![id, owner_id],
        )
        .context("Failed to restore task in database.")?;
    Ok(changed > 0)
}

/// Remove a task and renumber the owner's remaining tasks by creation
/// time so local ids stay dense, starting at 1. The delete and the
/// renumbering run in one transaction; a crash cannot leave a gap.
pub fn delete_task(db: &mut Connection, id: i64, owner_id: i64) -> Result<bool> {
    let tx = db
        .transaction()
        .context("Failed to open transaction for task deletion.")?;

    let deleted = tx
        .execute(
            "DELETE FROM tasks WHERE id = ?1 AND owner_id = ?2",
            params![id, owner_id],
        )
        .context("Failed to remove task from database.")?;
    if deleted == 0 {
        return Ok(false);
    }

    let ids: Vec<i64> = {
        let mut stmt = tx
            .prepare("SELECT id FROM tasks WHERE owner_id = ?1 ORDER BY created_at, id")
            .context("Failed to prepare renumbering query.")?;
        let rows = stmt
            .query_map(params![owner_id], |row| row.get(0))
            .context("Failed to fetch remaining tasks for renumbering.")?;
        rows.collect::<rusqlite::Result<Vec<i64>>>()
            .context("Failed to read remaining task ids.")?
    };

    // hack to reassign ranks in two passes without breaking the unique
    // (owner_id, local_id) constraint mid-update.
    for (rank, task_id) in ids.iter().enumerate() {
        tx.execute(
            "UPDATE tasks SET local_id = -(?1) WHERE id = ?2",
            params![rank as i64 + 1, task_id],
        )
        .context("Failed to renumber tasks.")?;
    }
    tx.execute(
        "UPDATE tasks SET local_id = -local_id WHERE owner_id = ?1 AND local_id < 0",
        params![owner_id],
    )
    .context("Failed to renumber tasks.")?;

    tx.commit()
        .context("Failed to commit task deletion.")?;
    Ok(true)
}

/// Return a task from a row in this order: [id, owner_id, local_id,
/// category, name, deadline, completed, completed_at, created_at]
fn task_from_row(row: &Row) -> rusqlite::Result<Task> {
    let slug: String = row.get(3)?;
    let category = Category::parse(&slug).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            Box::new(UnknownCategory(slug)),
        )
    })?;
    let task = Task {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        local_id: row.get::<_, u32>(2)?,
        category,
        name: row.get(4)?,
        deadline: row.get::<_, Option<DateTime<Local>>>(5)?,
        completed: row.get(6)?,
        completed_at: row.get::<_, Option<DateTime<Local>>>(7)?,
        created_at: row.get::<_, DateTime<Local>>(8)?,
    };
    Ok(task)
}
