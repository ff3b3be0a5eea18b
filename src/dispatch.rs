use std::sync::Mutex;

use anyhow::Result;
use chrono::Local;
use rusqlite::Connection;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::deadline;
use crate::model::{self, Category, User};
use crate::session::{Session, SessionMap, Step};

/// An inbound event, as the transport delivers it.
#[derive(Debug)]
pub struct Event {
    pub user: User,
    pub chat_id: i64,
    pub kind: EventKind,
}

#[derive(Debug)]
pub enum EventKind {
    /// A slash command with its argument text.
    Command { name: String, args: String },
    /// A plain text message.
    Text(String),
    /// The raw data string of a pressed inline button.
    Callback(String),
}

/// A button callback, decoded at the router boundary.
#[derive(Debug, PartialEq, Eq)]
pub enum CallbackAction {
    Done(i64),
    Delete(i64),
    Restore(i64),
    PickCategory(Category),
    AddTask,
    ShowTasks,
    ShowCompleted,
}

/// Raised when a callback payload matches no known action shape.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("malformed callback payload: {0}")]
pub struct InvalidCallback(pub String);

/// Decode a raw callback data string into a typed action. Task actions
/// arrive as "{tag}_{task_id}"; category picks as a bare slug.
pub fn decode_callback(data: &str) -> Result<CallbackAction, InvalidCallback> {
    let task_id = |rest: &str| {
        rest.parse::<i64>()
            .map_err(|_| InvalidCallback(data.to_string()))
    };

    if let Some(rest) = data.strip_prefix("done_") {
        return Ok(CallbackAction::Done(task_id(rest)?));
    }
    if let Some(rest) = data.strip_prefix("delete_") {
        return Ok(CallbackAction::Delete(task_id(rest)?));
    }
    if let Some(rest) = data.strip_prefix("restore_") {
        return Ok(CallbackAction::Restore(task_id(rest)?));
    }
    if let Some(category) = Category::parse(data) {
        return Ok(CallbackAction::PickCategory(category));
    }
    match data {
        "add_task" => Ok(CallbackAction::AddTask),
        "show_tasks" => Ok(CallbackAction::ShowTasks),
        "show_completed" => Ok(CallbackAction::ShowCompleted),
        _ => Err(InvalidCallback(data.to_string())),
    }
}

/// An inline button: a label plus the callback data it sends back.
#[derive(Debug, PartialEq)]
pub struct Button {
    pub label: String,
    pub data: String,
}

impl Button {
    fn new(label: impl Into<String>, data: impl Into<String>) -> Button {
        Button {
            label: label.into(),
            data: data.into(),
        }
    }
}

/// Response content handed back to the transport: message text plus an
/// optional inline keyboard, rows of buttons.
#[derive(Debug)]
pub struct Reply {
    pub text: String,
    pub keyboard: Vec<Vec<Button>>,
}

impl Reply {
    pub fn text(text: impl Into<String>) -> Reply {
        Reply {
            text: text.into(),
            keyboard: Vec::new(),
        }
    }

    fn with_keyboard(text: impl Into<String>, keyboard: Vec<Vec<Button>>) -> Reply {
        Reply {
            text: text.into(),
            keyboard,
        }
    }
}

/// Routes inbound events to command handlers, the task-creation flow,
/// or button actions, and renders the response content.
pub struct Dispatcher {
    db: Mutex<Connection>,
    sessions: SessionMap,
}

impl Dispatcher {
    pub fn new(db: Connection) -> Dispatcher {
        Dispatcher {
            db: Mutex::new(db),
            sessions: SessionMap::new(),
        }
    }

    /// Handle one inbound event. Returns the reply to send, or None
    /// when the event is ignored. Holds the user's session lock for
    /// the whole call, so events of one user never interleave.
    pub fn handle(&self, event: Event) -> Result<Option<Reply>> {
        let handle = self.sessions.get(event.user.id);
        let mut session = handle.lock().unwrap();

        match event.kind {
            EventKind::Command { name, .. } => self.handle_command(&event.user, &name, &mut session),
            EventKind::Text(text) => self.handle_text(&event.user, &text, &mut session),
            EventKind::Callback(data) => self.handle_callback(&event.user, &data, &mut session),
        }
    }

    fn handle_command(
        &self,
        user: &User,
        name: &str,
        session: &mut Session,
    ) -> Result<Option<Reply>> {
        match name {
            "start" => {
                {
                    let db = self.db.lock().unwrap();
                    model::upsert_user(&db, user)?;
                }
                let text = format!(
                    "👋 Привет, {}!\n\n\
                     Я бот-задачник. Вот что я умею:\n\
                     📝 /addtask – добавить задачу\n\
                     📋 /mytasks – показать активные задачи\n\
                     ✅ /completed – показать выполненные\n\
                     🆘 /help – помощь",
                    user.first_name
                );
                let keyboard = vec![
                    vec![Button::new("📝 Добавить задачу", "add_task")],
                    vec![Button::new("📋 Мои задачи", "show_tasks")],
                    vec![Button::new("✅ Выполненные", "show_completed")],
                ];
                Ok(Some(Reply::with_keyboard(text, keyboard)))
            }
            "help" => Ok(Some(Reply::text(
                "📋 Доступные команды:\n\
                 /start – начать\n\
                 /addtask – добавить задачу\n\
                 /mytasks – активные задачи\n\
                 /completed – выполненные\n\
                 /cancel – отменить добавление",
            ))),
            "addtask" => Ok(Some(start_flow(session))),
            "mytasks" => self.list_active(user),
            "completed" => self.list_completed(user),
            "cancel" => {
                session.reset();
                Ok(Some(Reply::text("❌ Добавление задачи отменено")))
            }
            _ => {
                debug!(command = %name, "ignoring unknown command");
                Ok(None)
            }
        }
    }

    fn handle_text(&self, user: &User, text: &str, session: &mut Session) -> Result<Option<Reply>> {
        match session.step {
            Step::Idle => {
                debug!(user = user.id, "ignoring free text outside a flow");
                Ok(None)
            }
            Step::AwaitingCategory => {
                // only a button press advances this step
                Ok(Some(category_menu("Выберите категорию кнопкой ниже:")))
            }
            Step::AwaitingName => {
                if text.trim().is_empty() {
                    return Ok(Some(Reply::text("Введите название задачи:")));
                }
                session.draft.name = Some(text.to_string());
                session.step = Step::AwaitingDeadline;
                Ok(Some(Reply::text(
                    "📅 Введите дедлайн (например: «25.12.2024 18:00» или «Завтра»):",
                )))
            }
            Step::AwaitingDeadline => self.commit_draft(user, text, session),
        }
    }

    fn handle_callback(
        &self,
        user: &User,
        data: &str,
        session: &mut Session,
    ) -> Result<Option<Reply>> {
        let action = match decode_callback(data) {
            Ok(action) => action,
            Err(e) => {
                warn!(user = user.id, %e, "ignoring callback");
                return Ok(None);
            }
        };

        match action {
            CallbackAction::AddTask => Ok(Some(start_flow(session))),
            CallbackAction::ShowTasks => self.list_active(user),
            CallbackAction::ShowCompleted => self.list_completed(user),
            CallbackAction::PickCategory(category) => {
                if session.step != Step::AwaitingCategory {
                    debug!(user = user.id, "ignoring category pick outside the flow");
                    return Ok(None);
                }
                session.draft.category = Some(category);
                session.step = Step::AwaitingName;
                Ok(Some(Reply::text(format!(
                    "Категория: {}\nВведите название задачи:",
                    category.label()
                ))))
            }
            CallbackAction::Done(id) => {
                let done = {
                    let db = self.db.lock().unwrap();
                    model::complete_task(&db, id, user.id)?
                };
                if done {
                    info!(user = user.id, task = id, "task completed");
                    Ok(Some(Reply::text("✅ Задача выполнена!")))
                } else {
                    Ok(None)
                }
            }
            CallbackAction::Restore(id) => {
                let restored = {
                    let db = self.db.lock().unwrap();
                    model::restore_task(&db, id, user.id)?
                };
                if restored {
                    info!(user = user.id, task = id, "task restored");
                    Ok(Some(Reply::text("↩️ Задача восстановлена!")))
                } else {
                    Ok(None)
                }
            }
            CallbackAction::Delete(id) => {
                let deleted = {
                    let mut db = self.db.lock().unwrap();
                    model::delete_task(&mut db, id, user.id)?
                };
                if deleted {
                    info!(user = user.id, task = id, "task deleted");
                    Ok(Some(Reply::text("🗑️ Задача удалена!")))
                } else {
                    Ok(None)
                }
            }
        }
    }

    /// Parse the deadline text and, if it is good, persist the draft
    /// and leave the flow. A bad deadline keeps the draft and the step.
    fn commit_draft(&self, user: &User, text: &str, session: &mut Session) -> Result<Option<Reply>> {
        let deadline = match deadline::parse_deadline(text, Local::now()) {
            Ok(deadline) => deadline,
            Err(e) => {
                return Ok(Some(Reply::text(format!("❌ {}\nПопробуйте снова:", e))));
            }
        };

        let (category, name) = match (session.draft.category, session.draft.name.take()) {
            (Some(category), Some(name)) => (category, name),
            _ => {
                // a half-built draft cannot be committed; drop it
                warn!(user = user.id, "discarding incomplete draft");
                session.reset();
                return Ok(None);
            }
        };

        let task = {
            let mut db = self.db.lock().unwrap();
            model::create_task(&mut db, user.id, category, &name, deadline)?
        };
        session.reset();
        info!(user = user.id, local_id = task.local_id, "task created");

        Ok(Some(Reply::text(format!(
            "✅ Задача добавлена!\n\n📁 {}\n📝 {}\n📅 {}\nID: #{}",
            task.category.label(),
            task.name,
            task.fmt_deadline(),
            task.local_id
        ))))
    }

    fn list_active(&self, user: &User) -> Result<Option<Reply>> {
        let tasks = {
            let db = self.db.lock().unwrap();
            model::active_tasks(&db, user.id)?
        };
        if tasks.is_empty() {
            return Ok(Some(Reply::text("📭 Нет задач")));
        }

        let mut text = String::from("📋 Активные задачи:\n\n");
        let mut keyboard = Vec::new();
        for task in &tasks {
            text.push_str(&format!(
                "#{} {} – {}\nДедлайн: {}\n\n",
                task.local_id,
                task.category.label(),
                task.name,
                task.fmt_deadline()
            ));
            keyboard.push(vec![
                Button::new(format!("✅ #{}", task.local_id), format!("done_{}", task.id)),
                Button::new(format!("🗑 #{}", task.local_id), format!("delete_{}", task.id)),
            ]);
        }
        Ok(Some(Reply::with_keyboard(text, keyboard)))
    }

    fn list_completed(&self, user: &User) -> Result<Option<Reply>> {
        let tasks = {
            let db = self.db.lock().unwrap();
            model::completed_tasks(&db, user.id)?
        };
        if tasks.is_empty() {
            return Ok(Some(Reply::text("📭 Нет задач")));
        }

        let mut text = String::from("✅ Выполненные:\n\n");
        let mut keyboard = Vec::new();
        for task in &tasks {
            text.push_str(&format!(
                "#{} {} – {}\n✅ Выполнено: {}\n\n",
                task.local_id,
                task.category.label(),
                task.name,
                task.fmt_completed_at()
            ));
            keyboard.push(vec![
                Button::new(format!("↩️ #{}", task.local_id), format!("restore_{}", task.id)),
                Button::new(format!("🗑 #{}", task.local_id), format!("delete_{}", task.id)),
            ]);
        }
        Ok(Some(Reply::with_keyboard(text, keyboard)))
    }
}

/// Enter (or restart) the task-creation flow.
fn start_flow(session: &mut Session) -> Reply {
    session.reset();
    session.step = Step::AwaitingCategory;
    category_menu("Выберите категорию:")
}

fn category_menu(text: &str) -> Reply {
    let keyboard = Category::ALL
        .iter()
        .map(|category| vec![Button::new(category.label(), category.slug())])
        .collect();
    Reply::with_keyboard(text, keyboard)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::init_db;

    fn dispatcher() -> Dispatcher {
        let db = Connection::open_in_memory().unwrap();
        init_db(&db).unwrap();
        Dispatcher::new(db)
    }

    fn user(id: i64) -> User {
        User {
            id,
            username: format!("user{}", id),
            first_name: "Иван".to_string(),
            last_name: String::new(),
        }
    }

    fn command(d: &Dispatcher, uid: i64, name: &str) -> Option<Reply> {
        d.handle(Event {
            user: user(uid),
            chat_id: uid,
            kind: EventKind::Command {
                name: name.to_string(),
                args: String::new(),
            },
        })
        .unwrap()
    }

    fn text(d: &Dispatcher, uid: i64, text: &str) -> Option<Reply> {
        d.handle(Event {
            user: user(uid),
            chat_id: uid,
            kind: EventKind::Text(text.to_string()),
        })
        .unwrap()
    }

    fn callback(d: &Dispatcher, uid: i64, data: &str) -> Option<Reply> {
        d.handle(Event {
            user: user(uid),
            chat_id: uid,
            kind: EventKind::Callback(data.to_string()),
        })
        .unwrap()
    }

    /// Drive the whole creation flow and return the confirmation.
    fn create_task_via_flow(d: &Dispatcher, uid: i64, slug: &str, name: &str, when: &str) -> Reply {
        command(d, uid, "addtask").unwrap();
        callback(d, uid, slug).unwrap();
        text(d, uid, name).unwrap();
        text(d, uid, when).unwrap()
    }

    #[test]
    fn full_flow_creates_a_task() {
        let d = dispatcher();

        let menu = command(&d, 7, "addtask").unwrap();
        assert_eq!(menu.keyboard.len(), 6);
        assert_eq!(menu.keyboard[0][0].data, "analytics");

        let prompt = callback(&d, 7, "analytics").unwrap();
        assert!(prompt.text.contains("📊 Аналитика"));

        text(&d, 7, "квартальный отчёт").unwrap();
        let confirmation = text(&d, 7, "25.12.2024 18:00").unwrap();
        assert!(confirmation.text.contains("✅ Задача добавлена!"));
        assert!(confirmation.text.contains("ID: #1"));

        let list = command(&d, 7, "mytasks").unwrap();
        assert!(list.text.contains("#1 📊 Аналитика – квартальный отчёт"));
        assert!(list.text.contains("25.12.2024 18:00"));
    }

    #[test]
    fn cancel_discards_the_draft() {
        let d = dispatcher();
        command(&d, 7, "addtask").unwrap();
        callback(&d, 7, "design").unwrap();

        let reply = command(&d, 7, "cancel").unwrap();
        assert!(reply.text.contains("отменено"));

        let list = command(&d, 7, "mytasks").unwrap();
        assert_eq!(list.text, "📭 Нет задач");
        // session is back to Idle: free text is ignored again
        assert!(text(&d, 7, "привет").is_none());
    }

    #[test]
    fn free_text_does_not_advance_the_category_step() {
        let d = dispatcher();
        command(&d, 7, "addtask").unwrap();

        let reprompt = text(&d, 7, "аналитика прописью").unwrap();
        assert_eq!(reprompt.keyboard.len(), 6);

        // the flow is still waiting for a button press
        callback(&d, 7, "meeting").unwrap();
        text(&d, 7, "созвон с командой").unwrap();
        let confirmation = text(&d, 7, "завтра").unwrap();
        assert!(confirmation.text.contains("🤝 Встречи"));
    }

    #[test]
    fn bad_deadline_reprompts_and_keeps_the_draft() {
        let d = dispatcher();
        command(&d, 7, "addtask").unwrap();
        callback(&d, 7, "development").unwrap();
        text(&d, 7, "починить баг").unwrap();

        let reprompt = text(&d, 7, "not a date").unwrap();
        assert!(reprompt.text.contains("Не могу распознать дедлайн"));
        assert!(reprompt.text.contains("not a date"));

        let confirmation = text(&d, 7, "18:00").unwrap();
        assert!(confirmation.text.contains("починить баг"));
    }

    #[test]
    fn unknown_input_is_ignored_silently() {
        let d = dispatcher();
        assert!(callback(&d, 7, "frobnicate_9").is_none());
        assert!(callback(&d, 7, "done_").is_none());
        assert!(command(&d, 7, "weather").is_none());
        assert!(text(&d, 7, "просто сообщение").is_none());
        // a category pick with no flow in progress goes nowhere
        assert!(callback(&d, 7, "analytics").is_none());
    }

    #[test]
    fn done_and_restore_buttons_round_trip() {
        let d = dispatcher();
        create_task_via_flow(&d, 7, "other", "задача", "завтра");

        let list = command(&d, 7, "mytasks").unwrap();
        let done_data = list.keyboard[0][0].data.clone();
        assert!(done_data.starts_with("done_"));

        let reply = callback(&d, 7, &done_data).unwrap();
        assert!(reply.text.contains("выполнена"));
        assert_eq!(command(&d, 7, "mytasks").unwrap().text, "📭 Нет задач");

        let completed = command(&d, 7, "completed").unwrap();
        assert!(completed.text.contains("#1"));
        let restore_data = completed.keyboard[0][0].data.clone();
        assert!(restore_data.starts_with("restore_"));

        callback(&d, 7, &restore_data).unwrap();
        assert!(command(&d, 7, "mytasks").unwrap().text.contains("задача"));
    }

    #[test]
    fn deleting_the_middle_task_renumbers_the_rest() {
        let d = dispatcher();
        for name in &["первая", "вторая", "третья"] {
            create_task_via_flow(&d, 7, "other", name, "завтра");
        }

        let list = command(&d, 7, "mytasks").unwrap();
        let delete_second = list.keyboard[1][1].data.clone();
        assert!(delete_second.starts_with("delete_"));
        callback(&d, 7, &delete_second).unwrap();

        let list = command(&d, 7, "mytasks").unwrap();
        assert!(list.text.contains("#1 📌 Прочее – первая"));
        assert!(list.text.contains("#2 📌 Прочее – третья"));
        assert!(!list.text.contains("вторая"));
    }

    #[test]
    fn foreign_tasks_cannot_be_touched() {
        let d = dispatcher();
        create_task_via_flow(&d, 7, "other", "чужая задача", "завтра");
        let list = command(&d, 7, "mytasks").unwrap();
        let done_data = list.keyboard[0][0].data.clone();

        // another user pressing the same button is a silent no-op
        assert!(callback(&d, 8, &done_data).is_none());
        assert!(command(&d, 7, "mytasks").unwrap().text.contains("чужая задача"));
    }

    #[test]
    fn flows_of_different_users_do_not_mix() {
        let d = dispatcher();
        command(&d, 7, "addtask").unwrap();
        command(&d, 8, "addtask").unwrap();
        callback(&d, 7, "design").unwrap();
        callback(&d, 8, "marketing").unwrap();
        text(&d, 7, "макет лендинга").unwrap();
        text(&d, 8, "запуск кампании").unwrap();
        text(&d, 7, "завтра").unwrap();
        text(&d, 8, "25.12.2024").unwrap();

        assert!(command(&d, 7, "mytasks").unwrap().text.contains("🎨 Дизайн – макет лендинга"));
        assert!(command(&d, 8, "mytasks").unwrap().text.contains("📈 Маркетинг – запуск кампании"));
    }

    #[test]
    fn decode_callback_handles_all_shapes() {
        assert_eq!(decode_callback("done_12"), Ok(CallbackAction::Done(12)));
        assert_eq!(decode_callback("delete_3"), Ok(CallbackAction::Delete(3)));
        assert_eq!(decode_callback("restore_7"), Ok(CallbackAction::Restore(7)));
        assert_eq!(
            decode_callback("analytics"),
            Ok(CallbackAction::PickCategory(Category::Analytics))
        );
        assert_eq!(decode_callback("add_task"), Ok(CallbackAction::AddTask));
        assert_eq!(decode_callback("show_tasks"), Ok(CallbackAction::ShowTasks));
        assert_eq!(
            decode_callback("show_completed"),
            Ok(CallbackAction::ShowCompleted)
        );

        assert!(decode_callback("done_abc").is_err());
        assert!(decode_callback("nonsense").is_err());
        assert!(decode_callback("").is_err());
    }
}
