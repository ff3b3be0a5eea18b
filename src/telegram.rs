use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::dispatch::{Dispatcher, Event, EventKind, Reply};
use crate::model::User;

/// How long getUpdates blocks server-side before returning empty.
const POLL_TIMEOUT_SECS: u64 = 30;

/// A minimal Telegram Bot API client, long polling over HTTP. It only
/// knows the three methods the bot needs; everything else lives in the
/// dispatcher.
pub struct Bot {
    token: String,
    agent: ureq::Agent,
    offset: i64,
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<Message>,
    pub callback_query: Option<CallbackQuery>,
}

#[derive(Debug, Deserialize)]
pub struct Message {
    pub chat: Chat,
    pub from: Option<ApiUser>,
    pub text: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Deserialize)]
pub struct ApiUser {
    pub id: i64,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub id: String,
    pub from: ApiUser,
    pub message: Option<Message>,
    pub data: Option<String>,
}

impl Bot {
    pub fn new(token: String) -> Bot {
        // the read timeout must outlast the long-poll window
        let agent = ureq::AgentBuilder::new()
            .timeout_read(Duration::from_secs(POLL_TIMEOUT_SECS + 15))
            .timeout_write(Duration::from_secs(15))
            .build();
        Bot {
            token,
            agent,
            offset: 0,
        }
    }

    fn call<T: DeserializeOwned>(&self, method: &str, payload: serde_json::Value) -> Result<T> {
        let url = format!("https://api.telegram.org/bot{}/{}", self.token, method);
        let response: ApiResponse<T> = self
            .agent
            .post(&url)
            .send_json(payload)
            .map_err(|e| {
                anyhow!(
                    "Telegram API call {} failed: {}",
                    method,
                    redact(&e.to_string(), &self.token)
                )
            })?
            .into_json()
            .with_context(|| format!("Failed to decode Telegram API response for {}.", method))?;

        if !response.ok {
            return Err(anyhow!(
                "Telegram API call {} rejected: {}",
                method,
                response.description.unwrap_or_else(|| "no description".to_string())
            ));
        }
        response
            .result
            .ok_or_else(|| anyhow!("Telegram API call {} returned no result.", method))
    }

    /// Fetch the next batch of updates, advancing the poll offset past
    /// everything returned.
    pub fn get_updates(&mut self) -> Result<Vec<Update>> {
        let updates: Vec<Update> = self.call(
            "getUpdates",
            json!({
                "offset": self.offset,
                "timeout": POLL_TIMEOUT_SECS,
                "allowed_updates": ["message", "callback_query"],
            }),
        )?;
        for update in &updates {
            if update.update_id >= self.offset {
                self.offset = update.update_id + 1;
            }
        }
        Ok(updates)
    }

    /// Ack a button press so the client stops showing a spinner.
    pub fn answer_callback(&self, callback_id: &str) -> Result<()> {
        let _: serde_json::Value = self.call(
            "answerCallbackQuery",
            json!({ "callback_query_id": callback_id }),
        )?;
        Ok(())
    }

    /// Render a reply into a chat, with its inline keyboard if any.
    pub fn send_reply(&self, chat_id: i64, reply: &Reply) -> Result<()> {
        let mut payload = json!({
            "chat_id": chat_id,
            "text": reply.text,
        });
        if let Some(markup) = reply_markup(reply) {
            payload["reply_markup"] = markup;
        }
        let _: serde_json::Value = self.call("sendMessage", payload)?;
        Ok(())
    }
}

/// The inline_keyboard JSON for a reply, or None for plain text.
fn reply_markup(reply: &Reply) -> Option<serde_json::Value> {
    if reply.keyboard.is_empty() {
        return None;
    }
    let rows: Vec<Vec<serde_json::Value>> = reply
        .keyboard
        .iter()
        .map(|row| {
            row.iter()
                .map(|button| json!({ "text": button.label, "callback_data": button.data }))
                .collect()
        })
        .collect();
    Some(json!({ "inline_keyboard": rows }))
}

/// Convert one Telegram update into a dispatcher event. Updates the
/// bot cannot act on map to None and are dropped.
pub fn event_from_update(update: Update) -> Option<Event> {
    if let Some(message) = update.message {
        let from = message.from?;
        let text = message.text?;
        let kind = if let Some(command) = text.strip_prefix('/') {
            let mut parts = command.splitn(2, char::is_whitespace);
            let name = parts.next().unwrap_or_default();
            // commands may arrive as /name@botname in group chats
            let name = name.split('@').next().unwrap_or_default().to_string();
            let args = parts.next().unwrap_or_default().trim().to_string();
            EventKind::Command { name, args }
        } else {
            EventKind::Text(text)
        };
        return Some(Event {
            user: user_from_api(&from),
            chat_id: message.chat.id,
            kind,
        });
    }

    if let Some(query) = update.callback_query {
        let data = query.data?;
        let chat_id = match &query.message {
            Some(message) => message.chat.id,
            None => query.from.id,
        };
        return Some(Event {
            user: user_from_api(&query.from),
            chat_id,
            kind: EventKind::Callback(data),
        });
    }

    None
}

fn user_from_api(user: &ApiUser) -> User {
    User {
        id: user.id,
        username: user.username.clone().unwrap_or_default(),
        first_name: user.first_name.clone().unwrap_or_default(),
        last_name: user.last_name.clone().unwrap_or_default(),
    }
}

/// Keep the bot token out of logged transport errors.
fn redact(message: &str, token: &str) -> String {
    message.replace(token, "<token>")
}

/// Poll for updates and feed them through the dispatcher until a
/// storage failure ends the process. Transport hiccups are logged and
/// retried; they never take the bot down.
pub fn run(bot: &mut Bot, dispatcher: &Dispatcher) -> Result<()> {
    info!("✅ Task tracker bot started");
    loop {
        let updates = match bot.get_updates() {
            Ok(updates) => updates,
            Err(e) => {
                warn!("polling failed: {:#}", e);
                thread::sleep(Duration::from_secs(5));
                continue;
            }
        };

        for update in updates {
            if let Some(query) = &update.callback_query {
                if let Err(e) = bot.answer_callback(&query.id) {
                    warn!("failed to ack callback: {:#}", e);
                }
            }

            let event = match event_from_update(update) {
                Some(event) => event,
                None => continue,
            };
            let chat_id = event.chat_id;

            // a storage failure is fatal; the environment restarts us
            if let Some(reply) = dispatcher.handle(event)? {
                if let Err(e) = bot.send_reply(chat_id, &reply) {
                    warn!("failed to send reply: {:#}", e);
                }
            }
        }
    }
}
