use structopt::StructOpt;
use anyhow::anyhow;
use std::path::PathBuf;
use directories::ProjectDirs;
use tracing_subscriber::EnvFilter;

mod cli;
mod deadline;
mod dispatch;
mod model;
mod session;
mod telegram;

use rusqlite::Connection;
use crate::model::init_db;

use cli::CommandLineArgs;
use dispatch::Dispatcher;
use telegram::Bot;

fn find_default_db_file() -> Option<PathBuf> {
    if let Some(base_dirs) = ProjectDirs::from("com", "zadachi", "zadachi") {
        let root_dir = base_dirs.data_dir();
        if !root_dir.exists() {
            std::fs::create_dir_all(root_dir).expect("Failed to create directory.");
        }
        let mut path = PathBuf::from(root_dir);
        path.push("tasks.db");
        Some(path)
    } else {
        None
    }
}

/// Get a connection to the task database, creating it if it does not
/// exist.
pub fn get_task_db(db_path: PathBuf) -> anyhow::Result<Connection> {
    let db_exists = db_path.exists();
    let db = Connection::open(&db_path)?;
    if !db_exists {
        init_db(&db)?;
    }
    Ok(db)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Get the command-line arguments.
    let CommandLineArgs { db_file } = CommandLineArgs::from_args();

    let token = std::env::var("BOT_TOKEN")
        .map_err(|_| anyhow!("❌ Установите BOT_TOKEN в окружении."))?;

    // Unpack the database file.
    let db_file = db_file
        .or_else(find_default_db_file)
        .ok_or(anyhow!("Failed to find database file."))?;

    let database = get_task_db(db_file)?;

    let dispatcher = Dispatcher::new(database);
    let mut bot = Bot::new(token);
    telegram::run(&mut bot, &dispatcher)
}
