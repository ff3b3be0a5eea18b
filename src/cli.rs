use std::path::PathBuf;
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "Zadachi",
    about = "A minimalistic task-tracking Telegram bot."
)]
pub struct CommandLineArgs {
    /// Use a different database file.
    #[structopt(parse(from_os_str), short, long)]
    pub db_file: Option<PathBuf>,
}
