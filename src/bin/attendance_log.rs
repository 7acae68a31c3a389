//! attendance_log - print recent attendance records as JSON

use anyhow::{anyhow, Result};
use clap::Parser;
use serde_json::json;

use attendance_kernel::{AttendanceRecorder, SqliteAttendanceStore};

#[derive(Parser, Debug)]
#[command(
    name = "attendance_log",
    about = "Print the most recent attendance records from an attendance database"
)]
struct Args {
    /// Path to the attendance SQLite DB
    #[arg(long, env = "ATTENDANCE_DB_PATH", default_value = "attendance.db")]
    db: String,

    /// Number of records to print, newest first
    #[arg(long, default_value_t = 10)]
    limit: usize,

    /// Compact single-line JSON
    #[arg(long)]
    compact: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();
    if args.limit == 0 {
        return Err(anyhow!("--limit must be greater than zero"));
    }

    let mut store = SqliteAttendanceStore::open(&args.db)?;
    let records = store.recent(args.limit)?;
    let body = json!({ "attendance": records });
    let out = if args.compact {
        serde_json::to_string(&body)?
    } else {
        serde_json::to_string_pretty(&body)?
    };
    println!("{}", out);
    Ok(())
}
