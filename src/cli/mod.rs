//! Command-line front end over the query library.

mod event;
mod http;
mod key;
mod pages;
mod send;
mod watch;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use querysync::{Config, QueryClient};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;

use http::HttpClient;

#[derive(Parser, Debug)]
#[command(name = "querysync")]
#[command(about = "Cached, retried and paginated HTTP JSON queries")]
#[command(version)]
pub struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/querysync/config.yaml)
  #[arg(short, long, global = true)]
  pub config: Option<PathBuf>,

  /// Log to stderr instead of the log file
  #[arg(long, global = true)]
  pub log_stderr: bool,

  /// HTTP request timeout in seconds
  #[arg(long, global = true, default_value_t = 30)]
  pub timeout: u64,

  #[command(subcommand)]
  pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
  /// Poll a JSON endpoint and print every change
  Watch(watch::WatchArgs),
  /// Walk a keyset-paginated JSON endpoint
  Pages(pages::PagesArgs),
  /// POST a JSON body, retrying on failure
  Send(send::SendArgs),
}

pub async fn run(args: Args, config: Config) -> Result<()> {
  let client = QueryClient::from_config(&config)?;
  let http = HttpClient::new(Duration::from_secs(args.timeout))?;

  match args.command {
    Command::Watch(watch_args) => watch::run(&client, http, watch_args).await,
    Command::Pages(pages_args) => pages::run(&client, http, pages_args).await,
    Command::Send(send_args) => send::run(&client, http, send_args).await,
  }
}

/// Compact JSON, cut to at most `max` characters.
fn summarize(value: &Value, max: usize) -> String {
  let text = value.to_string();
  if text.chars().count() <= max {
    return text;
  }
  let mut cut: String = text.chars().take(max.saturating_sub(3)).collect();
  cut.push_str("...");
  cut
}

fn timestamp() -> String {
  chrono::Local::now().format("%H:%M:%S").to_string()
}
