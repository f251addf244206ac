use clap::Args as ClapArgs;
use color_eyre::Result;
use crossterm::event::{DisableFocusChange, EnableFocusChange};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use crossterm::tty::IsTty;
use crossterm::ExecutableCommand;
use querysync::{CancelToken, QueryClient, QueryState};
use serde_json::Value;
use std::io::{stdout, Write};
use std::time::Duration;
use tracing::{info, warn};

use super::event::{Event, EventHandler};
use super::http::HttpClient;
use super::key::RequestKey;
use super::{summarize, timestamp};

#[derive(ClapArgs, Debug)]
pub struct WatchArgs {
  /// URL of a JSON document
  pub url: String,

  /// Refetch every SECS seconds (default: refetch_interval_ms from config)
  #[arg(short, long, value_name = "SECS")]
  pub interval: Option<u64>,

  /// Characters of each response to print
  #[arg(long, default_value_t = 120)]
  pub width: usize,
}

pub async fn run(client: &QueryClient, http: HttpClient, args: WatchArgs) -> Result<()> {
  let key = RequestKey::get(&args.url)?;
  let url = key.url().clone();

  let interval = args
    .interval
    .map(Duration::from_secs)
    .or(client.config().query.refetch_interval);
  let options = client
    .query_options::<Value>()
    .with_refetch_interval(interval)
    .on_error(|err| warn!("fetch failed: {err}"));

  let query = client.query(
    key.cache_hash(),
    move |cancel: CancelToken| {
      let http = http.clone();
      let url = url.clone();
      async move { http.get_json(&url, &cancel).await }
    },
    options,
  )?;
  info!(request = %key.description(), ?interval, "watching");

  let terminal = RawTerminal::enter()?;
  // Without a terminal there are no key or focus events to read
  let mut events = terminal
    .active
    .then(|| EventHandler::new(client.focus().clone(), Duration::from_millis(250)));
  let mut updates = query.subscribe();
  query.start();

  loop {
    tokio::select! {
      changed = updates.changed() => {
        if changed.is_err() {
          break;
        }
        let state = updates.borrow_and_update().clone();
        print_line(&describe(&state, args.width))?;
      }
      event = next_event(&mut events) => match event {
        Some(Event::Refresh) => {
          let query = query.clone();
          tokio::spawn(async move { query.refetch().await });
        }
        Some(Event::Quit) | None => break,
      },
      _ = tokio::signal::ctrl_c() => break,
    }
  }

  query.stop();
  Ok(())
}

async fn next_event(events: &mut Option<EventHandler>) -> Option<Event> {
  match events {
    Some(events) => events.next().await,
    None => std::future::pending().await,
  }
}

fn describe(state: &QueryState<Value>, width: usize) -> String {
  let status = if state.loading {
    "loading".to_string()
  } else if state.is_fetching {
    "refreshing".to_string()
  } else if let Some(err) = &state.error {
    format!("error: {err}")
  } else {
    match &state.data {
      Some(data) => summarize(data, width),
      None => "no data".to_string(),
    }
  };

  if state.retry_count > 0 && state.is_fetching {
    format!("[{}] {} (retry {})", timestamp(), status, state.retry_count)
  } else {
    format!("[{}] {}", timestamp(), status)
  }
}

/// Raw mode emits no newline translation, so lines end in CRLF.
fn print_line(line: &str) -> Result<()> {
  let mut out = stdout().lock();
  write!(out, "{line}\r\n")?;
  out.flush()?;
  Ok(())
}

/// Raw mode with focus reporting while attached to a terminal; restored on drop.
struct RawTerminal {
  active: bool,
}

impl RawTerminal {
  fn enter() -> Result<Self> {
    if !stdout().is_tty() {
      return Ok(Self { active: false });
    }
    enable_raw_mode()?;
    stdout().execute(EnableFocusChange)?;
    Ok(Self { active: true })
  }
}

impl Drop for RawTerminal {
  fn drop(&mut self) {
    if self.active {
      let _ = stdout().execute(DisableFocusChange);
      let _ = disable_raw_mode();
    }
  }
}
