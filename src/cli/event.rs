use crossterm::event::{
  self, Event as CrosstermEvent, KeyCode, KeyEvent, KeyEventKind, KeyModifiers,
};
use querysync::FocusManager;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Terminal events the front end reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
  /// Quit requested (q, Esc or Ctrl-C)
  Quit,
  /// Refetch requested (r)
  Refresh,
}

/// Reads terminal input, forwarding focus changes to a [`FocusManager`] and
/// key presses as [`Event`]s.
///
/// The terminal must be in raw mode with focus reporting enabled for focus
/// events to arrive.
pub struct EventHandler {
  rx: mpsc::UnboundedReceiver<Event>,
  stop: Arc<AtomicBool>,
}

impl EventHandler {
  pub fn new(focus: FocusManager, poll_rate: Duration) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();
    let stop = Arc::new(AtomicBool::new(false));

    // crossterm reads block, so the reader gets its own thread
    let reader_stop = Arc::clone(&stop);
    tokio::task::spawn_blocking(move || {
      while !reader_stop.load(Ordering::Relaxed) {
        if !event::poll(poll_rate).unwrap_or(false) {
          continue;
        }
        let Ok(evt) = event::read() else {
          continue;
        };
        let forwarded = match evt {
          CrosstermEvent::FocusGained => {
            focus.set_focused(true);
            None
          }
          CrosstermEvent::FocusLost => {
            focus.set_focused(false);
            None
          }
          CrosstermEvent::Key(key) => map_key(key),
          _ => None,
        };
        if let Some(event) = forwarded {
          if tx.send(event).is_err() {
            break;
          }
        }
      }
    });

    Self { rx, stop }
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}

impl Drop for EventHandler {
  fn drop(&mut self) {
    self.stop.store(true, Ordering::Relaxed);
  }
}

fn map_key(key: KeyEvent) -> Option<Event> {
  if key.kind != KeyEventKind::Press {
    return None;
  }
  match key.code {
    KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => Some(Event::Quit),
    KeyCode::Char('q') | KeyCode::Esc => Some(Event::Quit),
    KeyCode::Char('r') => Some(Event::Refresh),
    _ => None,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_key_mapping() {
    let ctrl_c = KeyEvent::new(KeyCode::Char('c'), KeyModifiers::CONTROL);
    assert_eq!(map_key(ctrl_c), Some(Event::Quit));
    assert_eq!(
      map_key(KeyEvent::new(KeyCode::Char('c'), KeyModifiers::NONE)),
      None
    );
    assert_eq!(
      map_key(KeyEvent::new(KeyCode::Esc, KeyModifiers::NONE)),
      Some(Event::Quit)
    );
    assert_eq!(
      map_key(KeyEvent::new(KeyCode::Char('r'), KeyModifiers::NONE)),
      Some(Event::Refresh)
    );
  }
}
