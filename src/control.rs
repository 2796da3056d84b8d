//! Keyboard Control
//!
//! Reads key presses from the raw-mode terminal on a dedicated OS thread and
//! turns them into [`Control`] commands for the bridge:
//!
//! | Key               | Command |
//! |-------------------|---------|
//! | Space             | Ping    |
//! | `q`, Esc, Ctrl+C  | Quit    |

use std::io::{self, Write};
use std::thread;
use std::time::Duration;

use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::bridge::Control;

/// How often the reader thread checks whether the bridge is still listening
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Terminal could not be prepared for key input
#[derive(Debug)]
pub enum ControlError {
    Terminal(io::Error),
}

impl std::fmt::Display for ControlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlError::Terminal(e) => write!(f, "Terminal error: {}", e),
        }
    }
}

impl std::error::Error for ControlError {}

impl From<io::Error> for ControlError {
    fn from(e: io::Error) -> Self {
        ControlError::Terminal(e)
    }
}

/// Map a key event to a command
pub fn map_key(key: &KeyEvent) -> Option<Control> {
    if key.kind != KeyEventKind::Press {
        return None;
    }

    match key.code {
        KeyCode::Char('c') | KeyCode::Char('C') if key.modifiers.contains(KeyModifiers::CONTROL) => {
            Some(Control::Quit)
        }
        KeyCode::Char(' ') => Some(Control::Ping),
        KeyCode::Char('q') | KeyCode::Char('Q') | KeyCode::Esc => Some(Control::Quit),
        _ => None,
    }
}

/// Raw terminal mode, restored on drop
#[derive(Debug)]
pub struct RawModeGuard {
    _private: (),
}

impl RawModeGuard {
    pub fn acquire() -> Result<Self, ControlError> {
        enable_raw_mode()?;
        Ok(Self { _private: () })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
    }
}

/// Start the key reader thread
///
/// The thread ends after sending [`Control::Quit`], when the receiver is
/// dropped, or when the terminal fails.
pub fn spawn_keyboard(tx: mpsc::Sender<Control>) -> io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("keyboard".to_string())
        .spawn(move || keyboard_loop(tx))
}

fn keyboard_loop(tx: mpsc::Sender<Control>) {
    while !tx.is_closed() {
        match event::poll(POLL_INTERVAL) {
            Ok(true) => {}
            Ok(false) => continue,
            Err(e) => {
                error!("Keyboard: poll failed: {}", e);
                return;
            }
        }

        let key = match event::read() {
            Ok(Event::Key(key)) => key,
            Ok(_) => continue,
            Err(e) => {
                error!("Keyboard: read failed: {}", e);
                return;
            }
        };

        let Some(control) = map_key(&key) else {
            continue;
        };

        debug!("Keyboard: {:?}", control);
        if tx.blocking_send(control).is_err() || control == Control::Quit {
            return;
        }
    }
}

/// Writer that turns `\n` into `\r\n`
///
/// In raw mode the terminal no longer returns the cursor to column 0 on a
/// line feed.
#[derive(Debug)]
pub struct CrlfWriter<W> {
    inner: W,
}

impl<W: Write> CrlfWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for CrlfWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut start = 0;
        for (i, byte) in buf.iter().enumerate() {
            if *byte == b'\n' && (i == 0 || buf[i - 1] != b'\r') {
                self.inner.write_all(&buf[start..i])?;
                self.inner.write_all(b"\r\n")?;
                start = i + 1;
            }
        }
        self.inner.write_all(&buf[start..])?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// stderr with CRLF line endings, usable as a tracing writer
pub fn crlf_stderr() -> CrlfWriter<io::Stderr> {
    CrlfWriter::new(io::stderr())
}
