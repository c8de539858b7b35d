//! Terminal host for tandem: reads commands from stdin and drives the sync
//! engine against a line-oriented editor.
//!
//! Session commands: `host [port] [name]`, `connect <address> [port] [name]`,
//! `disconnect`, `quit`. Local edits start with `:`.
//!
//! Usage: `tandem-host [config.json]`; `RUST_LOG` controls log output.

mod terminal;

use std::path::PathBuf;
use std::sync::Arc;

use log::info;
use tandem_collab::command::{Controller, Flow};
use tandem_collab::config::HostConfig;
use tandem_collab::cursor::Cursor;
use tandem_collab::platform::InProcessPlatform;
use tandem_collab::transport::TcpConnector;
use tandem_collab::view::EditorView;
use tokio::io::{AsyncBufReadExt, BufReader};

use terminal::TerminalView;

const EDIT_HELP: &str =
    ":show | :goto <line> <col> | :insert <line> <text> | :set <line> <text> | :delete <line>";

/// Parse a 1-based line number that must address an existing line, or one
/// past the end when `allow_append` is set.
fn line_index(raw: Option<&str>, len: usize, allow_append: bool) -> Result<usize, String> {
    let number: usize = raw
        .and_then(|r| r.parse().ok())
        .ok_or_else(|| EDIT_HELP.to_string())?;
    let max = if allow_append { len + 1 } else { len };
    if number == 0 || number > max {
        return Err(format!("line {number} is out of range"));
    }
    Ok(number - 1)
}

/// Run a `:` command against the local buffer.
///
/// Line numbers are checked inside the edit, against the buffer as it is
/// while locked; the sync loop may have reshaped it since the user typed.
fn apply_edit(view: &TerminalView, command: &str) -> Result<(), String> {
    let mut parts = command.splitn(3, ' ');
    let verb = parts.next().unwrap_or_default();
    let arg = parts.next();
    let text = parts.next().unwrap_or_default().to_string();

    match verb {
        ":show" => println!("{}", view.render()),
        ":goto" => {
            let line: i64 = arg.and_then(|a| a.parse().ok()).ok_or(EDIT_HELP)?;
            let column: i64 = parse_column(&text)?;
            view.set_cursor(Cursor::new(line, column));
        }
        ":insert" => view.edit(|lines, cursor| -> Result<(), String> {
            let index = line_index(arg, lines.len(), true)?;
            let width = text.chars().count() as i64;
            lines.insert(index, text);
            *cursor = Cursor::new(index as i64 + 1, width + 1);
            Ok(())
        })?,
        ":set" => view.edit(|lines, cursor| -> Result<(), String> {
            let index = line_index(arg, lines.len(), false)?;
            let width = text.chars().count() as i64;
            lines[index] = text;
            *cursor = Cursor::new(index as i64 + 1, width + 1);
            Ok(())
        })?,
        ":delete" => view.edit(|lines, cursor| -> Result<(), String> {
            let index = line_index(arg, lines.len(), false)?;
            lines.remove(index);
            *cursor = Cursor::new((index as i64).max(1), 1);
            Ok(())
        })?,
        _ => return Err(EDIT_HELP.to_string()),
    }
    Ok(())
}

fn parse_column(raw: &str) -> Result<i64, String> {
    raw.trim().parse().map_err(|_| EDIT_HELP.to_string())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = HostConfig::load(config_path.as_deref())?;
    info!("Starting tandem host (default port {:?})", config.default_port);

    let view = Arc::new(TerminalView::new(config.palette_size));
    let platform = InProcessPlatform::default().with_palette_size(config.palette_size);
    let mut controller = Controller::new(view.clone(), TcpConnector, platform, config);

    println!("tandem: host [port] [name] | connect <address> [port] [name] | disconnect | quit");
    println!("edits:  {EDIT_HELP}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.starts_with(':') {
            if let Err(message) = apply_edit(&view, line) {
                eprintln!("error: {message}");
            }
            continue;
        }
        if controller.execute_line(line).await == Flow::Quit {
            break;
        }
    }

    // Stdin closed without `quit`.
    if controller.client().is_connected().await {
        controller.execute_line("quit").await;
    }
    info!("Bye");
    Ok(())
}
