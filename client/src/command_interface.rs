use std::{
    io::{self, BufRead},
    str::FromStr,
    thread,
};

use shared::types::{Position, Status};
use strum::IntoEnumIterator;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq)]
pub enum UserCommand {
    MoveTo(Position),
    Step { dx: f64, dy: f64 },
    Mic(bool),
    Camera(bool),
    Status(Status),
    Say(String),
    Shout(String),
    Who,
    Nearby,
    Rooms,
    Sessions,
    History,
    Help,
    Exit,
}

pub struct CommandInterface;

impl CommandInterface {
    /// Reads stdin on a plain thread and forwards each line. The channel closes
    /// on EOF.
    pub fn spawn_reader() -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();

        thread::spawn(move || {
            let stdin = io::stdin();
            let mut reader = stdin.lock();

            loop {
                let mut line = String::new();
                match reader.read_line(&mut line) {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {
                        if tx.send(line).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        rx
    }

    /// Parses one input line. `Ok(None)` is a blank line; `Err` carries the
    /// usage text to show.
    pub fn parse(input: &str) -> Result<Option<UserCommand>, String> {
        let input = input.trim();
        let (command, rest) = match input.split_once(char::is_whitespace) {
            Some((command, rest)) => (command, rest.trim()),
            None => (input, ""),
        };

        let parsed = match command.to_lowercase().as_str() {
            "" => return Ok(None),

            "move" => {
                let (x, y) = parse_pair(rest).ok_or("Usage: move <x> <y>")?;
                UserCommand::MoveTo(Position::new(x, y))
            }

            "step" => {
                let (dx, dy) = parse_pair(rest).ok_or("Usage: step <dx> <dy>")?;
                UserCommand::Step { dx, dy }
            }

            "mic" => UserCommand::Mic(parse_switch(rest).ok_or("Usage: mic on|off")?),

            "cam" => UserCommand::Camera(parse_switch(rest).ok_or("Usage: cam on|off")?),

            "status" => {
                let usage = || {
                    let choices: Vec<String> = Status::iter()
                        .filter(|status| *status != Status::Offline)
                        .map(|status| status.to_string())
                        .collect();
                    format!("Usage: status <{}>", choices.join("|"))
                };

                match Status::from_str(rest) {
                    Ok(Status::Offline) | Err(_) => return Err(usage()),
                    Ok(status) => UserCommand::Status(status),
                }
            }

            "say" if !rest.is_empty() => UserCommand::Say(rest.to_string()),
            "say" => return Err("Usage: say <message>".into()),

            "shout" if !rest.is_empty() => UserCommand::Shout(rest.to_string()),
            "shout" => return Err("Usage: shout <message>".into()),

            "who" => UserCommand::Who,
            "nearby" => UserCommand::Nearby,
            "rooms" => UserCommand::Rooms,
            "sessions" => UserCommand::Sessions,
            "history" => UserCommand::History,
            "help" => UserCommand::Help,
            "exit" | "quit" => UserCommand::Exit,

            _ => return Err("Unknown command (try 'help')".into()),
        };

        Ok(Some(parsed))
    }
}

fn parse_pair(input: &str) -> Option<(f64, f64)> {
    let mut parts = input.split_whitespace();
    let a = parts.next()?.parse().ok()?;
    let b = parts.next()?.parse().ok()?;

    if parts.next().is_some() {
        return None;
    }

    Some((a, b))
}

fn parse_switch(input: &str) -> Option<bool> {
    match input.to_lowercase().as_str() {
        "on" => Some(true),
        "off" => Some(false),
        _ => None,
    }
}
