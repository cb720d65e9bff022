use std::{
    collections::BTreeSet,
    io::{Write, stdout},
};

use crossterm::{
    cursor, execute,
    terminal::{Clear, ClearType},
};
use shared::types::{ChatMessage, ChatScope, MemberState, Position, UserId};

use crate::call_mesh::{MeshEvent, SessionSummary};

pub const PROMPT_STR: &str = "> ";

pub struct CliDisplay;

impl CliDisplay {
    pub fn print_connected_message(server_addr: &str, username: &str, room: &str) {
        println!("Connected to {} as '{}' in '{}'!", server_addr, username, room);
        println!("Type 'help' for a list of commands.");
    }

    pub fn print_prompt() {
        let mut stdout = stdout();
        let _ = write!(stdout, "{}", PROMPT_STR);
        let _ = stdout.flush();
    }

    /// Prints a line that arrived while the user may be typing, then restores
    /// the prompt.
    pub fn print_notice(text: &str) {
        let mut stdout = stdout();

        let _ = execute!(stdout, Clear(ClearType::CurrentLine), cursor::MoveToColumn(0));

        let _ = writeln!(stdout, "{}", text);
        let _ = write!(stdout, "{}", PROMPT_STR);
        let _ = stdout.flush();
    }

    pub fn print_help() {
        println!("Commands:");
        println!("  move <x> <y>          walk to a spot");
        println!("  step <dx> <dy>        walk relative to where you are");
        println!("  mic on|off, cam on|off");
        println!("  status <online|away|busy>");
        println!("  say <text>            talk to people near you");
        println!("  shout <text>          talk to the whole room");
        println!("  who, nearby, rooms, sessions, history, exit");
    }

    pub fn print_members<'a>(
        members: impl Iterator<Item = &'a MemberState>,
        local: &UserId,
        local_position: Position,
    ) {
        println!("Users:");

        for member in members {
            let presence = &member.presence;
            let marker = if presence.id == *local { " (you)" } else { "" };
            let distance = presence.position.distance(&local_position);

            println!(
                "  * {}{} [{}] at {} ({:.0} away) mic:{} cam:{}",
                presence.display_name,
                marker,
                presence.status,
                presence.position,
                distance,
                on_off(presence.mic_on),
                on_off(presence.camera_on),
            );
        }
    }

    pub fn print_nearby(nearby: Option<&BTreeSet<UserId>>) {
        match nearby {
            Some(nearby) if !nearby.is_empty() => {
                println!("Nearby:");
                for user in nearby {
                    println!("  * {}", user);
                }
            }
            _ => println!("Nobody is nearby."),
        }
    }

    pub fn print_room_list(room_list: &[String]) {
        println!("Rooms:");

        for room in room_list {
            println!("  * {}", room);
        }
    }

    pub fn print_sessions(sessions: &[SessionSummary]) {
        if sessions.is_empty() {
            println!("No call sessions.");
            return;
        }

        println!("Sessions:");
        for summary in sessions {
            let id = summary
                .session
                .map_or("(pending)".to_string(), |id| id.to_string());
            let participants: Vec<&str> = summary.participants.iter().map(|u| u.as_str()).collect();
            let since = summary
                .since
                .map(|at| format!(" since {}", at.format("%H:%M:%S")))
                .unwrap_or_default();

            println!(
                "  * {} {} with {}{} ({} connected)",
                id,
                summary.state,
                participants.join(", "),
                since,
                summary.connected.len()
            );
        }
    }

    pub fn format_chat(message: &ChatMessage) -> String {
        let scope = match message.scope {
            ChatScope::Office => "office",
            ChatScope::Global => "global",
        };

        format!(
            "[{}] ({}) {}: {}",
            message.timestamp.format("%H:%M"),
            scope,
            message.username,
            message.body
        )
    }

    pub fn print_history<'a>(messages: impl Iterator<Item = &'a ChatMessage>) {
        for message in messages {
            println!("{}", Self::format_chat(message));
        }
    }

    pub fn format_mesh_event(event: &MeshEvent) -> String {
        match event {
            MeshEvent::Forming { participants } => {
                format!("Starting a call with {}", join(participants))
            }
            MeshEvent::Active {
                session,
                participants,
            } => format!("Call {} is live with {}", session, join(participants)),
            MeshEvent::PeerJoined { peer, .. } => format!("{} joined your call", peer),
            MeshEvent::PeerLeft { peer, .. } => format!("{} left your call", peer),
            MeshEvent::SessionDegraded { peer, reason, .. } => {
                format!("Could not connect to {}: {}", peer, reason)
            }
            MeshEvent::FormationFailed { reason } => format!("Could not start a call: {}", reason),
            MeshEvent::TearingDown { .. } => "Hanging up".to_string(),
            MeshEvent::Closed { session } => format!("Call {} ended", session),
        }
    }

    pub fn print_current_user_left_room(room_name: &str) {
        let mut stdout = stdout();

        let _ = execute!(
            stdout,
            cursor::MoveToNextLine(1),
            Clear(ClearType::CurrentLine),
            cursor::MoveToColumn(0)
        );

        let _ = writeln!(stdout, "You have disconnected from '{}'", room_name);
        let _ = stdout.flush();
    }
}

fn on_off(value: bool) -> &'static str {
    if value { "on" } else { "off" }
}

fn join(users: &BTreeSet<UserId>) -> String {
    users
        .iter()
        .map(|user| user.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}
