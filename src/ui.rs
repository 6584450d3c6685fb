//! Terminal output for the CLI
//!
//! Results go to stdout. Hints, warnings and failures go to stderr so the
//! output of `whoami` and `sessions` can be piped.

use colored::*;
use crate::auth::Session;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S UTC";

pub fn print_signed_in(session: &Session) {
    println!("  {} Signed in as {}", "✓".green().bold(), session.user_id.green().bold());
}

/// Plain user id on stdout, sign-in time on stderr
pub fn print_current(session: &Session) {
    println!("{}", session.user_id);
    eprintln!("  {} Signed in since {}", "•".green(), session.created_at.format(TIME_FORMAT));
}

pub fn print_sessions(sessions: &[Session], current: &str) {
    if sessions.is_empty() {
        eprintln!("  {} {}", "⚠️ ".yellow().bold(), "No sessions yet, run 'cloudlink signin'".yellow());
        return;
    }

    for session in sessions {
        let row = session_row(session, session.user_id == current);
        if session.user_id == current {
            println!("{}", row.as_str().bold());
        } else {
            println!("{}", row);
        }
    }
}

pub fn print_failure(msg: &str) {
    eprintln!("  {} {}", "❌".red().bold(), msg.red());
}

/// One `sessions` line: current marker, user id, creation time
fn session_row(session: &Session, current: bool) -> String {
    let marker = if current { "*" } else { " " };
    format!("{} {}  {}", marker, session.user_id, session.created_at.format(TIME_FORMAT))
}
