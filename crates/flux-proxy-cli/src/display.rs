//! Status output for the CLI.
//!
//! Everything here goes to stderr so response bodies on stdout stay pipeable.

use colored::Colorize;
use reqwest::StatusCode;

use flux_proxy::ProxySession;

/// Announce a freshly started session.
pub fn session_started(session: &ProxySession) {
    eprintln!(
        "{} {} {}",
        "session".green().bold(),
        session.session_id(),
        format!("(expires {})", session.expires_at().to_rfc3339()).dimmed()
    );
}

pub fn session_ended(session_id: &str) {
    eprintln!("{} {session_id}", "ended".yellow().bold());
}

/// Print the status line of a proxied response, colored by class.
pub fn response_status(status: StatusCode) {
    let line = status.to_string();
    let line = if status.is_success() {
        line.green()
    } else if status.is_redirection() {
        line.cyan()
    } else if status.is_client_error() {
        line.yellow()
    } else {
        line.red()
    };
    eprintln!("{line}");
}

pub fn child_exited(program: &str, code: Option<i32>) {
    match code {
        Some(0) => {}
        Some(code) => eprintln!("{} {program} exited with {code}", "exit".red().bold()),
        None => eprintln!("{} {program} was terminated by a signal", "exit".red().bold()),
    }
}
