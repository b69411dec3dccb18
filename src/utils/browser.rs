//! Browser launching and URL extraction from engine output.

use std::io;
use std::process::{Child, Command, Stdio};
use std::sync::LazyLock;

use regex::Regex;

static URL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"https?://(?:www\.)?[-a-zA-Z0-9@:%._+~#=]{1,256}\.[a-zA-Z0-9()]{1,6}\b[-a-zA-Z0-9()@:%_+.~#?&/=]*",
    )
    .expect("URL pattern is valid")
});

/// Returns the first well-formed http(s) URL contained in `text`.
pub fn extract_url(text: &str) -> Option<&str> {
    URL_PATTERN.find(text).map(|m| m.as_str())
}

/// Opens `url` in the user's default browser.
///
/// On an unsupported platform, or when the launcher command fails, the URL is
/// printed for the user to open manually and an error is returned.
pub fn open_url_in_browser(url: &str) -> io::Result<()> {
    let result = match browser_command(std::env::consts::OS, url) {
        Some(mut command) => command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map(reap_in_background),
        None => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("no browser launcher for {}", std::env::consts::OS),
        )),
    };

    if let Err(e) = &result {
        tracing::debug!(error = %e, "Could not launch browser");
        println!("> Could not open browser automatically. Open the following link manually:");
        println!("> {url}");
    }

    result
}

/// Waits for the launcher on a detached thread so it does not linger as a zombie.
fn reap_in_background(mut child: Child) {
    let waiter = std::thread::Builder::new()
        .name("privado-browser".to_string())
        .spawn(move || {
            if let Err(e) = child.wait() {
                tracing::debug!(error = %e, "Browser launcher did not exit cleanly");
            }
        });
    if let Err(e) = waiter {
        tracing::debug!(error = %e, "Could not wait for browser launcher");
    }
}

fn browser_command(os: &str, url: &str) -> Option<Command> {
    let mut command = match os {
        "linux" | "freebsd" | "openbsd" | "netbsd" => Command::new("xdg-open"),
        "macos" => Command::new("open"),
        "windows" => {
            let mut command = Command::new("rundll32");
            command.arg("url.dll,FileProtocolHandler");
            command
        }
        _ => return None,
    };
    command.arg(url);
    Some(command)
}
