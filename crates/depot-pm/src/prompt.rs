//! Credential prompts
//!
//! Invoked by the installer when a repository answers 401.

use crate::repository::Credentials;
use async_trait::async_trait;
use std::io::{self, BufRead, Write};

/// Asks the user for repository credentials
#[async_trait]
pub trait CredentialPrompt: Send + Sync {
    /// Credentials for `url`
    async fn credentials(&self, url: &str) -> io::Result<Credentials>;
}

/// Reads credentials from the terminal
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalPrompt;

#[async_trait]
impl CredentialPrompt for TerminalPrompt {
    async fn credentials(&self, url: &str) -> io::Result<Credentials> {
        let url = url.to_string();
        tokio::task::spawn_blocking(move || {
            let stdin = io::stdin();
            let mut stderr = io::stderr();
            writeln!(stderr, "Authentication required for {}", url)?;

            let username = read_line(&mut stdin.lock(), &mut stderr, "Username: ")?;
            let password = read_line(&mut stdin.lock(), &mut stderr, "Password: ")?;
            Ok(Credentials::new(username, password))
        })
        .await
        .map_err(io::Error::other)?
    }
}

fn read_line(input: &mut impl BufRead, output: &mut impl Write, label: &str) -> io::Result<String> {
    write!(output, "{}", label)?;
    output.flush()?;

    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "no credentials provided",
        ));
    }
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_line() {
        let mut input = io::Cursor::new("alice\r\nsecret\n");
        let mut output = Vec::new();
        assert_eq!(read_line(&mut input, &mut output, "Username: ").unwrap(), "alice");
        assert_eq!(read_line(&mut input, &mut output, "Password: ").unwrap(), "secret");
        assert_eq!(output, b"Username: Password: ");
    }

    #[test]
    fn test_read_line_eof() {
        let mut input = io::Cursor::new("");
        let err = read_line(&mut input, &mut Vec::new(), "Username: ").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
