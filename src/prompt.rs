use std::{
    io::{self, BufRead, Write},
    time::Duration,
};

use async_trait::async_trait;
use tokio::{sync::Mutex, task::JoinHandle};
use url::Url;

use crate::errors::{AuthError, AuthResult};

/// Human-in-the-loop step of the authorization-code flow.
///
/// Implementations show `consent_url` to an operator and return whatever
/// redirect URL they paste back. The call may take minutes.
#[async_trait]
pub trait AuthorizationPrompt: Send + Sync {
    async fn redirect_url(&self, consent_url: &Url) -> AuthResult<String>;
}

/// Prompt on stdin/stdout, bounded by a timeout.
///
/// A blocking stdin read cannot be cancelled. When a prompt times out its
/// read stays pending and the next prompt on the same `ConsolePrompt` takes
/// the line it eventually returns, so a late paste is not lost.
#[derive(Debug)]
pub struct ConsolePrompt {
    timeout: Duration,
    read_line: fn() -> io::Result<String>,
    pending: Mutex<Option<JoinHandle<io::Result<String>>>>,
}

impl ConsolePrompt {
    pub fn new(timeout: Duration) -> Self {
        Self::with_reader(timeout, read_stdin_line)
    }

    fn with_reader(timeout: Duration, read_line: fn() -> io::Result<String>) -> Self {
        Self {
            timeout,
            read_line,
            pending: Mutex::new(None),
        }
    }
}

impl Default for ConsolePrompt {
    fn default() -> Self {
        Self::new(Duration::from_secs(600))
    }
}

#[async_trait]
impl AuthorizationPrompt for ConsolePrompt {
    async fn redirect_url(&self, consent_url: &Url) -> AuthResult<String> {
        tracing::info!(url = %consent_url, "authorize the application in a browser");

        let mut pending = self.pending.lock().await;
        let instructions = consent_instructions(consent_url);
        let read_line = self.read_line;
        // stdin is blocking, keep it off the async workers.
        let mut read = match pending.take() {
            Some(read) => {
                print_instructions(&instructions)?;
                read
            }
            None => tokio::task::spawn_blocking(move || {
                print_instructions(&instructions)?;
                read_line()
            }),
        };

        match tokio::time::timeout(self.timeout, &mut read).await {
            Ok(Ok(Ok(line))) => Ok(line),
            Ok(Ok(Err(err))) => Err(AuthError::Io(err)),
            Ok(Err(join)) => Err(AuthError::Prompt(join.to_string())),
            Err(_) => {
                *pending = Some(read);
                Err(AuthError::PromptTimedOut(self.timeout))
            }
        }
    }
}

fn consent_instructions(consent_url: &Url) -> String {
    format!(
        "Open this url in a browser and authorize the application:\n{consent_url}\n\
         After authorizing, wait for the page to load and paste the WHOLE url here:"
    )
}

fn print_instructions(instructions: &str) -> io::Result<()> {
    let mut stdout = io::stdout().lock();
    writeln!(stdout, "{instructions}")?;
    stdout.flush()
}

fn read_stdin_line() -> io::Result<String> {
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(line)
}

/// Pull the authorization code out of a pasted redirect URL.
///
/// The brokerage ends codes with a percent-encoded `@`; decoding the query
/// value restores it.
pub fn extract_authorization_code(redirect: &str) -> AuthResult<String> {
    let redirect = redirect.trim();
    if redirect.is_empty() {
        return Err(AuthError::InvalidRedirect("nothing was pasted".to_string()));
    }

    let url = Url::parse(redirect)
        .map_err(|err| AuthError::InvalidRedirect(format!("{redirect:?} is not a url: {err}")))?;

    let code = url
        .query_pairs()
        .find(|(key, _)| key == "code")
        .map(|(_, value)| value.into_owned())
        .ok_or_else(|| {
            AuthError::InvalidRedirect("the url has no `code=` query parameter".to_string())
        })?;

    if code.is_empty() {
        return Err(AuthError::InvalidRedirect(
            "the `code=` query parameter is empty".to_string(),
        ));
    }
    Ok(code)
}
