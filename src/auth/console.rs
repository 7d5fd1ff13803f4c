//! Terminal authenticator for the CLI
//!
//! Stands in for a biometric sensor: the prompt is printed and the user
//! answers y/n. An empty line or end of input cancels.

use crate::auth::{AuthOutcome, Authenticator, ChallengeRequest};
use std::io::{BufRead, Write};
use tokio::sync::oneshot;
use tracing::debug;

/// Prompts on the controlling terminal.
///
/// Each challenge reads stdin on its own thread. A thread whose caller went
/// away stays blocked in `read_line` and consumes the next line typed, so a
/// process should keep at most one challenge open at a time, as the CLI does.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleAuthenticator;

impl ConsoleAuthenticator {
    pub fn new() -> Self {
        ConsoleAuthenticator
    }

    fn ask(request: &ChallengeRequest) -> AuthOutcome {
        let mut stdout = std::io::stdout();
        let shown = writeln!(stdout, "{}", request.prompt.title)
            .and_then(|_| writeln!(stdout, "  {}", request.prompt.subtitle))
            .and_then(|_| {
                write!(
                    stdout,
                    "  Approve {} on '{}'? [y/N, empty = {}] ",
                    request.operation, request.subject, request.prompt.negative_button
                )
            })
            .and_then(|_| stdout.flush());
        if let Err(e) = shown {
            return AuthOutcome::Error(format!("Failed to show prompt: {}", e));
        }

        let mut answer = String::new();
        match std::io::stdin().lock().read_line(&mut answer) {
            Ok(0) => AuthOutcome::Cancelled,
            Ok(_) => Self::interpret(&answer, request),
            Err(e) => AuthOutcome::Error(format!("Failed to read answer: {}", e)),
        }
    }

    fn interpret(answer: &str, request: &ChallengeRequest) -> AuthOutcome {
        match answer.trim().to_ascii_lowercase().as_str() {
            "y" | "yes" => AuthOutcome::approve(request),
            "" => AuthOutcome::Cancelled,
            _ => AuthOutcome::Denied,
        }
    }
}

impl Authenticator for ConsoleAuthenticator {
    fn challenge(&self, request: ChallengeRequest) -> oneshot::Receiver<AuthOutcome> {
        let (tx, rx) = oneshot::channel();

        std::thread::spawn(move || {
            let outcome = Self::ask(&request);
            if tx.send(outcome).is_err() {
                debug!("Caller left before challenge {} resolved, discarding", request.id);
            }
        });

        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{OperationKind, PromptInfo};
    use uuid::Uuid;

    #[test]
    fn test_interpret_answers() {
        let request = ChallengeRequest {
            id: Uuid::new_v4(),
            operation: OperationKind::Decrypt,
            subject: "biometric_key".to_string(),
            prompt: PromptInfo::default(),
        };

        assert_eq!(
            ConsoleAuthenticator::interpret("Y\n", &request),
            AuthOutcome::approve(&request)
        );
        assert_eq!(
            ConsoleAuthenticator::interpret("\n", &request),
            AuthOutcome::Cancelled
        );
        assert_eq!(
            ConsoleAuthenticator::interpret("nope\n", &request),
            AuthOutcome::Denied
        );
    }
}
