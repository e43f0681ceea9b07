use finchat_core::{ChatError, CredentialError, Observer, StreamEvent};
use std::io::Write;

/// Prints a streamed reply as it arrives.
pub struct TerminalObserver<W: Write + Send> {
    out: W,
    show_tool_results: bool,
    reply: String,
    failure: Option<ChatError>,
}

impl<W: Write + Send> TerminalObserver<W> {
    pub fn new(out: W, show_tool_results: bool) -> Self {
        Self {
            out,
            show_tool_results,
            reply: String::new(),
            failure: None,
        }
    }

    /// Assistant text received so far.
    pub fn reply(&self) -> &str {
        &self.reply
    }

    pub fn failure(&self) -> Option<&ChatError> {
        self.failure.as_ref()
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write + Send> Observer for TerminalObserver<W> {
    fn next(&mut self, event: StreamEvent) {
        if let Some(delta) = &event.delta {
            self.reply.push_str(delta);
            let _ = write!(self.out, "{delta}");
        }
        if self.show_tool_results {
            for result in event.tool_results.iter().flatten() {
                let _ = write!(self.out, "\n[tool] {result}\n");
            }
        }
        let _ = self.out.flush();
    }

    fn error(&mut self, cause: ChatError) {
        let _ = writeln!(self.out, "\n[error] {}", describe_failure(&cause));
        let _ = self.out.flush();
        self.failure = Some(cause);
    }

    fn complete(&mut self) {
        let _ = writeln!(self.out);
        let _ = self.out.flush();
    }
}

/// One-line explanation for the person at the terminal.
pub fn describe_failure(cause: &ChatError) -> String {
    match cause {
        ChatError::AuthExpired(_) | ChatError::Credential(CredentialError::SignedOut(_)) => {
            "your sign-in has expired; run the command again to sign in".to_string()
        }
        ChatError::Credential(CredentialError::NotSignedIn) => {
            "not signed in; set FINCHAT_EMAIL and FINCHAT_PASSWORD".to_string()
        }
        ChatError::SessionCreation(err) => format!("could not start a conversation: {}", err.cause),
        ChatError::Decode(err) => format!("the reply was cut off ({err}); send the message again"),
        other => other.to_string(),
    }
}
