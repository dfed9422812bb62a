use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};

use super::device_code::VerificationPrompt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignInMethod {
    HostSession,
    DeviceCode,
}

/// The user-facing side of sign-in.
#[async_trait]
pub trait Prompter: Send + Sync {
    /// `None` means the user backed out.
    async fn choose_sign_in_method(&self) -> Option<SignInMethod>;

    async fn show_verification(&self, prompt: &VerificationPrompt);

    /// Resolves when the user abandons a sign-in in progress.
    async fn cancelled(&self) {
        std::future::pending::<()>().await
    }
}

/// Prompts on stderr and reads answers from stdin.
///
/// When stdin is not a terminal (or carries tool requests) the choice falls
/// back to the device-code flow, which works without a local browser.
pub struct TerminalPrompter {
    interactive: bool,
}

impl TerminalPrompter {
    pub fn new(interactive: bool) -> Self {
        Self { interactive }
    }
}

#[async_trait]
impl Prompter for TerminalPrompter {
    async fn choose_sign_in_method(&self) -> Option<SignInMethod> {
        if !self.interactive {
            return Some(SignInMethod::DeviceCode);
        }
        eprintln!("Choose authentication method for Azure DevOps:");
        eprintln!("  1) Azure CLI account  (uses your existing `az` sign-in)");
        eprintln!("  2) Device code flow   (authorize in a browser with a short code)");
        eprint!("Selection [1/2, anything else cancels]: ");

        let mut line = String::new();
        let mut stdin = BufReader::new(tokio::io::stdin());
        match stdin.read_line(&mut line).await {
            Ok(0) | Err(_) => None,
            Ok(_) => parse_choice(&line),
        }
    }

    async fn show_verification(&self, prompt: &VerificationPrompt) {
        eprintln!("=== Azure DevOps Device Code Authentication ===\n");
        eprintln!("{}\n", prompt.instructions());
        eprintln!("Keep this window open until authentication is complete.");
        if self.interactive {
            eprintln!("Press Ctrl-C to cancel.");
        }
    }

    // Awaiting ctrl_c replaces the default SIGINT handler for the rest of the
    // process. Non-interactive sessions, `serve` included, never install it.
    async fn cancelled(&self) {
        if !self.interactive || tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await
        }
    }
}

fn parse_choice(line: &str) -> Option<SignInMethod> {
    match line.trim() {
        "1" => Some(SignInMethod::HostSession),
        "2" => Some(SignInMethod::DeviceCode),
        _ => None,
    }
}
