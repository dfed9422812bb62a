use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::auth::{AcquireMode, CredentialManager};
use crate::config;
use crate::providers::WorkTracker;
use crate::tools::{ToolName, Tools};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadonlyChange {
    Show,
    On,
    Off,
    Toggle,
}

impl ReadonlyChange {
    /// The flag value after applying this change to `current`.
    pub fn apply(self, current: bool) -> bool {
        match self {
            ReadonlyChange::Show => current,
            ReadonlyChange::On => true,
            ReadonlyChange::Off => false,
            ReadonlyChange::Toggle => !current,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Help,
    Tool { tool: ToolName, input: Value },
    Serve,
    SetOrg(String),
    SignIn(AcquireMode),
    SignOut,
    Status,
    TestConnection,
    Readonly(ReadonlyChange),
}

/// Parse `ado-work` arguments (program name excluded).
///
/// Supported forms:
///   ado-work tool query-items '{"wiqlQuery": "...", "scope": "organization"}'
///   ado-work tool list-projects
///   ado-work set-org https://dev.azure.com/contoso
///   ado-work readonly toggle
pub fn parse_args(args: &[String]) -> Result<Command> {
    let Some((first, rest)) = args.split_first() else {
        return Ok(Command::Help);
    };
    let command = match first.as_str() {
        "help" | "-h" | "--help" => Command::Help,
        "tool" => {
            let Some((name, json_parts)) = rest.split_first() else {
                bail!("Usage: ado-work tool <name> [json]\n\nTools: {}", tool_names());
            };
            let tool = name
                .parse::<ToolName>()
                .map_err(|e| anyhow::anyhow!("{e}. Available tools: {}", tool_names()))?;
            // Unquoted JSON arrives split on whitespace.
            let json = json_parts.join(" ");
            let input = if json.trim().is_empty() {
                Value::Object(Default::default())
            } else {
                serde_json::from_str(&json).context("Tool input must be a JSON object")?
            };
            return Ok(Command::Tool { tool, input });
        }
        "serve" => Command::Serve,
        "set-org" => {
            let url = rest.join(" ");
            Command::SetOrg(validate_organization_url(&url)?)
        }
        "sign-in" => Command::SignIn(AcquireMode::Auto),
        "sign-in-device" => Command::SignIn(AcquireMode::DeviceCode),
        "sign-in-host" => Command::SignIn(AcquireMode::HostInteractive),
        "sign-out" => Command::SignOut,
        "status" => Command::Status,
        "test-connection" => Command::TestConnection,
        "readonly" => {
            let change = match rest.first().map(String::as_str) {
                None => ReadonlyChange::Show,
                Some("on") => ReadonlyChange::On,
                Some("off") => ReadonlyChange::Off,
                Some("toggle") => ReadonlyChange::Toggle,
                Some(other) => bail!("Unknown readonly setting '{other}'. Use on, off or toggle"),
            };
            return Ok(Command::Readonly(change));
        }
        other => bail!("Unknown command '{other}'. Run `ado-work help` for usage"),
    };
    if !rest.is_empty() && !matches!(command, Command::SetOrg(_)) {
        bail!("Unexpected arguments after '{first}': {}", rest.join(" "));
    }
    Ok(command)
}

fn tool_names() -> String {
    ToolName::ALL
        .iter()
        .map(|tool| tool.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn validate_organization_url(url: &str) -> Result<String> {
    let url = url.trim();
    if url.is_empty() {
        bail!("Organization URL is required");
    }
    if !url.contains("dev.azure.com") && !url.contains("visualstudio.com") {
        bail!("Please enter a valid Azure DevOps URL, e.g. https://dev.azure.com/yourorganization or https://yourorganization.visualstudio.com");
    }
    Ok(url.to_string())
}

/// The services a command runs against.
pub struct Session {
    pub config_path: PathBuf,
    pub credentials: Arc<CredentialManager>,
    pub tracker: Arc<dyn WorkTracker>,
    pub tools: Tools,
}

pub async fn run(command: Command, session: &Session) -> Result<()> {
    match command {
        Command::Help => print_help(),
        Command::Tool { tool, input } => println!("{}", session.tools.invoke(tool, input).await),
        Command::Serve => {
            let stdin = BufReader::new(tokio::io::stdin());
            serve(&session.tools, stdin, tokio::io::stdout()).await?;
        }
        Command::SetOrg(url) => {
            session.tracker.set_organization(&url);
            let mut stored = config::load_config_from(&session.config_path)?;
            stored.organization_url = Some(url.clone());
            config::save_config_to(&stored, &session.config_path)?;
            println!("Azure DevOps organization set to: {url}");
        }
        Command::SignIn(mode) => {
            session
                .credentials
                .get_token(mode)
                .await
                .context("Sign in failed")?;
            println!("Successfully signed in to Azure DevOps.");
        }
        Command::SignOut => {
            session.credentials.sign_out().await;
            println!("Signed out of Azure DevOps.");
        }
        Command::Status => {
            let authenticated = session.credentials.is_authenticated().await;
            let organization = session.tracker.organization();
            let connection = match (&organization, authenticated) {
                (Some(_), true) => Some(session.tracker.test_connection().await),
                _ => None,
            };
            let report = StatusReport {
                authenticated,
                organization,
                connection,
                readonly: session.tracker.is_readonly(),
            };
            println!("{}", report.render());
        }
        Command::TestConnection => {
            if session.tracker.organization().is_none() {
                bail!("Please set your Azure DevOps organization first with `ado-work set-org <url>`");
            }
            if !session.tracker.test_connection().await {
                bail!("Failed to connect to Azure DevOps. Please check your authentication and organization settings.");
            }
            println!("Successfully connected to Azure DevOps!");
        }
        Command::Readonly(change) => {
            let current = session.tracker.is_readonly();
            let readonly = change.apply(current);
            if change == ReadonlyChange::Show {
                println!("Readonly mode is {}.", if readonly { "on" } else { "off" });
                return Ok(());
            }
            session.tracker.set_readonly(readonly);
            let mut stored = config::load_config_from(&session.config_path)?;
            stored.readonly = readonly;
            config::save_config_to(&stored, &session.config_path)?;
            println!("{}", readonly_message(readonly));
        }
    }
    Ok(())
}

pub fn readonly_message(readonly: bool) -> &'static str {
    if readonly {
        "Readonly mode enabled. Write operations are now blocked."
    } else {
        "Readonly mode disabled. Write operations are now allowed."
    }
}

pub struct StatusReport {
    pub authenticated: bool,
    pub organization: Option<String>,
    /// `None` when the connection was not tested.
    pub connection: Option<bool>,
    pub readonly: bool,
}

impl StatusReport {
    pub fn render(&self) -> String {
        let auth = if self.authenticated {
            "Signed in"
        } else {
            "Not signed in"
        };
        let connection = match self.connection {
            Some(true) => "Connected",
            Some(false) => "Connection failed",
            None => "Not tested",
        };
        let readonly = if self.readonly { "Enabled" } else { "Disabled" };
        let mut out = format!(
            "Azure DevOps status\n  Authentication: {auth}\n  Organization:   {}\n  Connection:     {connection}\n  Readonly mode:  {readonly}",
            self.organization.as_deref().unwrap_or("Not set"),
        );
        if !self.authenticated {
            out.push_str("\n\nRun `ado-work sign-in` to authenticate.");
        } else if self.organization.is_none() {
            out.push_str("\n\nRun `ado-work set-org <url>` to choose an organization.");
        }
        out
    }
}

#[derive(Debug, Deserialize)]
struct ToolRequest {
    tool: String,
    #[serde(default)]
    input: Value,
}

#[derive(Debug, Serialize)]
struct ToolResponse<'a> {
    tool: &'a str,
    output: String,
}

/// Answer one JSON request per line until the reader is exhausted. Each
/// request gets exactly one response line, even when it can't be parsed.
pub async fn serve<R, W>(tools: &Tools, reader: R, mut writer: W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await.context("Failed to read request")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (tool, output) = match serde_json::from_str::<ToolRequest>(line) {
            Ok(request) => match request.tool.parse::<ToolName>() {
                Ok(name) => {
                    let output = tools.invoke(name, request.input).await;
                    (request.tool, output)
                }
                Err(e) => (request.tool, format!("Failed to run tool: {e}")),
            },
            Err(e) => (String::new(), format!("Failed to parse request: {e}")),
        };

        let mut response = serde_json::to_string(&ToolResponse {
            tool: &tool,
            output,
        })?;
        response.push('\n');
        writer
            .write_all(response.as_bytes())
            .await
            .context("Failed to write response")?;
        writer.flush().await?;
    }
    Ok(())
}

pub fn print_help() {
    println!("ado-work: Azure DevOps work items from the command line\n");
    println!("USAGE:");
    println!("  ado-work tool <name> [json]     Run one tool and print its result");
    println!("  ado-work serve                  Answer JSON-lines tool requests on stdin");
    println!("  ado-work set-org <url>          Set the Azure DevOps organization URL");
    println!("  ado-work sign-in                Sign in (Azure CLI session, else choose a method)");
    println!("  ado-work sign-in-device         Sign in with the device code flow");
    println!("  ado-work sign-in-host           Sign in through the Azure CLI");
    println!("  ado-work sign-out               Forget the stored token");
    println!("  ado-work status                 Show authentication and connection status");
    println!("  ado-work test-connection        Check that the organization is reachable");
    println!("  ado-work readonly [on|off|toggle]  Show or change readonly mode");
    println!();
    println!("TOOLS:");
    for tool in ToolName::ALL {
        println!("  {:<16} {}", tool.as_str(), tool.usage());
    }
    println!();
    println!("EXAMPLES:");
    println!("  ado-work set-org https://dev.azure.com/contoso");
    println!("  ado-work tool query-items '{{\"wiqlQuery\": \"SELECT [System.Id] FROM WorkItems\", \"scope\": \"organization\"}}'");
    println!("  echo '{{\"tool\": \"list-projects\"}}' | ado-work serve");
}
