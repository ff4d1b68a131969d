use chrono::{DateTime, Utc};
use dozlab_operator::builder::{ChildNames, SSH_PORT, TERMINAL_PORT, VSCODE_PORT};
use dozlab_operator::{LabSession, LabSessionSpec};
use serde::Serialize;

use super::OutputFormat;

/// Trait for types that can be displayed in table format
pub trait TableDisplay {
    fn headers() -> Vec<&'static str>;
    fn row(&self) -> Vec<String>;
}

/// One line of `dozlab list`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRow {
    pub session_id: String,
    pub user_id: String,
    pub phase: String,
    pub age: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
}

impl SessionRow {
    pub fn from_session(session: &LabSession, now: DateTime<Utc>) -> Self {
        Self {
            session_id: session.spec.session_id.clone(),
            user_id: session.spec.user_id.clone(),
            phase: session.phase().to_string(),
            age: format_age(session.metadata.creation_timestamp.as_ref().map(|t| t.0), now),
            expires_at: session.status.as_ref().and_then(|s| s.expires_at.clone()),
        }
    }
}

impl TableDisplay for SessionRow {
    fn headers() -> Vec<&'static str> {
        vec!["SESSION", "USER", "PHASE", "AGE"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.session_id.clone(),
            self.user_id.clone(),
            self.phase.clone(),
            self.age.clone(),
        ]
    }
}

/// kubectl-style age: 45s, 12m, 3h, 2d
pub fn format_age(created: Option<DateTime<Utc>>, now: DateTime<Utc>) -> String {
    let Some(created) = created else {
        return "<unknown>".to_string();
    };
    let secs = (now - created).num_seconds().max(0);
    match secs {
        s if s < 60 => format!("{s}s"),
        s if s < 3600 => format!("{}m", s / 60),
        s if s < 86_400 => format!("{}h", s / 3600),
        s => format!("{}d", s / 86_400),
    }
}

/// Print items in the specified format
pub fn print_items<T>(items: &[T], format: OutputFormat)
where
    T: TableDisplay + Serialize,
{
    match format {
        OutputFormat::Table => print!("{}", render_table(items)),
        OutputFormat::Json => print_json(items),
    }
}

pub fn print_json<T: Serialize + ?Sized>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Error serializing to JSON: {}", e),
    }
}

pub fn render_table<T: TableDisplay>(items: &[T]) -> String {
    if items.is_empty() {
        return String::new();
    }

    let headers = T::headers();
    let rows: Vec<Vec<String>> = items.iter().map(|i| i.row()).collect();

    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in &rows {
        for (i, cell) in row.iter().enumerate() {
            if i < widths.len() {
                widths[i] = widths[i].max(cell.len());
            }
        }
    }

    let line = |cells: Vec<String>| -> String {
        let padded: Vec<String> = cells
            .iter()
            .enumerate()
            .map(|(i, cell)| {
                let width = widths.get(i).copied().unwrap_or(0);
                format!("{:width$}", cell, width = width)
            })
            .collect();
        format!("{}\n", padded.join("  ").trim_end())
    };

    let mut out = line(headers.iter().map(|h| h.to_string()).collect());
    for row in rows {
        out.push_str(&line(row));
    }
    out
}

/// Human-readable `dozlab status` output
pub fn render_status(session: &LabSession) -> String {
    let mut out = format!(
        "Session:  {}\nUser:     {}\nPhase:    {}\n",
        session.spec.session_id,
        session.spec.user_id,
        session.phase()
    );
    let Some(status) = &session.status else {
        out.push_str("Status:   not yet reconciled\n");
        return out;
    };
    if !status.message.is_empty() {
        out.push_str(&format!("Message:  {}\n", status.message));
    }
    if let Some(reason) = status.reason {
        out.push_str(&format!("Reason:   {reason:?}\n"));
    }
    if status.retry_count > 0 {
        out.push_str(&format!("Retries:  {}\n", status.retry_count));
    }
    if let Some(expires) = &status.expires_at {
        out.push_str(&format!("Expires:  {expires}\n"));
    }
    if let Some(refs) = &status.child_refs {
        out.push_str(&format!(
            "Children:\n  pod:     {}\n  service: {}\n  secret:  {}\n",
            refs.pod, refs.service, refs.secret
        ));
    }
    out
}

/// Port-forward command, URLs and password for a new session
pub fn access_instructions(namespace: &str, spec: &LabSessionSpec, password: &str) -> String {
    let service = ChildNames::for_session(&spec.session_id).service;
    let mut forwards = Vec::new();
    let mut lines = Vec::new();

    if spec.config.enable_vs_code {
        forwards.push(format!("{VSCODE_PORT}:{VSCODE_PORT}"));
        lines.push(format!("  VS Code:  http://localhost:{VSCODE_PORT}"));
    }
    if spec.config.enable_terminal {
        forwards.push(format!("{TERMINAL_PORT}:{TERMINAL_PORT}"));
        lines.push(format!("  Terminal: http://localhost:{TERMINAL_PORT}"));
    }
    if spec.config.enable_ssh {
        forwards.push(format!("2222:{SSH_PORT}"));
        lines.push("  SSH:      ssh -p 2222 root@localhost".to_string());
    }

    let mut out = format!(
        "Session {} created in namespace {namespace} (timeout {})\n",
        spec.session_id, spec.timeout
    );
    if forwards.is_empty() {
        out.push_str("No access endpoints enabled\n");
        return out;
    }
    out.push_str(&format!(
        "\nForward ports with:\n  kubectl -n {namespace} port-forward svc/{service} {}\n\nThen open:\n",
        forwards.join(" ")
    ));
    for line in lines {
        out.push_str(&line);
        out.push('\n');
    }
    if spec.config.enable_vs_code {
        out.push_str(&format!("\nVS Code password: {password}\n"));
    }
    out
}
