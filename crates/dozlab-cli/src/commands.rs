use anyhow::Result;
use chrono::Utc;
use dozlab_operator::builder::{self, generate_password};
use dozlab_operator::config::BuilderDefaults;
use dozlab_operator::labsession::{SessionConfig, SessionResources};
use dozlab_operator::{LabSession, LabSessionSpec};
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use tracing::debug;

use crate::error::UsageError;
use crate::output::{access_instructions, print_items, print_json, render_status, SessionRow};
use crate::{Commands, CreateArgs, OutputFormat};

/// Object name of the LabSession for `session_id`
pub fn session_name(session_id: &str) -> String {
    format!("session-{session_id}")
}

/// Build the LabSession for `dozlab create`, rejecting specs the operator would fail
pub fn new_session(args: &CreateArgs, password: String) -> Result<LabSession, UsageError> {
    let spec = LabSessionSpec {
        session_id: args.session_id.clone(),
        user_id: args.user_id.clone(),
        rootfs_image_url: args.rootfs_url.clone(),
        rootfs_sha256: args.rootfs_sha256.clone(),
        resources: SessionResources {
            memory: args.memory.clone(),
            cpu: args.cpu.clone(),
            storage: args.storage.clone(),
        },
        config: SessionConfig {
            vs_code_password: Some(password),
            enable_terminal: !args.no_terminal,
            enable_vs_code: !args.no_vscode,
            enable_ssh: !args.no_ssh,
        },
        timeout: args.timeout.clone(),
    };
    builder::validate(&spec, &BuilderDefaults::default())
        .map_err(|e| UsageError(format!("invalid session: {e}")))?;
    Ok(LabSession::new(&session_name(&spec.session_id), spec))
}

pub async fn handle(
    api: Api<LabSession>,
    namespace: &str,
    command: Commands,
    format: OutputFormat,
) -> Result<()> {
    match command {
        Commands::Create(args) => {
            let password = args.password.clone().unwrap_or_else(generate_password);
            let session = new_session(&args, password.clone())?;
            debug!(name = %session_name(&args.session_id), "Creating LabSession");
            let created = api.create(&PostParams::default(), &session).await?;
            match format {
                OutputFormat::Table => {
                    print!("{}", access_instructions(namespace, &created.spec, &password))
                }
                OutputFormat::Json => print_json(&created),
            }
        }
        Commands::Delete { session_id } => {
            api.delete(&session_name(&session_id), &DeleteParams::default())
                .await?;
            match format {
                OutputFormat::Table => println!("Session {session_id} deleted"),
                OutputFormat::Json => {
                    print_json(&serde_json::json!({ "sessionId": session_id, "deleted": true }))
                }
            }
        }
        Commands::List => {
            let sessions = api.list(&ListParams::default()).await?;
            let now = Utc::now();
            let mut rows: Vec<SessionRow> = sessions
                .items
                .iter()
                .map(|s| SessionRow::from_session(s, now))
                .collect();
            rows.sort_by(|a, b| a.session_id.cmp(&b.session_id));
            if rows.is_empty() && matches!(format, OutputFormat::Table) {
                println!("No sessions found in namespace {namespace}");
            } else {
                print_items(&rows, format);
            }
        }
        Commands::Status { session_id } => {
            let session = api.get(&session_name(&session_id)).await?;
            match format {
                OutputFormat::Table => print!("{}", render_status(&session)),
                OutputFormat::Json => print_json(&session.status.unwrap_or_default()),
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_args(session_id: &str) -> CreateArgs {
        CreateArgs {
            session_id: session_id.to_string(),
            user_id: "alice".to_string(),
            rootfs_url: "https://example.com/dozlab-k8s.ext4".to_string(),
            rootfs_sha256: None,
            memory: "2Gi".to_string(),
            cpu: "1".to_string(),
            storage: "4Gi".to_string(),
            timeout: "30m".to_string(),
            password: None,
            no_terminal: false,
            no_vscode: false,
            no_ssh: true,
        }
    }

    #[test]
    fn test_session_name() {
        assert_eq!(session_name("abc123"), "session-abc123");
    }

    #[test]
    fn test_new_session() {
        let session = new_session(&create_args("abc"), "pw".to_string()).unwrap();

        assert_eq!(session.metadata.name.as_deref(), Some("session-abc"));
        assert_eq!(session.spec.config.vs_code_password.as_deref(), Some("pw"));
        assert!(!session.spec.config.enable_ssh);
        assert!(session.spec.config.enable_terminal);
        assert!(session.status.is_none());
    }

    #[test]
    fn test_new_session_rejects_bad_input() {
        let err = new_session(&create_args("Not_A_Label"), "pw".to_string()).unwrap_err();
        assert!(err.to_string().contains("sessionId"));

        let mut args = create_args("abc");
        args.timeout = "forever".to_string();
        let err = new_session(&args, "pw".to_string()).unwrap_err();
        assert!(err.to_string().contains("timeout"));
    }

    #[test]
    fn test_generated_password_length() {
        assert_eq!(generate_password().len(), 32);
    }
}
