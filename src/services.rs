//! Signing and decryption collaborators.
//!
//! WS-Security signing and response decryption are delegated to services
//! behind these traits. The command implementations run an external program
//! (the WSS4J tooling in the usual deployment) with templated arguments and
//! read the result from its standard output.

use crate::config::{CommandConfig, CredentialBundle};
use crate::error::{VbmsError, VbmsResult};
use crate::signature::SignatureMark;
use async_trait::async_trait;
use std::io::Write;
use std::path::Path;
use std::process::Stdio;
use tempfile::NamedTempFile;
use tokio::process::Command;
use tracing::{debug, trace};

/// Signs an assembled envelope. Returns the signed envelope XML, which must
/// carry a `wsse:Security` header.
#[async_trait]
pub trait SigningService: Send + Sync {
    async fn sign(
        &self,
        operation: &str,
        envelope_xml: &str,
        marks: &[SignatureMark],
        credentials: Option<&CredentialBundle>,
    ) -> VbmsResult<String>;
}

/// Decrypts an encrypted response envelope. Returns plaintext XML.
#[async_trait]
pub trait DecryptionService: Send + Sync {
    async fn decrypt(
        &self,
        response_xml: &str,
        credentials: Option<&CredentialBundle>,
    ) -> VbmsResult<String>;
}

/// Signs by running an external program.
#[derive(Debug, Clone)]
pub struct CommandSigningService {
    command: CommandConfig,
}

impl CommandSigningService {
    pub fn new(command: CommandConfig) -> Self {
        Self { command }
    }
}

#[async_trait]
impl SigningService for CommandSigningService {
    async fn sign(
        &self,
        operation: &str,
        envelope_xml: &str,
        marks: &[SignatureMark],
        credentials: Option<&CredentialBundle>,
    ) -> VbmsResult<String> {
        let marks_json = serde_json::to_vec(marks)
            .map_err(|e| VbmsError::SigningService(format!("Cannot encode marks: {}", e)))?;
        run_command(
            &self.command,
            CommandInputs {
                input: envelope_xml.as_bytes(),
                marks: Some(&marks_json),
                operation,
                credentials,
            },
        )
        .await
        .map_err(VbmsError::SigningService)
    }
}

/// Decrypts by running an external program.
#[derive(Debug, Clone)]
pub struct CommandDecryptionService {
    command: CommandConfig,
}

impl CommandDecryptionService {
    pub fn new(command: CommandConfig) -> Self {
        Self { command }
    }
}

#[async_trait]
impl DecryptionService for CommandDecryptionService {
    async fn decrypt(
        &self,
        response_xml: &str,
        credentials: Option<&CredentialBundle>,
    ) -> VbmsResult<String> {
        run_command(
            &self.command,
            CommandInputs {
                input: response_xml.as_bytes(),
                marks: None,
                operation: "decrypt",
                credentials,
            },
        )
        .await
        .map_err(VbmsError::DecryptionService)
    }
}

struct CommandInputs<'a> {
    input: &'a [u8],
    marks: Option<&'a [u8]>,
    operation: &'a str,
    credentials: Option<&'a CredentialBundle>,
}

/// Run the configured program and return its stdout. Temp files live until
/// this function returns; the child is killed if the future is dropped.
async fn run_command(command: &CommandConfig, inputs: CommandInputs<'_>) -> Result<String, String> {
    let input_file = write_temp(inputs.input, ".xml")?;
    let marks_file = inputs.marks.map(|m| write_temp(m, ".json")).transpose()?;

    let keyfile = command
        .keystore
        .as_deref()
        .or(inputs.credentials.map(|c| c.key_file.as_path()))
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    let keypass = inputs
        .credentials
        .map(|c| c.key_password.as_str())
        .unwrap_or_default();

    let args: Vec<String> = command
        .args
        .iter()
        .map(|arg| {
            arg.replace("{input}", &path_arg(input_file.path()))
                .replace(
                    "{marks}",
                    &marks_file
                        .as_ref()
                        .map(|f| path_arg(f.path()))
                        .unwrap_or_default(),
                )
                .replace("{keyfile}", &keyfile)
                .replace("{keypass}", keypass)
                .replace("{operation}", inputs.operation)
        })
        .collect();

    debug!(
        program = %command.program,
        operation = inputs.operation,
        input_bytes = inputs.input.len(),
        "Running external command"
    );

    let mut cmd = Command::new(&command.program);
    cmd.args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &command.working_dir {
        cmd.current_dir(dir);
    }

    let output = cmd
        .output()
        .await
        .map_err(|e| format!("Failed to run {}: {}", command.program, e))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!(
            "{} exited with {}: {}",
            command.program,
            output.status,
            stderr.trim()
        ));
    }

    let stdout = String::from_utf8(output.stdout)
        .map_err(|e| format!("{} produced non UTF-8 output: {}", command.program, e))?;
    trace!(output = %stdout, "External command output");
    Ok(stdout)
}

fn write_temp(data: &[u8], suffix: &str) -> Result<NamedTempFile, String> {
    let mut file = tempfile::Builder::new()
        .prefix("connect-vbms-")
        .suffix(suffix)
        .tempfile()
        .map_err(|e| format!("Cannot create temp file: {}", e))?;
    file.write_all(data)
        .and_then(|_| file.flush())
        .map_err(|e| format!("Cannot write temp file: {}", e))?;
    Ok(file)
}

fn path_arg(path: &Path) -> String {
    path.display().to_string()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::signature::ContentSelector;
    use crate::xpath::bindings;

    fn command(program: &str, args: &[&str]) -> CommandConfig {
        CommandConfig {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            working_dir: None,
            keystore: None,
        }
    }

    fn bundle() -> CredentialBundle {
        CredentialBundle {
            key_file: "/keys/client.jks".into(),
            key_password: "importkey".to_string(),
            cert_file: "/keys/client.crt".into(),
            ca_cert_file: "/keys/ca.crt".into(),
            saml_assertion_path: "/keys/saml.xml".into(),
        }
    }

    #[tokio::test]
    async fn test_signing_reads_stdout() {
        let signer = CommandSigningService::new(command("cat", &["{input}"]));
        let signed = signer.sign("getDocumentContent", "<e/>", &[], None).await.unwrap();
        assert_eq!(signed, "<e/>");
    }

    #[tokio::test]
    async fn test_placeholders_are_substituted() {
        let signer = CommandSigningService::new(command(
            "sh",
            &["-c", "echo \"$1 $2 $3\"; cat \"$4\"", "sh", "{keyfile}", "{keypass}", "{operation}", "{marks}"],
        ));
        let marks = vec![crate::signature::SignatureMark {
            xpath: "/soapenv:Envelope/soapenv:Body".to_string(),
            namespaces: bindings([("soapenv", crate::namespaces::SOAPENV_NS)]),
            selector: ContentSelector::Content,
            local_name: "Body".to_string(),
            namespace_uri: crate::namespaces::SOAPENV_NS.to_string(),
            node: vec![1],
        }];
        let out = signer
            .sign("establishClaim", "<e/>", &marks, Some(&bundle()))
            .await
            .unwrap();
        assert!(out.starts_with("/keys/client.jks importkey establishClaim\n"));
        assert!(out.contains("\"selector\":\"Content\""));
    }

    #[tokio::test]
    async fn test_keystore_overrides_key_file() {
        let mut config = command("echo", &["{keyfile}"]);
        config.keystore = Some("/keys/override.jks".into());
        let decryptor = CommandDecryptionService::new(config);
        let out = decryptor.decrypt("<e/>", Some(&bundle())).await.unwrap();
        assert_eq!(out.trim(), "/keys/override.jks");
    }

    #[tokio::test]
    async fn test_non_zero_exit_maps_to_service_error() {
        let signer = CommandSigningService::new(command("sh", &["-c", "echo bad key >&2; exit 3"]));
        let err = signer.sign("op", "<e/>", &[], None).await.unwrap_err();
        match err {
            VbmsError::SigningService(message) => assert!(message.contains("bad key")),
            other => panic!("unexpected error: {other}"),
        }

        let decryptor = CommandDecryptionService::new(command("false", &[]));
        assert!(matches!(
            decryptor.decrypt("<e/>", None).await,
            Err(VbmsError::DecryptionService(_))
        ));
    }

    #[tokio::test]
    async fn test_temp_files_are_removed() {
        let signer = CommandSigningService::new(command("echo", &["{input}"]));
        let out = signer.sign("op", "<e/>", &[], None).await.unwrap();
        let path = std::path::PathBuf::from(out.trim());
        assert!(path.to_string_lossy().contains("connect-vbms-"));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_missing_program() {
        let signer = CommandSigningService::new(command("/nonexistent/signer", &[]));
        assert!(matches!(
            signer.sign("op", "<e/>", &[], None).await,
            Err(VbmsError::SigningService(_))
        ));
    }
}
