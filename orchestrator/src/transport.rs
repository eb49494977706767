//! Ejecución remota sobre el cliente OpenSSH.
//!
//! Cada llamada abre su propia conexión (sin pooling) y se resuelve en un
//! único `Outcome` dentro de `timeout` más un overhead acotado: al vencer el
//! deadline el proceso hijo se mata (`kill_on_drop`).

use std::{
    env,
    path::Path,
    process::{ExitStatus, Stdio},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use fleet_common::{Credential, FailureReason, Node, Outcome};
use tokio::{io::AsyncWriteExt, process::Command};
use tracing::debug;

/// Código de salida de sshpass cuando la contraseña es rechazada.
const SSHPASS_AUTH_FAILED: i32 = 5;
/// ssh devuelve 255 ante errores propios (conexión, resolución...).
const SSH_ERROR: i32 = 255;
const MAX_CONNECT_TIMEOUT_SECS: u64 = 15;
const DETAIL_MAX_CHARS: usize = 400;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Corre `command` en el nodo.
    async fn execute(&self, node: &Node, command: &str, timeout: Duration) -> Outcome;

    /// Escribe `blob` en `remote_path`, creando el directorio si hace falta.
    async fn transfer(&self, node: &Node, blob: &[u8], remote_path: &str, timeout: Duration)
        -> Outcome;

    /// Copia `remote_path` del nodo a `local_path`.
    async fn fetch(
        &self,
        node: &Node,
        remote_path: &str,
        local_path: &Path,
        timeout: Duration,
    ) -> Outcome;
}

/// Programa ssh a usar. Se puede sobreescribir con FLEET_SSH_PROGRAM.
fn ssh_program() -> String {
    env::var("FLEET_SSH_PROGRAM").unwrap_or_else(|_| "ssh".to_string())
}

/// Wrapper para credenciales con contraseña. Se puede sobreescribir con
/// FLEET_SSHPASS_PROGRAM.
fn sshpass_program() -> String {
    env::var("FLEET_SSHPASS_PROGRAM").unwrap_or_else(|_| "sshpass".to_string())
}

/// Comilla simple para el shell remoto.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/* --------- Invocación de un proceso local --------- */

/// Programa + argumentos ya armados, listos para lanzar.
#[derive(Debug, Clone)]
pub(crate) struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    /// Se pasa por la env var SSHPASS, nunca en la línea de comando.
    pub password: Option<String>,
}

impl Invocation {
    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).kill_on_drop(true);
        if let Some(password) = &self.password {
            cmd.env("SSHPASS", password);
        }
        cmd
    }
}

/// Qué hacer con el stdout del hijo.
pub(crate) enum Output {
    Capture,
    File(std::fs::File),
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

/// Últimos `max` caracteres de stderr, sin espacios sobrantes.
fn tail(bytes: &[u8], max: usize) -> String {
    let text = String::from_utf8_lossy(bytes);
    let text = text.trim();
    let count = text.chars().count();
    if count <= max {
        text.to_string()
    } else {
        let skip = count - max;
        format!("…{}", text.chars().skip(skip).collect::<String>())
    }
}

fn classify(inv: &Invocation, status: ExitStatus, stdout: &[u8], stderr: &[u8], ms: u64) -> Outcome {
    let err = tail(stderr, DETAIL_MAX_CHARS);

    match status.code() {
        // la salida va completa; sólo se quita el salto final
        Some(0) => Outcome::success(String::from_utf8_lossy(stdout).trim_end(), ms),
        Some(SSHPASS_AUTH_FAILED) if inv.password.is_some() => {
            Outcome::failure(FailureReason::AuthFailed, "contraseña rechazada", ms)
        }
        Some(_) if err.contains("Permission denied") => {
            Outcome::failure(FailureReason::AuthFailed, err, ms)
        }
        Some(SSH_ERROR) => Outcome::failure(FailureReason::TransportError, err, ms),
        Some(code) => {
            let detail = if err.is_empty() {
                format!("exit {code}")
            } else {
                format!("exit {code}: {err}")
            };
            Outcome::failure(FailureReason::NonzeroExit, detail, ms)
        }
        None => Outcome::failure(
            FailureReason::TransportError,
            "el cliente terminó por una señal",
            ms,
        ),
    }
}

/// Lanza la invocación y espera su resultado como máximo `timeout`.
pub(crate) async fn run_invocation(
    inv: &Invocation,
    input: Option<&[u8]>,
    output: Output,
    timeout: Duration,
) -> Outcome {
    let started = Instant::now();
    if timeout.is_zero() {
        return Outcome::failure(
            FailureReason::TransportError,
            "timeout debe ser positivo",
            0,
        );
    }

    let mut cmd = inv.command();
    cmd.stdin(if input.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    cmd.stdout(match output {
        Output::Capture => Stdio::piped(),
        Output::File(file) => Stdio::from(file),
    });
    cmd.stderr(Stdio::piped());

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            return Outcome::failure(
                FailureReason::TransportError,
                format!("no se pudo lanzar {}: {}", inv.program, e),
                elapsed_ms(started),
            )
        }
    };

    let stdin = child.stdin.take();
    let io = async move {
        if let (Some(data), Some(mut stdin)) = (input, stdin) {
            // si el remoto corta antes, el código de salida cuenta la historia
            let _ = stdin.write_all(data).await;
            let _ = stdin.shutdown().await;
        }
        child.wait_with_output().await
    };

    // al soltar el future por timeout se suelta el hijo y kill_on_drop lo mata
    match tokio::time::timeout(timeout, io).await {
        Err(_) => Outcome::failure(
            FailureReason::Timeout,
            format!("sin respuesta tras {}s", timeout.as_secs_f64()),
            elapsed_ms(started),
        ),
        Ok(Err(e)) => Outcome::failure(
            FailureReason::TransportError,
            format!("error esperando a {}: {}", inv.program, e),
            elapsed_ms(started),
        ),
        Ok(Ok(out)) => classify(inv, out.status, &out.stdout, &out.stderr, elapsed_ms(started)),
    }
}

/* --------- Transporte SSH --------- */

#[derive(Debug, Clone)]
pub struct SshTransport {
    ssh_program: String,
    sshpass_program: String,
}

impl Default for SshTransport {
    fn default() -> Self {
        Self {
            ssh_program: ssh_program(),
            sshpass_program: sshpass_program(),
        }
    }
}

impl SshTransport {
    pub fn new(ssh_program: impl Into<String>, sshpass_program: impl Into<String>) -> Self {
        Self {
            ssh_program: ssh_program.into(),
            sshpass_program: sshpass_program.into(),
        }
    }

    pub(crate) fn invocation(&self, node: &Node, remote_command: &str, timeout: Duration) -> Invocation {
        let connect_secs = timeout.as_secs().clamp(1, MAX_CONNECT_TIMEOUT_SECS);

        let mut ssh_args = vec![
            "-p".to_string(),
            node.port.to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            "LogLevel=ERROR".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={connect_secs}"),
        ];

        let (program, mut args, password) = match &node.credential {
            Credential::KeyFile(path) => {
                ssh_args.extend([
                    "-i".to_string(),
                    path.display().to_string(),
                    "-o".to_string(),
                    "BatchMode=yes".to_string(),
                ]);
                (self.ssh_program.clone(), Vec::new(), None)
            }
            Credential::Password(password) => {
                ssh_args.extend(["-o".to_string(), "NumberOfPasswordPrompts=1".to_string()]);
                (
                    self.sshpass_program.clone(),
                    vec!["-e".to_string(), self.ssh_program.clone()],
                    Some(password.clone()),
                )
            }
        };

        args.extend(ssh_args);
        args.push(format!("{}@{}", node.user, node.address));
        args.push(remote_command.to_string());

        Invocation {
            program,
            args,
            password,
        }
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn execute(&self, node: &Node, command: &str, timeout: Duration) -> Outcome {
        debug!("{} $ {}", node.label(), command);
        let inv = self.invocation(node, command, timeout);
        run_invocation(&inv, None, Output::Capture, timeout).await
    }

    async fn transfer(
        &self,
        node: &Node,
        blob: &[u8],
        remote_path: &str,
        timeout: Duration,
    ) -> Outcome {
        let target = shell_quote(remote_path);
        let command = match Path::new(remote_path).parent() {
            Some(dir) if !dir.as_os_str().is_empty() => format!(
                "mkdir -p -- {} && cat > {}",
                shell_quote(&dir.to_string_lossy()),
                target
            ),
            _ => format!("cat > {target}"),
        };
        debug!("{} <- {} ({} bytes)", node.label(), remote_path, blob.len());

        let inv = self.invocation(node, &command, timeout);
        match run_invocation(&inv, Some(blob), Output::Capture, timeout).await {
            Outcome::Success { elapsed_ms, .. } => {
                Outcome::success(format!("{} bytes -> {}", blob.len(), remote_path), elapsed_ms)
            }
            failure => failure,
        }
    }

    async fn fetch(
        &self,
        node: &Node,
        remote_path: &str,
        local_path: &Path,
        timeout: Duration,
    ) -> Outcome {
        if let Some(parent) = local_path.parent() {
            if !parent.as_os_str().is_empty() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    return Outcome::failure(
                        FailureReason::LocalError,
                        format!("no se pudo crear {}: {}", parent.display(), e),
                        0,
                    );
                }
            }
        }
        let file = match std::fs::File::create(local_path) {
            Ok(f) => f,
            Err(e) => {
                return Outcome::failure(
                    FailureReason::LocalError,
                    format!("no se pudo crear {}: {}", local_path.display(), e),
                    0,
                )
            }
        };
        debug!("{} -> {} ({})", node.label(), local_path.display(), remote_path);

        let command = format!("cat -- {}", shell_quote(remote_path));
        let inv = self.invocation(node, &command, timeout);
        match run_invocation(&inv, None, Output::File(file), timeout).await {
            Outcome::Success { elapsed_ms, .. } => {
                let size = std::fs::metadata(local_path).map(|m| m.len()).unwrap_or(0);
                Outcome::success(format!("{} bytes <- {}", size, remote_path), elapsed_ms)
            }
            failure => {
                // no dejar archivos a medias
                let _ = std::fs::remove_file(local_path);
                failure
            }
        }
    }
}
