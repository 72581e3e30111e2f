//! Persistent worker processes

use crate::error::{WorkerError, WorkerResult};
use crate::protocol::{CommandSender, JsonLineProtocol, WorkerCommand};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// How long `close` waits for a worker to exit on its own before killing it
const CLOSE_GRACE_PERIOD: Duration = Duration::from_secs(2);

/// Outcome of a single job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerJobResult {
    /// Exit code reported by the worker
    pub exit_code: i32,
    /// Contents of the job's stdout file, if the worker wrote one
    pub stdout: Option<String>,
    /// Contents of the job's stderr file, if the worker wrote one
    pub stderr: Option<String>,
}

/// A long-lived process accepting jobs
pub trait WorkerProcess: Send {
    /// Whether the underlying process is running
    fn is_alive(&mut self) -> bool;

    /// Launch the process and perform the handshake, unless already done
    fn ensure_launch_and_handshake(&mut self) -> WorkerResult<()>;

    /// Submit a job and block until its result arrives
    fn submit_and_wait_for_job(&mut self, job_args: &str) -> WorkerResult<WorkerJobResult>;

    /// Hook run before a pooled process is handed to a new lease
    fn prepare_for_reuse(&mut self) {}

    /// Stop the process
    fn close(&mut self);
}

/// How to start a worker process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerProcessParams {
    /// Program and arguments
    pub command: Vec<String>,

    /// Extra environment
    pub env: BTreeMap<String, String>,

    /// Working directory of the process
    pub working_dir: Option<PathBuf>,

    /// Scratch directory for job argument and output files
    pub temp_dir: PathBuf,
}

impl WorkerProcessParams {
    /// Params for `command` using `temp_dir` as scratch space
    pub fn new(command: Vec<String>, temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            command,
            env: BTreeMap::new(),
            working_dir: None,
            temp_dir: temp_dir.into(),
        }
    }

    fn display_command(&self) -> String {
        self.command.join(" ")
    }
}

/// Worker process started from a command line, talking [`JsonLineProtocol`]
/// over its stdin/stdout and exchanging job data through scratch files.
pub struct DefaultWorkerProcess {
    params: WorkerProcessParams,
    stderr_log: PathBuf,
    child: Option<Child>,
    protocol: Option<Box<dyn CommandSender>>,
    handshake_performed: bool,
    next_message_id: u64,
}

impl DefaultWorkerProcess {
    /// Prepare a process; nothing is launched until the first job
    pub fn new(params: WorkerProcessParams) -> Self {
        let stderr_log = params.temp_dir.join("stderr");
        Self {
            params,
            stderr_log,
            child: None,
            protocol: None,
            handshake_performed: false,
            next_message_id: 0,
        }
    }

    /// Use an already connected protocol instead of launching a process
    pub fn with_protocol(params: WorkerProcessParams, protocol: Box<dyn CommandSender>) -> Self {
        let mut process = Self::new(params);
        process.protocol = Some(protocol);
        process
    }

    /// Scratch directory of this process
    pub fn temp_dir(&self) -> &Path {
        &self.params.temp_dir
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_message_id;
        self.next_message_id = self.next_message_id.wrapping_add(1);
        id
    }

    fn launch(&mut self) -> WorkerResult<()> {
        let (program, args) = self
            .params
            .command
            .split_first()
            .ok_or(WorkerError::EmptyCommand)?;

        fs::create_dir_all(&self.params.temp_dir)?;
        let stderr = File::create(&self.stderr_log)?;

        debug!("Starting worker process using command: '{}'", self.params.display_command());
        let mut command = Command::new(program);
        let _ = command
            .args(args)
            .envs(&self.params.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::from(stderr));
        if let Some(dir) = &self.params.working_dir {
            let _ = command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|source| WorkerError::Spawn {
            command: self.params.display_command(),
            source,
        })?;
        let stdin = child.stdin.take().ok_or(WorkerError::ProcessExited)?;
        let stdout = child.stdout.take().ok_or(WorkerError::ProcessExited)?;

        self.protocol = Some(Box::new(JsonLineProtocol::new(
            BufWriter::new(stdin),
            BufReader::new(stdout),
        )));
        self.child = Some(child);
        Ok(())
    }

    fn log_stderr_tail(&self) {
        if let Ok(contents) = fs::read_to_string(&self.stderr_log) {
            let tail: Vec<&str> = contents.lines().rev().take(20).collect();
            if !tail.is_empty() {
                let tail: Vec<&str> = tail.into_iter().rev().collect();
                error!(
                    "Worker process '{}' failed. stderr:\n{}",
                    self.params.display_command(),
                    tail.join("\n")
                );
            }
        }
    }
}

impl WorkerProcess for DefaultWorkerProcess {
    fn is_alive(&mut self) -> bool {
        match &mut self.child {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => self.protocol.is_some(),
        }
    }

    fn ensure_launch_and_handshake(&mut self) -> WorkerResult<()> {
        if self.handshake_performed {
            return Ok(());
        }
        if self.protocol.is_none() {
            self.launch()?;
        }

        let id = self.next_id();
        debug!("Handshaking with worker process '{}'", self.params.display_command());
        let protocol = self.protocol.as_mut().ok_or(WorkerError::ProcessExited)?;
        if let Err(e) = protocol.handshake(id) {
            self.log_stderr_tail();
            return Err(e);
        }
        self.handshake_performed = true;
        Ok(())
    }

    fn submit_and_wait_for_job(&mut self, job_args: &str) -> WorkerResult<WorkerJobResult> {
        if !self.handshake_performed {
            return Err(WorkerError::Protocol(
                "job submitted before the handshake was performed".to_string(),
            ));
        }

        let id = self.next_id();
        let command = WorkerCommand {
            args_path: self.params.temp_dir.join(format!("{id}.args")),
            stdout_path: self.params.temp_dir.join(format!("{id}.out")),
            stderr_path: self.params.temp_dir.join(format!("{id}.err")),
        };
        remove_if_exists(&command.stdout_path)?;
        remove_if_exists(&command.stderr_path)?;
        fs::write(&command.args_path, job_args)?;

        debug!("Sending job {} to worker process, arguments: '{}'", id, job_args);
        let protocol = self.protocol.as_mut().ok_or(WorkerError::ProcessExited)?;
        protocol.send(id, &command)?;
        let exit_code = match protocol.receive_command_response(id) {
            Ok(code) => code,
            Err(e) => {
                self.log_stderr_tail();
                return Err(e);
            }
        };

        let stdout = read_if_exists(&command.stdout_path)?;
        let stderr = read_if_exists(&command.stderr_path)?;
        debug!("Job {} finished with exit code {}", id, exit_code);

        Ok(WorkerJobResult {
            exit_code,
            stdout,
            stderr,
        })
    }

    fn close(&mut self) {
        debug!("Closing worker process '{}'", self.params.display_command());
        if let Some(mut protocol) = self.protocol.take() {
            if let Err(e) = protocol.close() {
                warn!("Error closing worker process protocol: {}", e);
            }
        }
        if let Some(mut child) = self.child.take() {
            let deadline = Instant::now() + CLOSE_GRACE_PERIOD;
            loop {
                match child.try_wait() {
                    Ok(Some(_)) => break,
                    Ok(None) if Instant::now() < deadline => thread::sleep(Duration::from_millis(10)),
                    _ => {
                        let _ = child.kill();
                        let _ = child.wait();
                        break;
                    }
                }
            }
        }
        self.handshake_performed = false;
        let _ = fs::remove_file(&self.stderr_log);
    }
}

impl Drop for DefaultWorkerProcess {
    fn drop(&mut self) {
        if self.child.is_some() {
            self.close();
        }
    }
}

fn remove_if_exists(path: &Path) -> WorkerResult<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

fn read_if_exists(path: &Path) -> WorkerResult<Option<String>> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(Some(contents)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
