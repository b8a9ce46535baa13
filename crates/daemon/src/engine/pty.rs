//! PTY process engine.
//!
//! Spawns the configured command inside a pseudo-terminal. portable-pty only
//! offers blocking readers and writers, so each attachment is bridged onto
//! an async duplex pipe by two OS threads: one copies PTY output into the
//! pipe, the other copies pipe input into the PTY. Both threads end when the
//! child exits or the session drops its side of the pipe.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::sync::Mutex;

use dashmap::DashMap;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::runtime::Handle;

use super::{AttachParams, Attachment, EngineError, ProcessEngine, ProcessRef};
use crate::config::EngineConfig;
use crate::transport::DEFAULT_CHUNK_SIZE;

/// A spawned PTY child. The master is kept so the terminal stays open for
/// as long as the process is tracked.
struct PtyProcess {
    child: Box<dyn Child + Send + Sync>,
    _master: Box<dyn MasterPty + Send>,
}

/// Runs sessions as local commands in a PTY.
pub struct PtyEngine {
    command: String,
    args: Vec<String>,
    cwd: Option<String>,
    env: BTreeMap<String, String>,
    cols: u16,
    rows: u16,
    processes: DashMap<String, Mutex<PtyProcess>>,
}

impl PtyEngine {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            cwd: None,
            env: BTreeMap::new(),
            cols: 80,
            rows: 24,
            processes: DashMap::new(),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
            cwd: config.cwd.clone(),
            env: config.env.clone(),
            cols: config.cols,
            rows: config.rows,
            processes: DashMap::new(),
        }
    }

    /// Number of PTY children currently tracked.
    pub fn process_count(&self) -> usize {
        self.processes.len()
    }

    fn spawn_child(
        &self,
        params: &AttachParams,
    ) -> Result<(PtyProcess, Box<dyn Read + Send>, Box<dyn Write + Send>), EngineError> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(PtySize {
                rows: self.rows,
                cols: self.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| EngineError::AttachFailed(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&self.command);
        for arg in &self.args {
            cmd.arg(arg);
        }

        if let Some(ref dir) = self.cwd {
            cmd.cwd(dir);
        }

        cmd.env("TERM", "xterm-256color");
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        for (key, value) in &params.env {
            cmd.env(key, value);
        }

        let child = pair.slave.spawn_command(cmd).map_err(|e| {
            tracing::error!(command = %self.command, error = %e, "Failed to spawn PTY command");
            EngineError::AttachFailed(e.to_string())
        })?;

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| EngineError::AttachFailed(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| EngineError::AttachFailed(e.to_string()))?;

        Ok((
            PtyProcess {
                child,
                _master: pair.master,
            },
            reader,
            writer,
        ))
    }
}

impl ProcessEngine for PtyEngine {
    async fn attach(&self, params: &AttachParams) -> Result<Attachment, EngineError> {
        let (mut process, reader, writer) = self.spawn_child(params)?;
        let pid = process.child.process_id();
        let id = format!("pty-{}", params.session_id);

        let pipe = match bridge(reader, writer, Handle::current(), &id) {
            Ok(pipe) => pipe,
            Err(e) => {
                let _ = process.child.kill();
                return Err(EngineError::AttachFailed(e.to_string()));
            }
        };
        let (pipe_reader, pipe_writer) = tokio::io::split(pipe);

        self.processes.insert(id.clone(), Mutex::new(process));

        tracing::info!(
            process_id = %id,
            pid = ?pid,
            command = %self.command,
            "Spawned PTY process"
        );

        Ok(Attachment {
            process: ProcessRef { id, pid },
            reader: Box::new(pipe_reader),
            writer: Box::new(pipe_writer),
        })
    }

    async fn stop(&self, process: &ProcessRef) -> Result<(), EngineError> {
        let (id, entry) = self
            .processes
            .remove(&process.id)
            .ok_or_else(|| EngineError::UnknownProcess(process.id.clone()))?;

        let mut pty = entry
            .into_inner()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        // kill() and wait() block; keep them off the async workers.
        let status = tokio::task::spawn_blocking(move || {
            if let Ok(Some(status)) = pty.child.try_wait() {
                return Ok(status);
            }
            pty.child
                .kill()
                .map_err(|e| EngineError::StopFailed(e.to_string()))?;
            pty.child
                .wait()
                .map_err(|e| EngineError::StopFailed(e.to_string()))
        })
        .await
        .map_err(|e| EngineError::StopFailed(e.to_string()))??;

        tracing::info!(
            process_id = %id,
            exit_code = status.exit_code(),
            "Stopped PTY process"
        );
        Ok(())
    }
}

/// Bridge a blocking reader/writer pair onto an async duplex pipe.
fn bridge(
    mut reader: Box<dyn Read + Send>,
    mut writer: Box<dyn Write + Send>,
    handle: Handle,
    id: &str,
) -> std::io::Result<DuplexStream> {
    let (ours, theirs) = tokio::io::duplex(DEFAULT_CHUNK_SIZE);
    let (mut pipe_rd, mut pipe_wr) = tokio::io::split(theirs);

    let output_handle = handle.clone();
    let output_id = id.to_string();
    std::thread::Builder::new()
        .name(format!("{id}-out"))
        .spawn(move || {
            let mut buffer = vec![0u8; DEFAULT_CHUNK_SIZE];
            loop {
                match reader.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(n) => {
                        if output_handle
                            .block_on(pipe_wr.write_all(&buffer[..n]))
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(e) => {
                        // Linux reports EIO once the child side of the PTY closes.
                        tracing::debug!(process_id = %output_id, error = %e, "PTY read ended");
                        break;
                    }
                }
            }
            let _ = output_handle.block_on(pipe_wr.shutdown());
            tracing::debug!(process_id = %output_id, "PTY output thread exiting");
        })?;

    let input_id = id.to_string();
    std::thread::Builder::new()
        .name(format!("{id}-in"))
        .spawn(move || {
            let mut buffer = vec![0u8; DEFAULT_CHUNK_SIZE];
            loop {
                let n = match handle.block_on(pipe_rd.read(&mut buffer)) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                if writer
                    .write_all(&buffer[..n])
                    .and_then(|_| writer.flush())
                    .is_err()
                {
                    break;
                }
            }
            tracing::debug!(process_id = %input_id, "PTY input thread exiting");
        })?;

    Ok(ours)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn read_until(reader: &mut super::super::ProcessReader, marker: &str) -> bool {
        let mut seen = Vec::new();
        let mut buf = [0u8; 4096];
        for _ in 0..50 {
            match timeout(Duration::from_millis(100), reader.read(&mut buf)).await {
                Ok(Ok(0)) | Ok(Err(_)) => return false,
                Ok(Ok(n)) => {
                    seen.extend_from_slice(&buf[..n]);
                    if String::from_utf8_lossy(&seen).contains(marker) {
                        return true;
                    }
                }
                Err(_) => {}
            }
        }
        false
    }

    #[tokio::test]
    async fn test_pty_roundtrip() {
        let engine = PtyEngine::new("/bin/sh", vec![]);
        let mut attachment = engine
            .attach(&AttachParams::for_session("pty-test"))
            .await
            .unwrap();
        assert_eq!(engine.process_count(), 1);

        attachment
            .writer
            .write_all(b"echo pty_roundtrip_marker\n")
            .await
            .unwrap();
        attachment.writer.flush().await.unwrap();

        assert!(
            read_until(&mut attachment.reader, "pty_roundtrip_marker").await,
            "Did not receive expected output"
        );

        engine.stop(&attachment.process).await.unwrap();
        assert_eq!(engine.process_count(), 0);
    }

    #[tokio::test]
    async fn test_pty_session_env_is_set() {
        let engine = PtyEngine::new("/bin/sh", vec![]);
        let mut attachment = engine
            .attach(&AttachParams::for_session("env-check"))
            .await
            .unwrap();

        attachment
            .writer
            .write_all(b"echo id=$RUNHUB_SESSION_ID\n")
            .await
            .unwrap();

        assert!(read_until(&mut attachment.reader, "id=env-check").await);
        engine.stop(&attachment.process).await.unwrap();
    }

    #[tokio::test]
    async fn test_pty_spawn_failure() {
        let engine = PtyEngine::new("/nonexistent/command/runhub", vec![]);
        let result = engine.attach(&AttachParams::for_session("bad")).await;
        assert!(matches!(result, Err(EngineError::AttachFailed(_))));
        assert_eq!(engine.process_count(), 0);
    }

    #[tokio::test]
    async fn test_pty_stop_twice() {
        let engine = PtyEngine::new("/bin/sh", vec![]);
        let attachment = engine
            .attach(&AttachParams::for_session("twice"))
            .await
            .unwrap();

        engine.stop(&attachment.process).await.unwrap();
        let second = engine.stop(&attachment.process).await;
        assert!(matches!(second, Err(EngineError::UnknownProcess(_))));
    }

    #[tokio::test]
    async fn test_pty_output_ends_after_exit() {
        let engine = PtyEngine::new("/bin/sh", vec!["-c".to_string(), "echo bye".to_string()]);
        let mut attachment = engine
            .attach(&AttachParams::for_session("exit"))
            .await
            .unwrap();

        let mut collected = Vec::new();
        let result = timeout(
            Duration::from_secs(5),
            attachment.reader.read_to_end(&mut collected),
        )
        .await;
        assert!(result.is_ok(), "PTY stream did not end after exit");
        assert!(String::from_utf8_lossy(&collected).contains("bye"));

        engine.stop(&attachment.process).await.unwrap();
    }
}
