//! Container process engine.
//!
//! Drives the docker CLI: `attach` starts a detached interactive container
//! from the configured image, then runs `docker attach` with piped stdio so
//! the container's stdin/stdout become the session's process stream.
//! `stop` force-removes the container and reaps the attach client.

use std::process::Stdio;

use dashmap::DashMap;
use tokio::process::{Child, Command};

use super::{AttachParams, Attachment, EngineError, ProcessEngine, ProcessRef};
use crate::config::EngineConfig;

/// Runs sessions as docker containers.
pub struct ContainerEngine {
    docker: String,
    image: String,
    args: Vec<String>,
    attached: DashMap<String, Child>,
}

impl ContainerEngine {
    pub fn new(docker: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            docker: docker.into(),
            image: image.into(),
            args: Vec::new(),
            attached: DashMap::new(),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            docker: config.docker_bin.clone(),
            image: config.image.clone(),
            args: config.args.clone(),
            attached: DashMap::new(),
        }
    }

    /// Arguments for `docker run` that start the container detached with
    /// stdin held open.
    fn run_args(&self, params: &AttachParams) -> Vec<String> {
        let mut args = vec!["run".to_string(), "-d".to_string(), "-i".to_string()];
        for (key, value) in &params.env {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }
        args.push(self.image.clone());
        args.extend(self.args.iter().cloned());
        args
    }

    async fn docker(&self, args: &[String]) -> Result<String, String> {
        let output = Command::new(&self.docker)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| format!("failed to run {}: {}", self.docker, e))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(String::from_utf8_lossy(&output.stderr).trim().to_string())
        }
    }
}

impl ProcessEngine for ContainerEngine {
    async fn attach(&self, params: &AttachParams) -> Result<Attachment, EngineError> {
        let container_id = self
            .docker(&self.run_args(params))
            .await
            .map_err(EngineError::AttachFailed)?;
        if container_id.is_empty() {
            return Err(EngineError::AttachFailed(
                "docker run returned no container id".to_string(),
            ));
        }

        let spawned = Command::new(&self.docker)
            .args(["attach", "--sig-proxy=false", container_id.as_str()])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                let _ = self.docker(&rm_args(&container_id)).await;
                return Err(EngineError::AttachFailed(format!(
                    "failed to attach to {container_id}: {e}"
                )));
            }
        };

        let (Some(stdout), Some(stdin)) = (child.stdout.take(), child.stdin.take()) else {
            let _ = child.start_kill();
            let _ = self.docker(&rm_args(&container_id)).await;
            return Err(EngineError::AttachFailed(
                "docker attach has no piped stdio".to_string(),
            ));
        };

        let pid = child.id();
        self.attached.insert(container_id.clone(), child);

        tracing::info!(
            container_id = %container_id,
            image = %self.image,
            session_id = %params.session_id,
            "Started container"
        );

        Ok(Attachment {
            process: ProcessRef {
                id: container_id,
                pid,
            },
            reader: Box::new(stdout),
            writer: Box::new(stdin),
        })
    }

    async fn stop(&self, process: &ProcessRef) -> Result<(), EngineError> {
        let removed = self.docker(&rm_args(&process.id)).await;

        // The attach client exits once the container is gone; kill it
        // regardless so a failed removal does not leak it.
        if let Some((_, mut child)) = self.attached.remove(&process.id) {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }

        match removed {
            Ok(_) => {
                tracing::info!(container_id = %process.id, "Removed container");
                Ok(())
            }
            Err(stderr) => Err(EngineError::StopFailed(stderr)),
        }
    }
}

fn rm_args(container_id: &str) -> Vec<String> {
    vec!["rm".to_string(), "-f".to_string(), container_id.to_string()]
}
