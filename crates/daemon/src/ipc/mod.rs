//! Control plane: newline-delimited JSON over a Unix Domain Socket or TCP.
//!
//! Each request and reply is a single JSON value followed by `\n`. An
//! `Attach` request that succeeds turns the connection into a raw byte relay
//! for the rest of its lifetime.
//!
//! ## Socket Path
//!
//! - Primary: `$XDG_RUNTIME_DIR/runhub/runhub.sock`
//! - Fallback: `/tmp/runhub-$UID/runhub.sock`
//!
//! ## Example
//!
//! ```rust,no_run
//! use runhub::ipc::{get_socket_path, IpcClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client = IpcClient::connect(&get_socket_path()).await?;
//!     let created = client.new_session().await?;
//!     println!("{:?}", created.id);
//!     Ok(())
//! }
//! ```

mod client;
mod handler;
mod server;

pub use client::IpcClient;
pub use handler::{handle_request, serve_connection};
pub use server::{IpcConnection, IpcError, IpcServer, TcpServer};

use std::path::PathBuf;

/// Default socket path for the control plane.
#[cfg(unix)]
pub fn get_socket_path() -> PathBuf {
    use std::os::unix::fs::MetadataExt;

    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        PathBuf::from(runtime_dir).join("runhub").join("runhub.sock")
    } else {
        let uid = std::fs::metadata("/proc/self")
            .map(|m| m.uid())
            .unwrap_or(0);

        PathBuf::from(format!("/tmp/runhub-{}", uid)).join("runhub.sock")
    }
}

#[cfg(not(unix))]
pub fn get_socket_path() -> PathBuf {
    PathBuf::from("/tmp/runhub-unsupported/runhub.sock")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_get_socket_path_with_xdg_runtime_dir() {
        let original = std::env::var("XDG_RUNTIME_DIR").ok();

        // SAFETY: serialized with the other env-mutating tests
        unsafe {
            std::env::set_var("XDG_RUNTIME_DIR", "/run/user/1000");
        }
        let path = get_socket_path();
        assert_eq!(path, PathBuf::from("/run/user/1000/runhub/runhub.sock"));

        // SAFETY: as above
        unsafe {
            match original {
                Some(val) => std::env::set_var("XDG_RUNTIME_DIR", val),
                None => std::env::remove_var("XDG_RUNTIME_DIR"),
            }
        }
    }

    #[test]
    #[serial]
    fn test_get_socket_path_without_xdg_runtime_dir() {
        let original = std::env::var("XDG_RUNTIME_DIR").ok();

        // SAFETY: serialized with the other env-mutating tests
        unsafe {
            std::env::remove_var("XDG_RUNTIME_DIR");
        }
        let path = get_socket_path();
        let text = path.to_str().unwrap();
        assert!(text.starts_with("/tmp/runhub-"));
        assert!(text.ends_with("/runhub.sock"));

        // SAFETY: as above
        unsafe {
            if let Some(val) = original {
                std::env::set_var("XDG_RUNTIME_DIR", val);
            }
        }
    }

    #[test]
    #[serial]
    fn test_socket_path_is_absolute() {
        assert!(get_socket_path().is_absolute());
    }
}
