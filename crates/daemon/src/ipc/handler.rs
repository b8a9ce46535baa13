//! Request dispatch for control connections.

use protocol::{Pong, ProtocolError, Reply, Request, Response, SessionList};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::server::{write_line, IpcConnection, IpcError};
use crate::engine::ProcessEngine;
use crate::session::SessionManager;
use crate::transport::{StreamSink, StreamSource};

/// Answer a single non-attach request.
pub async fn handle_request<E: ProcessEngine>(
    manager: &SessionManager<E>,
    request: Request,
) -> Reply {
    match request {
        Request::Ping => Reply::Pong(Pong::new()),
        Request::NewSession => match manager.create_session().await {
            Ok(id) => Response::success(Some(id)).into(),
            Err(e) => Response::fail(e.to_string()).into(),
        },
        Request::ListSessions => SessionList {
            ids: manager.list_sessions(),
        }
        .into(),
        Request::CloseSession { id } => match manager.close_session(&id).await {
            Ok(()) => Response::success(Some(id)).into(),
            Err(e) => Response::fail(e.to_string()).with_id(id).into(),
        },
        Request::Attach { id } => Response::fail("attach must be served on its own connection")
            .with_id(id)
            .into(),
    }
}

/// Serve one control connection until the client leaves, an attach relay
/// ends, or `shutdown` fires.
pub async fn serve_connection<S, E>(
    mut conn: IpcConnection<S>,
    manager: SessionManager<E>,
    shutdown: CancellationToken,
) -> Result<(), IpcError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    E: ProcessEngine,
{
    loop {
        let request = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Ok(()),
            request = conn.read_request() => request,
        };

        let request = match request {
            Ok(Some(request)) => request,
            Ok(None) => return Ok(()),
            Err(IpcError::Protocol(e @ ProtocolError::LineTooLong { .. })) => {
                conn.send(&Response::fail(e.to_string())).await?;
                return Err(e.into());
            }
            Err(IpcError::Protocol(e)) => {
                debug!(error = %e, "Rejecting malformed request");
                conn.send(&Response::fail(format!("invalid request: {e}")))
                    .await?;
                continue;
            }
            Err(e) => return Err(e),
        };

        if let Request::Attach { id } = request {
            return serve_attach(conn, &manager, id).await;
        }

        let reply = handle_request(&manager, request).await;
        conn.send(&reply).await?;
    }
}

/// Switch the connection into a raw relay for session `id`.
async fn serve_attach<S, E>(
    conn: IpcConnection<S>,
    manager: &SessionManager<E>,
    id: String,
) -> Result<(), IpcError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    E: ProcessEngine,
{
    let (reader, mut writer) = conn.into_parts();

    let handle = match manager.subscribe(&id, StreamSource::new(reader)).await {
        Ok(handle) => handle,
        Err(e) => {
            warn!(session_id = %id, error = %e, "Attach rejected");
            write_line(&mut writer, &Response::fail(e.to_string()).with_id(id)).await?;
            writer.shutdown().await?;
            return Ok(());
        }
    };

    write_line(&mut writer, &Response::success(Some(id.clone()))).await?;
    info!(session_id = %id, subscriber_id = %handle.id(), "Client attached");

    let stats = handle.pump(StreamSink::new(writer)).await;
    info!(
        session_id = %id,
        delivered = stats.delivered,
        dropped = stats.dropped,
        "Client detached"
    );
    Ok(())
}
