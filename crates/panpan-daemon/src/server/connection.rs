//! One client connection: read frames, dispatch, answer in order.

use std::sync::Arc;

use panpan_core::framing::{FrameError, encode_frame, read_frame};
use panpan_core::protocol::{Request, RequestType, Response};
use panpan_core::transport::{BoxReader, BoxWriter};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::DaemonState;
use super::dispatch::dispatch;

pub(super) async fn handle_connection(mut reader: BoxReader, mut writer: BoxWriter, state: Arc<DaemonState>) {
    debug!("New connection");

    loop {
        let request: Request = tokio::select! {
            _ = state.shutdown.cancelled() => break,
            frame = read_frame(&mut reader) => match frame {
                Ok(Some(request)) => request,
                Ok(None) => {
                    debug!("Client closed connection");
                    break;
                }
                Err(e) => {
                    warn!("Closing connection after framing error: {e}");
                    break;
                }
            },
        };

        let shutdown_requested = request.kind == RequestType::Shutdown.as_str();
        let response = dispatch(&request, &state).await;

        if let Err(e) = write_response(&mut writer, response).await {
            warn!("Failed to write response to {}: {e}", request.id);
            break;
        }

        if shutdown_requested {
            info!("Shutdown requested by client");
            state.shutdown.cancel();
            break;
        }
    }
}

/// Write one response. A response too large to frame is replaced by an
/// error response with the same id, so the client is never left waiting.
async fn write_response(writer: &mut BoxWriter, response: Response) -> Result<(), FrameError> {
    let frame = match encode_frame(&response) {
        Ok(frame) => frame,
        Err(e @ FrameError::TooLarge { .. }) => {
            warn!("Response to {} could not be framed: {e}", response.id);
            encode_frame(&Response::err(response.id, e.to_string()))?
        }
        Err(e) => return Err(e),
    };
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}
