//! Reader loop.
//!
//! Owns the read half of the transport and hands every frame to the
//! dispatcher. End of stream or a read error tears the session down.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::dispatcher::{CloseReason, Dispatcher};
use crate::transport::FrameStream;

pub(crate) fn spawn(
    mut stream: Box<dyn FrameStream>,
    dispatcher: Arc<Dispatcher>,
    teardown: Arc<watch::Sender<bool>>,
) -> JoinHandle<()> {
    let mut shutdown = teardown.subscribe();

    tokio::spawn(async move {
        let reason = loop {
            tokio::select! {
                biased;

                _ = super::torn_down(&mut shutdown) => break CloseReason::Stopped,

                frame = stream.recv() => match frame {
                    Some(Ok(frame)) => {
                        dispatcher.dispatch(&frame).await;
                    },
                    Some(Err(e)) => {
                        warn!(error = %e, "Transport read failed");
                        break CloseReason::Transport(e.to_string());
                    },
                    None => {
                        info!("Connection closed by remote");
                        break CloseReason::Transport("connection closed by remote".to_string());
                    },
                },
            }
        };

        // Fail whatever is still waiting before anyone observes teardown
        dispatcher.close(reason).await;
        teardown.send_replace(true);
        debug!("Reader loop exited");
    })
}
