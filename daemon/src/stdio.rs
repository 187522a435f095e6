// JSON-lines harness over stdin/stdout.
//
// Input, one object per line:
//   {"evaluate": <Flow>}          -> {"evaluation": <Evaluation>}
//   {"admin": <AdminRequest>}     -> {"reply": <AdminReply>}
// Resolutions are pushed unprompted as {"resolution": <Resolution>}.
// Lines that do not parse are answered with {"error": "..."}.

use log::{debug, warn};
use policy_core::{DecisionEngine, Evaluation, Flow, Resolution};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, watch};

use crate::admin::{AdminHandle, AdminReply, AdminRequest};
use crate::error::DaemonResult;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StdioMessage {
    Evaluate(Flow),
    Admin(AdminRequest),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StdioOutput {
    Evaluation(Evaluation),
    Reply(AdminReply),
    Resolution(Resolution),
    Error(String),
}

/// Serves until input ends or shutdown is signalled
pub async fn serve<R, W>(
    engine: Arc<DecisionEngine>,
    admin: AdminHandle,
    mut resolutions: broadcast::Receiver<Resolution>,
    mut shutdown: watch::Receiver<bool>,
    input: R,
    mut output: W,
) -> DaemonResult<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    loop {
        let out = tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    debug!("Input closed");
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                handle_line(&engine, &admin, &line).await
            }
            resolution = resolutions.recv() => match resolution {
                Ok(resolution) => StdioOutput::Resolution(resolution),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Dropped {} resolutions for a slow reader", n);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        };
        write_line(&mut output, &out).await?;
    }
    output.flush().await?;
    Ok(())
}

async fn handle_line(engine: &DecisionEngine, admin: &AdminHandle, line: &str) -> StdioOutput {
    match serde_json::from_str::<StdioMessage>(line) {
        Ok(StdioMessage::Evaluate(flow)) => StdioOutput::Evaluation(engine.evaluate(&flow)),
        Ok(StdioMessage::Admin(request)) => match admin.call(request).await {
            Ok(reply) => StdioOutput::Reply(reply),
            Err(e) => StdioOutput::Error(e.to_string()),
        },
        Err(e) => StdioOutput::Error(format!("unreadable message: {}", e)),
    }
}

async fn write_line<W: AsyncWrite + Unpin>(output: &mut W, out: &StdioOutput) -> DaemonResult<()> {
    let mut line = serde_json::to_vec(out)?;
    line.push(b'\n');
    output.write_all(&line).await?;
    output.flush().await?;
    Ok(())
}
