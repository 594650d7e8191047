//! JSON-lines command transport.

use async_trait::async_trait;
use saga::{Command, CommandDispatcher, DispatchError};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

/// Writes each command as one JSON object per line.
///
/// Downstream workers tail the stream; the lock keeps concurrent commands
/// from interleaving within a line.
pub struct JsonLinesDispatcher<W> {
    writer: Mutex<W>,
}

impl<W> JsonLinesDispatcher<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

impl JsonLinesDispatcher<tokio::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout())
    }
}

#[async_trait]
impl<W> CommandDispatcher for JsonLinesDispatcher<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn dispatch(&self, command: &Command) -> Result<(), DispatchError> {
        let mut line = serde_json::to_vec(command)?;
        line.push(b'\n');

        let mut writer = self.writer.lock().await;
        writer.write_all(&line).await?;
        writer.flush().await?;

        tracing::debug!(
            correlation_id = %command.correlation_id,
            command_type = %command.command_type,
            "command written"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{CorrelationId, Payload};
    use instance_store::Version;

    fn command(command_type: &str) -> Command {
        let mut payload = Payload::new();
        payload.insert("match_id".to_string(), serde_json::json!("m-1"));
        Command {
            correlation_id: CorrelationId::new("MatchAcceptance:m-1"),
            command_type: command_type.to_string(),
            step: "ReserveSlot".to_string(),
            version: Version::first(),
            payload,
        }
    }

    #[tokio::test]
    async fn test_one_command_per_line() {
        let dispatcher = JsonLinesDispatcher::new(Vec::new());
        dispatcher.dispatch(&command("ReserveSlot")).await.unwrap();
        dispatcher.dispatch(&command("ReleaseSlot")).await.unwrap();

        let output = String::from_utf8(dispatcher.into_inner()).unwrap();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: Command = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first, command("ReserveSlot"));
        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["command_type"], "ReleaseSlot");
        assert_eq!(second["correlation_id"], "MatchAcceptance:m-1");
    }
}
