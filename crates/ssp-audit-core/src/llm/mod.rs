mod settings;

pub mod assessor;
pub mod azure;

use std::pin::Pin;

use anyhow::Result;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;

pub use assessor::LlmAssessor;
pub use azure::AzureReasoningClient;
pub use settings::LlmSettings;

/// A finite, non-restartable sequence of partial output chunks from one
/// remote invocation. Callers must drain it fully; intermediate chunks are
/// never a usable result on their own.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Session-oriented interface to the remote reasoning service. A client owns
/// one logical conversation and must not be shared across concurrent batches.
#[async_trait]
pub trait ReasoningClient: Send + Sync {
    /// Submit one instruction and receive the response as a chunk sequence.
    async fn complete(&self, prompt: &str, cancel: &CancellationToken) -> Result<ChunkStream>;

    /// Release the remote session. Best-effort; callers swallow failures.
    async fn close(&self) -> Result<()>;
}

/// Consume a chunk stream to completion, concatenating the pieces.
pub async fn drain_chunks(mut stream: ChunkStream) -> Result<String> {
    let mut output = String::new();
    while let Some(chunk) = stream.next().await {
        output.push_str(&chunk?);
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn drain_concatenates_all_chunks() {
        let stream: ChunkStream = Box::pin(futures::stream::iter(
            vec!["{\"status\"", ": \"Effective\"}"]
                .into_iter()
                .map(|s| Ok(s.to_string())),
        ));
        let text = drain_chunks(stream).await.unwrap();
        assert_eq!(text, "{\"status\": \"Effective\"}");
    }

    #[tokio::test]
    async fn drain_surfaces_mid_stream_errors() {
        let stream: ChunkStream = Box::pin(futures::stream::iter(vec![
            Ok("partial".to_string()),
            Err(anyhow::anyhow!("connection reset")),
        ]));
        let err = drain_chunks(stream).await.unwrap_err();
        assert!(err.to_string().contains("connection reset"));
    }
}
