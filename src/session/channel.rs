use futures_util::FutureExt;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use vmctl_worker::{FrameDecoder, FrameError, Response};

#[derive(Debug, Error)]
pub enum ChannelError {
    /// The worker closed its end. `open_block` names a block cut short.
    #[error("channel closed by worker")]
    Closed { open_block: Option<String> },

    #[error("channel i/o failed")]
    Io(#[source] std::io::Error),

    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Controller end of the command channel.
///
/// Commands go out as single lines; responses come back as frames. Reads
/// go through `Lines::next_line`, which is cancel-safe, so a receive can be
/// raced against a timeout without losing buffered data.
pub struct Channel {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Channel {
    pub fn new(stream: UnixStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            lines: BufReader::new(reader).lines(),
            writer,
        }
    }

    /// Discard response lines that are already waiting. Returns how many
    /// were dropped.
    pub fn drain_stale(&mut self) -> usize {
        let mut dropped = 0;
        while let Some(Ok(Some(line))) = self.lines.next_line().now_or_never() {
            tracing::warn!(line = %line, "discarding stale response line");
            dropped += 1;
        }
        dropped
    }

    pub async fn send_line(&mut self, line: &str) -> Result<(), ChannelError> {
        let mut buf = String::with_capacity(line.len() + 1);
        buf.push_str(line);
        buf.push('\n');
        self.writer
            .write_all(buf.as_bytes())
            .await
            .map_err(ChannelError::Io)?;
        self.writer.flush().await.map_err(ChannelError::Io)
    }

    /// Read exactly one response frame.
    pub async fn recv_frame(&mut self) -> Result<Response, ChannelError> {
        let mut decoder = FrameDecoder::new();
        loop {
            let Some(line) = self.lines.next_line().await.map_err(ChannelError::Io)? else {
                return Err(ChannelError::Closed {
                    open_block: decoder.open_block().map(str::to_string),
                });
            };
            tracing::trace!(line = %line, "received");
            if let Some(response) = decoder.push_line(&line)? {
                return Ok(response);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn pair() -> (Channel, UnixStream) {
        let (ours, theirs) = UnixStream::pair().unwrap();
        (Channel::new(ours), theirs)
    }

    #[tokio::test]
    async fn receives_single_line_and_block_frames() {
        let (mut channel, mut worker) = pair().await;
        worker
            .write_all(b"SUCCESS: done\nDETAILS_START\nname: web01\nDETAILS_END\n")
            .await
            .unwrap();

        assert_eq!(
            channel.recv_frame().await.unwrap(),
            Response::Success("done".into())
        );
        match channel.recv_frame().await.unwrap() {
            Response::Block { name, lines } => {
                assert_eq!(name, "DETAILS");
                assert_eq!(lines, vec!["name: web01"]);
            }
            other => panic!("expected block, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn truncated_block_reports_open_block() {
        let (mut channel, mut worker) = pair().await;
        worker.write_all(b"SNAPSHOTS_START\nsnap1\n").await.unwrap();
        drop(worker);

        match channel.recv_frame().await {
            Err(ChannelError::Closed { open_block }) => {
                assert_eq!(open_block.as_deref(), Some("SNAPSHOTS"));
            }
            other => panic!("expected closed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn eof_between_frames_is_plain_close() {
        let (mut channel, worker) = pair().await;
        drop(worker);
        assert!(matches!(
            channel.recv_frame().await,
            Err(ChannelError::Closed { open_block: None })
        ));
    }

    #[tokio::test]
    async fn drain_discards_buffered_lines() {
        let (mut channel, mut worker) = pair().await;
        worker.write_all(b"SUCCESS: first\nSUCCESS: second\n").await.unwrap();
        assert_eq!(
            channel.recv_frame().await.unwrap(),
            Response::Success("first".into())
        );

        assert_eq!(channel.drain_stale(), 1);
        assert_eq!(channel.drain_stale(), 0);
    }

    #[tokio::test]
    async fn send_line_appends_newline() {
        let (mut channel, worker) = pair().await;
        channel.send_line("power-on").await.unwrap();

        let mut lines = BufReader::new(worker).lines();
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("power-on"));
    }

    #[tokio::test]
    async fn garbage_is_a_frame_error() {
        let (mut channel, mut worker) = pair().await;
        worker.write_all(b"hello there\n").await.unwrap();
        assert!(matches!(
            channel.recv_frame().await,
            Err(ChannelError::Frame(FrameError::Unexpected(_)))
        ));
    }
}
