// SPDX-License-Identifier: MIT

//! The three streaming commands (spec.md §4.H, §4.J): `LOGS`/`ATTACH` tail
//! and follow the daemon's own log file, `COMPANION_ATTACH` replays a
//! companion's ring then fans out its live broadcast. None of these ever
//! write a closing envelope; the connection just stays open until the
//! client disconnects or the daemon shuts down.

use crate::lifecycle::DaemonState;
use overseer_core::CompanionLifecycleState;
use overseer_wire::{write_stream_line, ProtocolError, Request};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite};
use tokio_util::sync::CancellationToken;

const POLL_INTERVAL: Duration = Duration::from_millis(300);

pub(super) async fn handle_streaming<R, W>(
    request: Request,
    _reader: &mut R,
    writer: &mut W,
    state: &Arc<DaemonState>,
    cancel: CancellationToken,
) -> Result<(), ProtocolError>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    match request {
        Request::Logs { lines, no_history } => {
            tail_log_file(&state.paths.log_path, if no_history { 0 } else { lines }, writer, &cancel).await
        }
        Request::Attach => tail_log_file(&state.paths.log_path, 0, writer, &cancel).await,
        Request::CompanionAttach { alias, name, lines, no_history } => {
            companion_attach(state, &alias, &name, if no_history { 0 } else { lines }, writer, &cancel).await
        }
        _ => unreachable!("non-streaming request routed to handle_streaming"),
    }
}

/// Tails `path`: writes up to `history_lines` existing lines, then polls
/// for growth and streams whatever was appended. No file-watch crate is
/// in the dependency stack, so growth detection is a bounded poll rather
/// than an inotify subscription — acceptable for a log a human is
/// watching interactively.
async fn tail_log_file<W: AsyncWrite + Unpin>(path: &Path, history_lines: usize, writer: &mut W, cancel: &CancellationToken) -> Result<(), ProtocolError> {
    let mut pos: u64 = 0;
    if history_lines > 0 {
        if let Ok(contents) = tokio::fs::read_to_string(path).await {
            pos = contents.len() as u64;
            let tail: Vec<&str> = contents.lines().rev().take(history_lines).collect();
            for line in tail.into_iter().rev() {
                write_stream_line(writer, line).await?;
            }
        }
    } else if let Ok(meta) = tokio::fs::metadata(path).await {
        pos = meta.len();
    }

    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = ticker.tick() => {
                let Ok(mut file) = tokio::fs::File::open(path).await else { continue };
                let Ok(meta) = file.metadata().await else { continue };
                // The log file is never truncated in place; a length
                // shrink means it was rotated out from under us, so
                // resync to the new file's current end instead of
                // seeking past it.
                if meta.len() < pos {
                    pos = meta.len();
                    continue;
                }
                if meta.len() == pos {
                    continue;
                }
                if file.seek(std::io::SeekFrom::Start(pos)).await.is_err() {
                    continue;
                }
                let mut buf = String::new();
                if file.read_to_string(&mut buf).await.is_err() {
                    continue;
                }
                pos += buf.len() as u64;
                for line in buf.lines() {
                    write_stream_line(writer, line).await?;
                }
            }
        }
    }
}

/// Replays a companion's ring (honoring `lines == 0` as "no history")
/// then forwards its live broadcast. A companion currently `waiting`
/// (parent tunnel reconnecting) is polled until it is `running` again,
/// per spec.md §4.F "blocks without error".
async fn companion_attach<W: AsyncWrite + Unpin>(
    state: &Arc<DaemonState>,
    alias: &str,
    name: &str,
    lines: usize,
    writer: &mut W,
    cancel: &CancellationToken,
) -> Result<(), ProtocolError> {
    let Some(handle) = state.companions.get(alias, name) else {
        return write_stream_line(writer, "ERROR not found").await;
    };

    loop {
        let waiting = handle.state.lock().await.state == CompanionLifecycleState::Waiting;
        if !waiting {
            break;
        }
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(POLL_INTERVAL) => continue,
        }
    }

    let (history, mut live) = handle.attach(lines).await;
    for line in history {
        write_stream_line(writer, &line.text).await?;
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            received = live.recv() => {
                match received {
                    Ok(line) => write_stream_line(writer, &line.text).await?,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return Ok(()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, split, AsyncBufReadExt, BufReader};

    async fn read_lines(mut reader: impl tokio::io::AsyncBufRead + Unpin, count: usize) -> Vec<String> {
        let mut out = Vec::new();
        let mut line = String::new();
        while out.len() < count {
            line.clear();
            let n = reader.read_line(&mut line).await.unwrap();
            assert!(n > 0, "stream closed before {count} lines were read");
            out.push(line.trim_end().to_string());
        }
        out
    }

    #[tokio::test]
    async fn replays_bounded_history_before_polling_for_growth() {
        let file = tempfile::NamedTempFile::new().unwrap();
        tokio::fs::write(file.path(), "one\ntwo\nthree\n").await.unwrap();

        let (client, server) = duplex(4096);
        let (_client_r, client_w) = split(client);
        let mut writer = client_w;
        let cancel = CancellationToken::new();
        let path = file.path().to_path_buf();
        let inner_cancel = cancel.clone();
        let task = tokio::spawn(async move { tail_log_file(&path, 2, &mut writer, &inner_cancel).await });

        let (server_r, _server_w) = split(server);
        let reader = BufReader::new(server_r);
        let lines = read_lines(reader, 2).await;
        assert_eq!(lines, vec!["two", "three"]);

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn no_history_request_only_streams_lines_appended_after_attach() {
        let file = tempfile::NamedTempFile::new().unwrap();
        tokio::fs::write(file.path(), "already-here\n").await.unwrap();

        let (client, server) = duplex(4096);
        let (_client_r, client_w) = split(client);
        let mut writer = client_w;
        let cancel = CancellationToken::new();
        let path = file.path().to_path_buf();
        let inner_cancel = cancel.clone();
        let task = tokio::spawn(async move { tail_log_file(&path, 0, &mut writer, &inner_cancel).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut appended = tokio::fs::OpenOptions::new().append(true).open(file.path()).await.unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut appended, b"fresh line\n").await.unwrap();

        let (server_r, _server_w) = split(server);
        let reader = BufReader::new(server_r);
        let lines = read_lines(reader, 1).await;
        assert_eq!(lines, vec!["fresh line"]);

        cancel.cancel();
        task.await.unwrap().unwrap();
    }
}
