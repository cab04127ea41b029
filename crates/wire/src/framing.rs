//! Reading request lines and writing response envelopes over an
//! arbitrary async byte stream (the unix control socket in production,
//! an in-memory duplex pipe in tests).

use crate::error::ProtocolError;
use crate::response::{Envelope, ResponseLine, StatusLevel};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// Read one request line. Returns `Ok(None)` on clean EOF.
pub async fn read_request_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Option<String>, ProtocolError> {
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches(['\n', '\r']).to_string()))
}

/// Write a raw request line, client side of the control socket.
pub async fn write_request_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> Result<(), ProtocolError> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

/// Read a full response envelope: status lines up to the optional JSON
/// payload line, terminated by a blank line. The client-side counterpart
/// to `write_envelope`.
pub async fn read_envelope<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Envelope, ProtocolError> {
    let mut envelope = Envelope::new();
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            break;
        }
        let line = line.trim_end_matches(['\n', '\r']);
        if line.is_empty() {
            break;
        }
        if let Some(rest) = line.strip_prefix("INFO ") {
            envelope.lines.push(ResponseLine { level: StatusLevel::Info, message: rest.to_string() });
        } else if let Some(rest) = line.strip_prefix("WARN ") {
            envelope.lines.push(ResponseLine { level: StatusLevel::Warn, message: rest.to_string() });
        } else if let Some(rest) = line.strip_prefix("ERROR ") {
            envelope.lines.push(ResponseLine { level: StatusLevel::Error, message: rest.to_string() });
        } else if let Ok(value) = serde_json::from_str::<serde_json::Value>(line) {
            envelope.payload = Some(value);
        }
    }
    Ok(envelope)
}

/// Write a full response envelope: status lines, an optional JSON
/// payload line, then a blank terminator line.
pub async fn write_envelope<W: AsyncWrite + Unpin>(writer: &mut W, envelope: &Envelope) -> Result<(), ProtocolError> {
    for line in &envelope.lines {
        writer.write_all(format!("{} {}\n", line.level.as_str(), line.message).as_bytes()).await?;
    }
    if let Some(payload) = &envelope.payload {
        writer.write_all(serde_json::to_string(payload).unwrap_or_default().as_bytes()).await?;
        writer.write_all(b"\n").await?;
    }
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

/// Write one raw line in a streaming session (no envelope terminator).
pub async fn write_stream_line<W: AsyncWrite + Unpin>(writer: &mut W, text: &str) -> Result<(), ProtocolError> {
    writer.write_all(text.as_bytes()).await?;
    if !text.ends_with('\n') {
        writer.write_all(b"\n").await?;
    }
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::StatusLevel;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn round_trip_envelope() {
        let mut buf = Vec::new();
        let envelope = Envelope::new().push(StatusLevel::Info, "ok").with_payload(&serde_json::json!({"a": 1}));
        write_envelope(&mut buf, &envelope).await.unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert_eq!(text, "INFO ok\n{\"a\":1}\n\n");
    }

    #[tokio::test]
    async fn read_request_line_returns_none_at_eof() {
        let mut reader = BufReader::new(&b""[..]);
        assert_eq!(read_request_line(&mut reader).await.unwrap(), None);
    }

    #[tokio::test]
    async fn reads_envelope_written_by_the_server_side() {
        let mut buf = Vec::new();
        let envelope = Envelope::new().push(StatusLevel::Info, "ok").with_payload(&serde_json::json!({"a": 1}));
        write_envelope(&mut buf, &envelope).await.unwrap();

        let mut reader = BufReader::new(&buf[..]);
        let parsed = read_envelope(&mut reader).await.unwrap();
        assert_eq!(parsed.lines.len(), 1);
        assert_eq!(parsed.lines[0].message, "ok");
        assert_eq!(parsed.payload, Some(serde_json::json!({"a": 1})));
    }

    #[tokio::test]
    async fn write_request_line_appends_newline() {
        let mut buf = Vec::new();
        write_request_line(&mut buf, "STATUS").await.unwrap();
        assert_eq!(buf, b"STATUS\n");
    }

    #[tokio::test]
    async fn read_request_line_strips_newline() {
        let mut reader = BufReader::new(&b"STATUS\n"[..]);
        assert_eq!(read_request_line(&mut reader).await.unwrap(), Some("STATUS".to_string()));
    }
}
