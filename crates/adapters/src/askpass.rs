//! The client half of the askpass round trip: run by the daemon's own
//! binary when `ssh` execs it as `$SSH_ASKPASS` (`spec.md` §4.E). Connects
//! to the daemon's control socket, presents `(alias, token)`, and prints
//! the returned password to stdout for `ssh` to consume.

use overseer_wire::{payload, read_envelope, write_request_line, StatusLevel};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncWrite};

#[derive(Debug, Error)]
pub enum AskpassClientError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] overseer_wire::ProtocolError),

    #[error("daemon rejected askpass request: {0}")]
    Rejected(String),

    #[error("daemon response carried no password payload")]
    MissingPayload,
}

/// Send `ASKPASS alias token` and extract the password from the reply.
/// Generic over separate reader/writer halves so this can be exercised
/// against an in-memory duplex stream in tests as well as a real unix
/// socket (whose `into_split()` halves are exactly this shape).
pub async fn request_password<R, W>(reader: &mut R, writer: &mut W, alias: &str, token: &str) -> Result<String, AskpassClientError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    write_request_line(writer, &format!("ASKPASS {alias} {token}")).await?;
    let envelope = read_envelope(reader).await?;
    if envelope.is_error() {
        let message = envelope.lines.iter().find(|l| l.level == StatusLevel::Error).map(|l| l.message.clone()).unwrap_or_default();
        return Err(AskpassClientError::Rejected(message));
    }
    let payload = envelope.payload.ok_or(AskpassClientError::MissingPayload)?;
    let parsed: payload::AskpassPayload = serde_json::from_value(payload).map_err(|_| AskpassClientError::MissingPayload)?;
    Ok(parsed.password)
}

#[cfg(test)]
mod tests {
    use super::*;
    use overseer_wire::Envelope;
    use tokio::io::{duplex, split, BufReader};

    #[tokio::test]
    async fn extracts_password_from_successful_reply() {
        let (client, server) = duplex(256);
        let (client_r, mut client_w) = split(client);
        let mut client_reader = BufReader::new(client_r);

        let (server_r, mut server_w) = split(server);
        let mut server_reader = BufReader::new(server_r);
        tokio::spawn(async move {
            let mut line = String::new();
            tokio::io::AsyncBufReadExt::read_line(&mut server_reader, &mut line).await.unwrap();
            assert_eq!(line.trim(), "ASKPASS lab tok-1");
            let envelope =
                Envelope::new().push(StatusLevel::Info, "ok").with_payload(&payload::AskpassPayload { password: "hunter2".into() });
            overseer_wire::write_envelope(&mut server_w, &envelope).await.unwrap();
        });

        let password = request_password(&mut client_reader, &mut client_w, "lab", "tok-1").await.unwrap();
        assert_eq!(password, "hunter2");
    }

    #[tokio::test]
    async fn surfaces_rejection_as_an_error() {
        let (client, server) = duplex(256);
        let (client_r, mut client_w) = split(client);
        let mut client_reader = BufReader::new(client_r);

        let (server_r, mut server_w) = split(server);
        let mut server_reader = BufReader::new(server_r);
        tokio::spawn(async move {
            let mut line = String::new();
            tokio::io::AsyncBufReadExt::read_line(&mut server_reader, &mut line).await.unwrap();
            let envelope = Envelope::new().push(StatusLevel::Error, "not found");
            overseer_wire::write_envelope(&mut server_w, &envelope).await.unwrap();
        });

        let result = request_password(&mut client_reader, &mut client_w, "lab", "stale-token").await;
        assert!(matches!(result, Err(AskpassClientError::Rejected(_))));
    }
}
