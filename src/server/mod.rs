//! TCP decision server.
//!
//! Exposes the limiter to other processes over a line protocol, one task
//! per connection.

mod protocol;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tracing::{debug, info, info_span, instrument, warn, Instrument};

pub use protocol::{Command, Reply};

use crate::error::Result;
use crate::ratelimit::RateLimiter;

/// Server answering rate limit queries for remote callers.
pub struct DecisionServer {
    /// Address to bind to
    addr: SocketAddr,
    /// The rate limiter instance
    rate_limiter: Arc<RateLimiter>,
}

impl DecisionServer {
    pub fn new(addr: SocketAddr, rate_limiter: Arc<RateLimiter>) -> Self {
        Self { addr, rate_limiter }
    }

    /// Bind the configured address and serve until `signal` resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let listener = TcpListener::bind(self.addr).await?;
        info!(addr = %self.addr, "Starting decision server");
        self.run(listener, signal).await
    }

    /// Serve connections from an already bound listener until `signal`
    /// resolves. Open connections finish on their own tasks.
    pub async fn run<F>(self, listener: TcpListener, signal: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(signal);

        loop {
            tokio::select! {
                _ = &mut signal => {
                    info!("Decision server shutting down");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let rate_limiter = self.rate_limiter.clone();
                        tokio::spawn(
                            async move {
                                debug!("Connection opened");
                                if let Err(e) = handle_connection(stream, rate_limiter).await {
                                    debug!(error = %e, "Connection closed with error");
                                }
                            }
                            .instrument(info_span!("connection", peer = %peer)),
                        );
                    }
                    Err(e) => warn!(error = %e, "Failed to accept connection"),
                },
            }
        }

        Ok(())
    }
}

/// Longest accepted request line, excluding the line terminator.
pub const MAX_LINE_LENGTH: usize = 1024;

/// Answer request lines from `stream` until the peer closes it.
///
/// A line longer than [`MAX_LINE_LENGTH`] gets an error reply and ends the
/// connection.
pub async fn handle_connection<S>(stream: S, rate_limiter: Arc<RateLimiter>) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::with_capacity(128);

    loop {
        buf.clear();
        // Room for the content plus a CRLF terminator
        let read = (&mut reader)
            .take(MAX_LINE_LENGTH as u64 + 2)
            .read_until(b'\n', &mut buf)
            .await?;
        if read == 0 {
            break;
        }

        if buf.last() == Some(&b'\n') {
            buf.pop();
            if buf.last() == Some(&b'\r') {
                buf.pop();
            }
        }
        if buf.len() > MAX_LINE_LENGTH {
            warn!(limit = MAX_LINE_LENGTH, "Rejected oversized request line");
            let reply = Reply::Error {
                message: format!("line exceeds {} bytes", MAX_LINE_LENGTH),
            };
            writer.write_all(reply.to_line().as_bytes()).await?;
            break;
        }

        let line = String::from_utf8_lossy(&buf);
        let reply = respond(&rate_limiter, &line).await;
        writer.write_all(reply.to_line().as_bytes()).await?;
    }

    writer.flush().await
}

#[instrument(level = "debug", skip(rate_limiter))]
async fn respond(rate_limiter: &RateLimiter, line: &str) -> Reply {
    match Command::parse(line) {
        Ok(Command::Allow(key)) => Reply::Verdict(rate_limiter.check(&key).await),
        Ok(Command::Remaining(key)) => {
            let remaining = rate_limiter.remaining(&key).await;
            Reply::Remaining { key, remaining }
        }
        Ok(Command::Ping) => Reply::Pong,
        Err(message) => {
            warn!(reason = %message, "Rejected request line");
            Reply::Error { message }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ratelimit::LimiterOptions;
    use tokio::net::TcpStream;

    fn test_limiter(rate: f64, burst: u64) -> Arc<RateLimiter> {
        let clock = Arc::new(ManualClock::new(1_000_000));
        Arc::new(RateLimiter::new(
            LimiterOptions::new(rate, burst).with_clock(clock),
        ))
    }

    #[tokio::test]
    async fn test_ping_and_error_lines() {
        let stream = tokio_test::io::Builder::new()
            .read(b"PING\nBOGUS\n")
            .write(b"{\"type\":\"pong\"}\n")
            .write(b"{\"type\":\"error\",\"message\":\"unknown command: BOGUS\"}\n")
            .build();

        handle_connection(stream, test_limiter(10.0, 5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_remaining_line() {
        let stream = tokio_test::io::Builder::new()
            .read(b"REMAINING user-1\n")
            .write(b"{\"type\":\"remaining\",\"key\":\"user-1\",\"remaining\":5}\n")
            .build();

        handle_connection(stream, test_limiter(10.0, 5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_oversized_line_is_rejected() {
        let oversized = vec![b'a'; MAX_LINE_LENGTH + 500];
        let stream = tokio_test::io::Builder::new()
            .read(b"PING\n")
            .write(b"{\"type\":\"pong\"}\n")
            .read(&oversized)
            .write(b"{\"type\":\"error\",\"message\":\"line exceeds 1024 bytes\"}\n")
            .build();

        handle_connection(stream, test_limiter(10.0, 5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_line_at_length_limit_is_answered() {
        let key = "k".repeat(MAX_LINE_LENGTH - "REMAINING ".len());
        let mut request = format!("REMAINING {}", key).into_bytes();
        assert_eq!(request.len(), MAX_LINE_LENGTH);
        request.extend_from_slice(b"\r\n");
        let expected = format!(
            "{{\"type\":\"remaining\",\"key\":\"{}\",\"remaining\":5}}\n",
            key
        );

        let stream = tokio_test::io::Builder::new()
            .read(&request)
            .write(expected.as_bytes())
            .build();

        handle_connection(stream, test_limiter(10.0, 5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_allow_until_denied() {
        let limiter = test_limiter(1.0, 2);
        let (client, server) = tokio::io::duplex(4096);
        let handler = tokio::spawn(handle_connection(server, limiter));

        let (read_half, mut write_half) = tokio::io::split(client);
        write_half
            .write_all(b"ALLOW user-1\nALLOW user-1\nALLOW user-1\n")
            .await
            .unwrap();
        write_half.shutdown().await.unwrap();

        let mut lines = BufReader::new(read_half).lines();
        let mut replies = Vec::new();
        while let Some(line) = lines.next_line().await.unwrap() {
            replies.push(serde_json::from_str::<Reply>(&line).unwrap());
        }
        handler.await.unwrap().unwrap();

        let verdicts: Vec<_> = replies
            .into_iter()
            .map(|reply| match reply {
                Reply::Verdict(verdict) => verdict,
                other => panic!("unexpected reply: {:?}", other),
            })
            .collect();

        assert_eq!(verdicts.len(), 3);
        assert!(verdicts[0].allowed);
        assert_eq!(verdicts[0].remaining, 1);
        assert!(verdicts[1].allowed);
        assert!(!verdicts[2].allowed);
        assert_eq!(verdicts[2].retry_after_secs, Some(2));
    }

    #[tokio::test]
    async fn test_server_over_tcp_with_shutdown() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = DecisionServer::new(addr, test_limiter(10.0, 1));

        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let serving = tokio::spawn(server.run(listener, async move {
            let _ = stop_rx.await;
        }));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"ALLOW a\nALLOW a\n").await.unwrap();
        stream.shutdown().await.unwrap();

        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        let replies: Vec<Reply> = response
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();

        assert!(matches!(&replies[0], Reply::Verdict(v) if v.allowed));
        assert!(matches!(&replies[1], Reply::Verdict(v) if !v.allowed));

        stop_tx.send(()).unwrap();
        serving.await.unwrap().unwrap();
    }
}
