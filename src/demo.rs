//! A request/response exchange over an in-process bus: one client endpoint,
//! one server endpoint answering every session with an echo.

use std::io::Read;

use anyhow::{Context, Result};

use crate::config::Config;
use crate::envelope::Metadata;
use crate::inbound::ReadEvent;
use crate::session::Connection;
use crate::substrate::LoopbackBus;
use crate::telemetry::EndpointStatsSnapshot;
use crate::wire::Encoding;

#[derive(Debug, Clone)]
pub struct LoopbackReport {
    pub session_id: String,
    pub encoding: Encoding,
    pub response: String,
    pub client: EndpointStatsSnapshot,
    pub server: EndpointStatsSnapshot,
}

/// Sends `GET {path}` with `body` and waits for the whole response.
pub fn run_loopback(cfg: &Config, path: &str, body: &str) -> Result<LoopbackReport> {
    let bus = LoopbackBus::new(cfg.encoding())?;
    let options = cfg.pipe_options();

    let server = bus.endpoint(format!("{}-server", cfg.endpoint_id), options)?;
    server.set_acceptor(|conn: Connection| {
        let session = conn.session_id().to_string();
        if let Err(err) = serve_echo(&conn) {
            crate::logging::error(format!("echo session={session}: {err:#}"));
            let _ = conn.close();
        }
    });
    let client = bus.endpoint(cfg.endpoint_id.clone(), options)?;

    let mut meta = Metadata::new();
    meta.insert("method".to_string(), "GET".to_string());
    meta.insert("path".to_string(), path.to_string());
    let conn = client.connect(server.id(), meta)?;
    let session_id = conn.session_id().to_string();

    let request = format!("GET {path} HTTP/1.0\r\n\r\n{body}");
    conn.outbound()
        .write(request.as_bytes())
        .context("write request")?;
    conn.outbound().flush().context("flush request")?;
    conn.done().context("finish request")?;

    let mut response = String::new();
    conn.inbound()
        .read_to_string(&mut response)
        .context("read response")?;
    conn.close().context("close session")?;

    let report = LoopbackReport {
        session_id,
        encoding: bus.encoding(),
        response,
        client: client.stats(),
        server: server.stats(),
    };
    client.shutdown();
    server.shutdown();
    bus.unregister(client.id());
    bus.unregister(server.id());
    Ok(report)
}

/// Reads one request to end-of-stream and answers `200 OK` with the body.
fn serve_echo(conn: &Connection) -> Result<()> {
    let meta = conn.metadata()?.unwrap_or_default();
    let pipe = conn.inbound_pipe();

    let mut request = Vec::new();
    let mut flushes = 0usize;
    let mut buf = [0u8; 4096];
    loop {
        match pipe.read_event(&mut buf)? {
            ReadEvent::Data(n) => request.extend_from_slice(&buf[..n]),
            ReadEvent::Flush => flushes += 1,
            ReadEvent::Noop => {}
            ReadEvent::Eof => break,
        }
    }
    let request = String::from_utf8_lossy(&request).into_owned();
    let (head, body) = request
        .split_once("\r\n\r\n")
        .unwrap_or((request.as_str(), ""));
    let request_line = head.lines().next().unwrap_or_default();
    crate::logging::info_kv(
        "echo: request",
        &[
            ("session", conn.session_id()),
            ("line", request_line),
            ("path", meta.get("path").map(String::as_str).unwrap_or("")),
            ("flushes", flushes.to_string().as_str()),
        ],
    );

    let response = format!("HTTP/1.0 200 OK\r\nx-request: {request_line}\r\n\r\n{body}");
    conn.outbound().write(response.as_bytes())?;
    conn.outbound().flush()?;
    conn.close()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echo_round_trip_for_each_coalescing_mode() {
        for nagle_ms in [-1i64, 0, 20] {
            let cfg = Config {
                endpoint_id: format!("demo-{}", nagle_ms.abs()),
                nagle_ms,
                read_timeout_ms: Some(5_000),
                encoding: Some("json".to_string()),
                ..Config::default()
            };
            let report = run_loopback(&cfg, "/x", "body").unwrap();
            assert_eq!(report.encoding, Encoding::Json);
            assert_eq!(
                report.response,
                "HTTP/1.0 200 OK\r\nx-request: GET /x HTTP/1.0\r\n\r\nbody"
            );
            assert_eq!(report.client.sessions_opened, 1);
            assert_eq!(report.server.sessions_accepted, 1);
            assert_eq!(report.client.protocol_errors, 0);
            assert!(report.client.envelopes_sent >= 1);
        }
    }
}
