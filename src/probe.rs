//! One complete connect → handshake → status → parse attempt against a single host.

use serde_json::value::RawValue;
use tracing::{debug, info, info_span, Instrument};

use crate::connection::{Connection, Connector};
use crate::error::ProbeError;
use crate::protocol::{self, StatusSummary};
use crate::types::{ProbeStage, ScanResult, Target};

/// Probe `target` and turn whatever happens into a [`ScanResult`].
///
/// Never fails: errors become `ScanResult::Failure`. The connection, if one was opened, is
/// closed before this returns on every path.
pub async fn probe(connector: &Connector, target: &Target) -> ScanResult {
    let span = info_span!("probe", host = %target);
    async {
        match run(connector, target).await {
            Ok(status) => {
                info!(status = %StatusSummary::from_raw(&status), "found server");
                ScanResult::Success {
                    target: target.clone(),
                    status,
                }
            }
            Err((stage, error)) => {
                debug!(%stage, %error, "probe failed");
                ScanResult::Failure {
                    target: target.clone(),
                    stage,
                    error,
                }
            }
        }
    }
    .instrument(span)
    .await
}

type StageResult<T> = Result<T, (ProbeStage, ProbeError)>;

fn at<E: Into<ProbeError>>(stage: ProbeStage) -> impl FnOnce(E) -> (ProbeStage, ProbeError) {
    move |e| (stage, e.into())
}

async fn run(connector: &Connector, target: &Target) -> StageResult<Box<RawValue>> {
    let mut conn = connector
        .connect(&target.host, target.port)
        .await
        .map_err(at(ProbeStage::Connect))?;

    let outcome = exchange(&mut conn, target, connector).await;
    conn.close();
    outcome
}

async fn exchange(conn: &mut Connection, target: &Target, connector: &Connector) -> StageResult<Box<RawValue>> {
    let timeout = connector.timeout();

    let request = protocol::encode_handshake_and_status_request(&target.host, target.port)
        .map_err(at(ProbeStage::Send))?;
    conn.send_all(&request, timeout)
        .await
        .map_err(at(ProbeStage::Send))?;

    let response = conn
        .drain_until(timeout, protocol::is_complete_frame)
        .await
        .map_err(at(ProbeStage::Receive))?;
    if response.is_empty() {
        return Err((ProbeStage::Receive, ProbeError::EmptyResponse));
    }
    debug!(bytes = response.len(), "received response");

    let json = protocol::parse_status_response(&response).map_err(at(ProbeStage::Parse))?;
    protocol::parse_status_json(json).map_err(at(ProbeStage::Parse))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn request_len(port: u16) -> usize {
        protocol::encode_handshake_and_status_request("127.0.0.1", port)
            .unwrap()
            .len()
    }

    #[tokio::test]
    async fn response_split_across_writes_is_reassembled() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut request = vec![0u8; request_len(addr.port())];
            sock.read_exact(&mut request).await.unwrap();
            for part in [&[0x04u8, 0x00][..], &[0x02], b"{}"] {
                sock.write_all(part).await.unwrap();
                sock.flush().await.unwrap();
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        });

        let connector = Connector::new(Duration::from_secs(2));
        let result = probe(&connector, &Target::new("127.0.0.1", addr.port())).await;
        match result {
            ScanResult::Success { status, .. } => assert_eq!(status.get(), "{}"),
            other => panic!("expected success, got {other:?}"),
        }
        assert_eq!(connector.stats().open_now(), 0);
    }

    #[tokio::test]
    async fn peer_closing_without_data_is_empty_response() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut request = vec![0u8; request_len(addr.port())];
            sock.read_exact(&mut request).await.unwrap();
        });

        let connector = Connector::new(Duration::from_secs(2));
        let result = probe(&connector, &Target::new("127.0.0.1", addr.port())).await;
        assert_eq!(result.reason().as_deref(), Some("empty response"));
        assert_eq!(connector.stats().opened(), connector.stats().closed());
    }
}
