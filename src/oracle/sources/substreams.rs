//! Substreams streaming source
//!
//! Runs `substreams run ... --output=jsonl` as a child process and turns each
//! stdout line carrying a `value.price_id` payload into one observation.
//! The line stream is rebuilt on every launch.

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio_stream::wrappers::LinesStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, error, info, warn};

use crate::config::StreamingConfig;
use crate::oracle::feeds::feed_key_for_pyth_id;
use crate::oracle::sources::{SourceError, StreamExit, StreamSession, StreamingSource};
use crate::oracle::{decimal_from_json, epoch_to_utc, i64_from_json, IngestSink};
use crate::shutdown::ShutdownListener;
use crate::types::{NewObservation, ObservationSource};

const NAME: &str = "Substreams";
const API_TOKEN_ENV: &str = "SUBSTREAMS_API_TOKEN";

/// Result of parsing one stdout line
#[derive(Debug, Clone, PartialEq)]
pub enum LineOutcome {
    Observation(NewObservation),
    /// Valid JSON without a price payload (progress, block markers)
    Ignored,
    Malformed(String),
}

type RecordStream = Pin<Box<dyn Stream<Item = LineOutcome> + Send>>;

#[derive(Debug, Clone)]
pub struct SubstreamsSource {
    config: StreamingConfig,
}

impl SubstreamsSource {
    pub fn new(config: StreamingConfig) -> Self {
        Self { config }
    }

    /// Arguments passed to the binary, in order
    pub fn command_args(&self) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            format!("--endpoint={}", self.config.endpoint),
            format!("--manifest={}", self.config.manifest_path),
        ];
        if self.config.start_block > 0 {
            args.push(format!("--start-block={}", self.config.start_block));
        }
        args.push("--output=jsonl".to_string());
        args.push(self.config.module.clone());
        args
    }

    /// Parse one line of jsonl output
    pub fn parse_line(line: &str) -> LineOutcome {
        let line = line.trim();
        if line.is_empty() {
            return LineOutcome::Ignored;
        }

        let json: serde_json::Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => return LineOutcome::Malformed(format!("invalid JSON: {}", e)),
        };

        let value = &json["value"];
        let price_id = match value["price_id"].as_str() {
            Some(id) if !id.trim().is_empty() => id,
            _ => return LineOutcome::Ignored,
        };

        let mantissa = match decimal_from_json(&value["price"]) {
            Some(p) => p,
            None => return LineOutcome::Malformed(format!("missing price for {}", price_id)),
        };
        let expo = match i64_from_json(&value["expo"]).and_then(|e| i32::try_from(e).ok()) {
            Some(e) => e,
            None => return LineOutcome::Malformed(format!("missing expo for {}", price_id)),
        };
        let conf = decimal_from_json(&value["conf"]).unwrap_or(Decimal::ZERO);
        let publish_time = i64_from_json(&value["publish_time"])
            .and_then(epoch_to_utc)
            .unwrap_or_else(Utc::now);

        LineOutcome::Observation(NewObservation {
            feed_key: feed_key_for_pyth_id(price_id),
            mantissa,
            conf,
            expo,
            publish_time,
            source: ObservationSource::Substreams,
        })
    }

    /// Lazily parsed records from a line-oriented reader
    pub fn record_stream<R>(reader: R) -> impl Stream<Item = LineOutcome> + Send
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        LinesStream::new(BufReader::new(reader).lines()).map(|line| match line {
            Ok(line) => Self::parse_line(&line),
            Err(e) => LineOutcome::Malformed(format!("unreadable line: {}", e)),
        })
    }
}

#[async_trait]
impl StreamingSource for SubstreamsSource {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn probe(&self) -> bool {
        if self.config.api_token.trim().is_empty() {
            info!(source = %NAME, "No API token configured, streaming disabled");
            return false;
        }

        let probe = Command::new(&self.config.binary)
            .arg("--version")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let timeout = Duration::from_millis(self.config.probe_timeout_ms);
        match tokio::time::timeout(timeout, probe).await {
            Ok(Ok(output)) if output.status.success() => {
                let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
                info!(source = %NAME, version = %version, "Substreams CLI found");
                true
            }
            Ok(Ok(output)) => {
                warn!(source = %NAME, status = %output.status, "Substreams CLI probe failed");
                false
            }
            Ok(Err(e)) => {
                warn!(source = %NAME, error = %e, "Substreams CLI not found");
                false
            }
            Err(_) => {
                warn!(source = %NAME, timeout_ms = self.config.probe_timeout_ms, "Substreams CLI probe timed out");
                false
            }
        }
    }

    async fn launch(&self) -> Result<Box<dyn StreamSession>, SourceError> {
        let args = self.command_args();
        info!(
            source = %NAME,
            command = %format!("{} {}", self.config.binary, args.join(" ")),
            "Launching substreams"
        );

        let mut child = Command::new(&self.config.binary)
            .args(&args)
            .env(API_TOKEN_ENV, &self.config.api_token)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SourceError::Spawn {
                adapter: NAME,
                message: e.to_string(),
            })?;

        let stdout = child.stdout.take().ok_or_else(|| SourceError::Spawn {
            adapter: NAME,
            message: "stdout was not captured".to_string(),
        })?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(source = %NAME, stderr = %line, "Substreams stderr");
                }
            });
        }

        info!(source = %NAME, pid = ?child.id(), "✅ Substreams data ingestion started");

        Ok(Box::new(SubstreamsSession {
            child,
            records: Box::pin(Self::record_stream(stdout)),
        }))
    }
}

struct SubstreamsSession {
    child: Child,
    records: RecordStream,
}

#[async_trait]
impl StreamSession for SubstreamsSession {
    async fn consume(self: Box<Self>, sink: &IngestSink, mut shutdown: ShutdownListener) -> StreamExit {
        let SubstreamsSession {
            mut child,
            mut records,
        } = *self;
        let mut exit = StreamExit::default();

        loop {
            tokio::select! {
                _ = shutdown.wait() => {
                    info!(source = %NAME, "Shutdown requested, stopping substreams");
                    if let Err(e) = child.kill().await {
                        warn!(source = %NAME, error = %e, "Failed to kill substreams process");
                    }
                    exit.cancelled = true;
                    break;
                }
                record = records.next() => {
                    match record {
                        Some(LineOutcome::Observation(observation)) => {
                            let feed = observation.feed_key.clone();
                            match sink.record(observation).await {
                                Ok(_) => {
                                    debug!(source = %NAME, feed = %feed, "Received price update");
                                    exit.written += 1;
                                }
                                Err(e) => {
                                    error!(source = %NAME, feed = %feed, error = %e, "Failed to persist price update");
                                }
                            }
                        }
                        Some(LineOutcome::Ignored) => {}
                        Some(LineOutcome::Malformed(reason)) => {
                            warn!(source = %NAME, reason = %reason, "Skipping malformed line");
                            exit.skipped += 1;
                        }
                        None => break,
                    }
                }
            }
        }

        match child.wait().await {
            Ok(status) => exit.code = status.code(),
            Err(e) => warn!(source = %NAME, error = %e, "Failed to collect substreams exit status"),
        }

        info!(
            source = %NAME,
            code = ?exit.code,
            written = exit.written,
            skipped = exit.skipped,
            "Substreams process exited"
        );
        exit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn config() -> StreamingConfig {
        StreamingConfig {
            enabled: true,
            binary: "substreams".to_string(),
            endpoint: "evm-mainnet.sei.streamingfast.io:443".to_string(),
            api_token: "token".to_string(),
            manifest_path: "./substreams.yaml".to_string(),
            start_block: 0,
            module: "store_set_oracle_prices".to_string(),
            restart_delay_ms: 5000,
            probe_timeout_ms: 5000,
        }
    }

    #[test]
    fn command_args_omit_zero_start_block() {
        let args = SubstreamsSource::new(config()).command_args();
        assert_eq!(
            args,
            vec![
                "run",
                "--endpoint=evm-mainnet.sei.streamingfast.io:443",
                "--manifest=./substreams.yaml",
                "--output=jsonl",
                "store_set_oracle_prices",
            ]
        );
    }

    #[test]
    fn command_args_include_start_block() {
        let mut cfg = config();
        cfg.start_block = 1200;
        let args = SubstreamsSource::new(cfg).command_args();
        assert!(args.contains(&"--start-block=1200".to_string()));
    }

    #[test]
    fn parse_line_decodes_price_payload() {
        let line = r#"{"value":{"price_id":"e62df6c8b4a85fe1a67db44dc12de5db330f7ac66b72dc658afedf0f4a415b43","price":5000000000000,"conf":2500000,"expo":-8,"publish_time":1700000000}}"#;
        match SubstreamsSource::parse_line(line) {
            LineOutcome::Observation(o) => {
                assert_eq!(o.feed_key, "BTC/USD");
                assert_eq!(o.mantissa, dec!(5000000000000));
                assert_eq!(o.conf, dec!(2500000));
                assert_eq!(o.expo, -8);
                assert_eq!(o.publish_time.timestamp(), 1_700_000_000);
                assert_eq!(o.source, ObservationSource::Substreams);
                assert_eq!(o.decoded_price(), Some(dec!(50000)));
            }
            other => panic!("expected observation, got {:?}", other),
        }
    }

    #[test]
    fn parse_line_ignores_lines_without_payload() {
        assert_eq!(SubstreamsSource::parse_line(""), LineOutcome::Ignored);
        assert_eq!(
            SubstreamsSource::parse_line(r#"{"@module":"store_set_oracle_prices","@block":12}"#),
            LineOutcome::Ignored
        );
    }

    #[test]
    fn parse_line_flags_malformed_input() {
        assert!(matches!(
            SubstreamsSource::parse_line("{not json"),
            LineOutcome::Malformed(_)
        ));
        assert!(matches!(
            SubstreamsSource::parse_line(r#"{"value":{"price_id":"BTC/USD","expo":-8}}"#),
            LineOutcome::Malformed(_)
        ));
    }

    #[test]
    fn parse_line_uses_fetch_time_without_publish_time() {
        let before = Utc::now();
        match SubstreamsSource::parse_line(r#"{"value":{"price_id":"ETH/USD","price":"310000000000","expo":-8}}"#) {
            LineOutcome::Observation(o) => {
                assert_eq!(o.feed_key, "ETH/USD");
                assert!(o.publish_time >= before);
                assert_eq!(o.conf, Decimal::ZERO);
            }
            other => panic!("expected observation, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn record_stream_keeps_going_after_malformed_lines() {
        let input: &'static [u8] = b"{\"value\":{\"price_id\":\"BTC/USD\",\"price\":1,\"expo\":0,\"publish_time\":1}}\n\
garbage\n\
{\"value\":{\"price_id\":\"ETH/USD\",\"price\":2,\"expo\":0,\"publish_time\":2}}\n";

        let outcomes: Vec<LineOutcome> = SubstreamsSource::record_stream(input).collect().await;
        assert_eq!(outcomes.len(), 3);
        assert!(matches!(outcomes[0], LineOutcome::Observation(_)));
        assert!(matches!(outcomes[1], LineOutcome::Malformed(_)));
        assert!(matches!(outcomes[2], LineOutcome::Observation(_)));
    }

    #[tokio::test]
    async fn probe_without_token_is_false() {
        let mut cfg = config();
        cfg.api_token = String::new();
        assert!(!SubstreamsSource::new(cfg).probe().await);
    }

    #[tokio::test]
    async fn launch_of_missing_binary_is_spawn_error() {
        let mut cfg = config();
        cfg.binary = "/nonexistent/substreams-binary".to_string();
        let result = SubstreamsSource::new(cfg).launch().await;
        assert!(matches!(result, Err(SourceError::Spawn { .. })));
    }
}
