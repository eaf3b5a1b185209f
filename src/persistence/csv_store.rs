//! CSV-backed price store
//!
//! Raw observations and snapshots are appended to `prices_raw.csv` and
//! `prices_5m.csv` and flushed per row. Tokens are small and mutable, so
//! `tokens.csv` is rewritten on every upsert. The "latest" indexes are kept
//! in memory and rebuilt from the files on open.

use async_trait::async_trait;
use chrono::Utc;
use csv::{ReaderBuilder, WriterBuilder};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock as AsyncRwLock;
use tracing::{debug, info, warn};

use super::{PriceStore, StoreError};
use crate::types::{
    NewObservation, NewToken, PriceObservation, PriceSnapshot, SnapshotSource, Token,
};

const RAW_FILE: &str = "prices_raw.csv";
const SNAPSHOT_FILE: &str = "prices_5m.csv";
const TOKEN_FILE: &str = "tokens.csv";

/// Append-only CSV file. Rows are encoded in memory and written in one
/// call, so a failed append never leaves bytes queued for the next one.
struct AppendLog {
    path: PathBuf,
    file: File,
    has_data: bool,
}

impl AppendLog {
    fn open(path: &Path) -> Result<Self, StoreError> {
        let has_data = path.exists() && fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false);

        let mut file = OpenOptions::new().create(true).append(true).open(path)?;

        // Terminate a torn trailing row so the next append starts a fresh record
        if has_data && !ends_with_newline(path)? {
            file.write_all(b"\n")?;
        }

        Ok(Self {
            path: path.to_path_buf(),
            file,
            has_data,
        })
    }

    fn append<T: Serialize>(&mut self, row: &T) -> Result<(), StoreError> {
        let bytes = encode_row(row, !self.has_data)?;
        if let Err(e) = write_row(&mut self.file, &bytes) {
            // A prefix may have reached the file; reopening terminates it
            match Self::open(&self.path) {
                Ok(fresh) => *self = fresh,
                Err(reopen) => {
                    warn!(file = %self.path.display(), error = %reopen, "Failed to reopen CSV after write error")
                }
            }
            return Err(e);
        }
        self.has_data = true;
        Ok(())
    }
}

/// One CSV record, with the header line first when `headers` is set
fn encode_row<T: Serialize>(row: &T, headers: bool) -> Result<Vec<u8>, StoreError> {
    let mut writer = WriterBuilder::new()
        .has_headers(headers)
        .from_writer(Vec::new());
    writer.serialize(row)?;
    writer
        .into_inner()
        .map_err(|e| StoreError::Io(e.into_error()))
}

fn write_row<W: Write>(out: &mut W, bytes: &[u8]) -> Result<(), StoreError> {
    out.write_all(bytes)?;
    out.flush()?;
    Ok(())
}

fn ends_with_newline(path: &Path) -> Result<bool, StoreError> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

struct StoreState {
    raw_log: AppendLog,
    snapshot_log: AppendLog,
    next_observation_id: u64,
    next_snapshot_id: u64,
    next_token_id: u64,
    latest_by_feed: BTreeMap<String, PriceObservation>,
    latest_by_token: HashMap<u64, PriceSnapshot>,
    tokens: BTreeMap<u64, Token>,
}

/// CSV persistence for the ingestion pipeline
pub struct CsvPriceStore {
    data_dir: PathBuf,
    state: AsyncRwLock<StoreState>,
}

impl CsvPriceStore {
    /// Open (or create) a store rooted at `data_dir`
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let data_dir = data_dir.as_ref().to_path_buf();
        fs::create_dir_all(&data_dir)?;

        let observations: Vec<PriceObservation> = Self::load_rows(&data_dir.join(RAW_FILE))?;
        let snapshots: Vec<PriceSnapshot> = Self::load_rows(&data_dir.join(SNAPSHOT_FILE))?;
        let tokens: Vec<Token> = Self::load_rows(&data_dir.join(TOKEN_FILE))?;

        let next_observation_id = observations.iter().map(|o| o.id).max().unwrap_or(0) + 1;
        let next_snapshot_id = snapshots.iter().map(|s| s.id).max().unwrap_or(0) + 1;
        let next_token_id = tokens.iter().map(|t| t.id).max().unwrap_or(0) + 1;

        let mut latest_by_feed = BTreeMap::new();
        let observation_count = observations.len();
        for observation in observations {
            Self::index_observation(&mut latest_by_feed, observation);
        }

        let mut latest_by_token = HashMap::new();
        for snapshot in snapshots {
            Self::index_snapshot(&mut latest_by_token, snapshot);
        }

        let tokens: BTreeMap<u64, Token> = tokens.into_iter().map(|t| (t.id, t)).collect();

        info!(
            data_dir = %data_dir.display(),
            observations = observation_count,
            feeds = latest_by_feed.len(),
            tokens = tokens.len(),
            "Price store opened"
        );

        let state = StoreState {
            raw_log: AppendLog::open(&data_dir.join(RAW_FILE))?,
            snapshot_log: AppendLog::open(&data_dir.join(SNAPSHOT_FILE))?,
            next_observation_id,
            next_snapshot_id,
            next_token_id,
            latest_by_feed,
            latest_by_token,
            tokens,
        };

        Ok(Self {
            data_dir,
            state: AsyncRwLock::new(state),
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Full snapshot series for a token, oldest first
    pub fn load_snapshot_history(&self, token_id: u64) -> Result<Vec<PriceSnapshot>, StoreError> {
        let mut rows: Vec<PriceSnapshot> = Self::load_rows(&self.data_dir.join(SNAPSHOT_FILE))?;
        rows.retain(|s| s.token_id == token_id);
        rows.sort_by_key(|s| (s.timestamp, s.id));
        Ok(rows)
    }

    /// Every raw observation for a feed in insertion order
    pub fn load_feed_history(&self, feed_key: &str) -> Result<Vec<PriceObservation>, StoreError> {
        let mut rows: Vec<PriceObservation> = Self::load_rows(&self.data_dir.join(RAW_FILE))?;
        rows.retain(|o| o.feed_key == feed_key);
        Ok(rows)
    }

    fn load_rows<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, StoreError> {
        if !path.exists() {
            return Ok(Vec::new());
        }

        let mut reader = ReaderBuilder::new().has_headers(true).from_path(path)?;
        let mut rows = Vec::new();
        for (line, result) in reader.deserialize().enumerate() {
            match result {
                Ok(row) => rows.push(row),
                Err(e) => {
                    // A torn trailing row after a crash should not block startup
                    warn!(file = %path.display(), line = line + 2, error = %e, "Skipping unreadable row");
                }
            }
        }
        Ok(rows)
    }

    fn index_observation(
        latest: &mut BTreeMap<String, PriceObservation>,
        observation: PriceObservation,
    ) {
        match latest.get(&observation.feed_key) {
            Some(current) if current.publish_time >= observation.publish_time => {}
            _ => {
                latest.insert(observation.feed_key.clone(), observation);
            }
        }
    }

    fn index_snapshot(latest: &mut HashMap<u64, PriceSnapshot>, snapshot: PriceSnapshot) {
        match latest.get(&snapshot.token_id) {
            Some(current) if current.timestamp > snapshot.timestamp => {}
            _ => {
                latest.insert(snapshot.token_id, snapshot);
            }
        }
    }

    fn write_tokens(&self, tokens: &BTreeMap<u64, Token>) -> Result<(), StoreError> {
        let path = self.data_dir.join(TOKEN_FILE);
        let tmp = self.data_dir.join(format!("{}.tmp", TOKEN_FILE));

        {
            let mut writer = WriterBuilder::new().has_headers(true).from_path(&tmp)?;
            for token in tokens.values() {
                writer.serialize(token)?;
            }
            writer.flush()?;
        }

        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

#[async_trait]
impl PriceStore for CsvPriceStore {
    async fn insert_observation(
        &self,
        observation: NewObservation,
    ) -> Result<PriceObservation, StoreError> {
        let mut state = self.state.write().await;

        // The id is spent even if the append fails, so a torn row that
        // survives on disk can never share an id with a later one
        let id = state.next_observation_id;
        state.next_observation_id += 1;

        let row = PriceObservation {
            id,
            feed_key: observation.feed_key,
            mantissa: observation.mantissa,
            conf: observation.conf,
            expo: observation.expo,
            publish_time: observation.publish_time,
            created_at: Utc::now(),
            source: observation.source,
        };

        state.raw_log.append(&row)?;
        Self::index_observation(&mut state.latest_by_feed, row.clone());

        debug!(feed = %row.feed_key, id = row.id, source = %row.source, "Observation stored");
        Ok(row)
    }

    async fn latest_per_feed(&self) -> Result<Vec<PriceObservation>, StoreError> {
        let state = self.state.read().await;
        Ok(state.latest_by_feed.values().cloned().collect())
    }

    async fn latest_for_feed(
        &self,
        feed_key: &str,
    ) -> Result<Option<PriceObservation>, StoreError> {
        let state = self.state.read().await;
        Ok(state.latest_by_feed.get(feed_key).cloned())
    }

    async fn insert_snapshot(
        &self,
        token_id: u64,
        price: Decimal,
        source: SnapshotSource,
    ) -> Result<PriceSnapshot, StoreError> {
        let mut state = self.state.write().await;

        if !state.tokens.contains_key(&token_id) {
            return Err(StoreError::UnknownToken(token_id));
        }

        let id = state.next_snapshot_id;
        state.next_snapshot_id += 1;

        let row = PriceSnapshot {
            id,
            token_id,
            price,
            source,
            timestamp: Utc::now(),
        };

        state.snapshot_log.append(&row)?;
        Self::index_snapshot(&mut state.latest_by_token, row.clone());
        Ok(row)
    }

    async fn latest_snapshot(&self, token_id: u64) -> Result<Option<PriceSnapshot>, StoreError> {
        let state = self.state.read().await;
        Ok(state.latest_by_token.get(&token_id).cloned())
    }

    async fn tokens(&self) -> Result<Vec<Token>, StoreError> {
        let state = self.state.read().await;
        Ok(state.tokens.values().cloned().collect())
    }

    async fn upsert_token(&self, token: NewToken) -> Result<Token, StoreError> {
        let mut state = self.state.write().await;
        let now = Utc::now();

        let existing_id = state
            .tokens
            .values()
            .find(|t| t.contract_address.eq_ignore_ascii_case(&token.contract_address))
            .map(|t| t.id);

        let mut tokens = state.tokens.clone();
        let row = match existing_id.and_then(|id| tokens.get_mut(&id)) {
            Some(current) => {
                current.name = token.name;
                current.symbol = token.symbol;
                current.decimals = token.decimals;
                current.logo = token.logo;
                current.updated_at = now;
                current.clone()
            }
            None => {
                let row = Token {
                    id: state.next_token_id,
                    name: token.name,
                    symbol: token.symbol,
                    decimals: token.decimals,
                    logo: token.logo,
                    contract_address: token.contract_address,
                    created_at: now,
                    updated_at: now,
                };
                tokens.insert(row.id, row.clone());
                row
            }
        };

        // Only commit in memory once the file is replaced
        self.write_tokens(&tokens)?;
        if existing_id.is_none() {
            state.next_token_id += 1;
        }
        state.tokens = tokens;

        Ok(row)
    }
}
