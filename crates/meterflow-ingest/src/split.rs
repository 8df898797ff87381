//! Partitioning oversized interval files into independently parseable chunks
//!
//! A file is cut along meter boundaries only. Every chunk repeats the source
//! header and ends with a `900` record, so it parses exactly like a small
//! upload. Chunks are written back to landing and re-enter the pipeline from
//! the stability check.

use futures::stream::{self, StreamExt, TryStreamExt};
use meterflow_common::types::ObjectLocation;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::detect::TextEncoding;
use crate::error::{IngestError, IngestResult};
use crate::parser::decode_text;
use crate::storage::{ObjectStore, Zone};

const END_OF_DATA: &str = "900";

/// Split thresholds and chunk bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitPolicy {
    pub size_threshold_bytes: u64,
    pub channel_threshold: usize,
    pub max_chunk_bytes: usize,
    pub max_meters_per_chunk: usize,
}

impl SplitPolicy {
    pub fn should_split(&self, size_bytes: u64, channels: usize) -> bool {
        size_bytes > self.size_threshold_bytes || channels > self.channel_threshold
    }
}

/// All records of one meter
///
/// A meter whose `200` records appear in several separate runs gets a single
/// block holding every run in source order, so no two chunks share a meter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeterBlock {
    pub meter_id: String,
    pub lines: Vec<String>,
    pub size_bytes: usize,
}

impl MeterBlock {
    fn push(&mut self, line: &str) {
        self.size_bytes += line.len() + 1;
        self.lines.push(line.to_string());
    }
}

/// Header records plus meter blocks in first-appearance order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionedFile {
    pub header: Vec<String>,
    pub blocks: Vec<MeterBlock>,
}

impl PartitionedFile {
    fn header_bytes(&self) -> usize {
        self.header.iter().map(|l| l.len() + 1).sum::<usize>() + END_OF_DATA.len() + 1
    }

    pub fn meter_ids(&self) -> impl Iterator<Item = &str> {
        self.blocks.iter().map(|b| b.meter_id.as_str())
    }
}

fn record_indicator(line: &str) -> &str {
    line.split(',').next().unwrap_or("").trim()
}

/// Partition decoded interval-file text along meter boundaries
///
/// Records of a meter that reappears later in the file join its first block.
pub fn partition(text: &str) -> IngestResult<PartitionedFile> {
    let mut header = Vec::new();
    let mut blocks: Vec<MeterBlock> = Vec::new();
    let mut by_meter: HashMap<String, usize> = HashMap::new();
    let mut current: Option<usize> = None;

    for (number, line) in text.lines().enumerate() {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }

        match record_indicator(line) {
            END_OF_DATA => current = None,
            "200" => {
                let meter_id = line.split(',').nth(1).unwrap_or("").trim().to_string();
                if meter_id.is_empty() {
                    return Err(IngestError::Validation(format!(
                        "line {}: 200 record without NMI",
                        number + 1
                    )));
                }
                let index = *by_meter.entry(meter_id.clone()).or_insert_with(|| {
                    blocks.push(MeterBlock {
                        meter_id,
                        lines: Vec::new(),
                        size_bytes: 0,
                    });
                    blocks.len() - 1
                });
                blocks[index].push(line);
                current = Some(index);
            }
            _ => match current {
                Some(index) => blocks[index].push(line),
                None if blocks.is_empty() => header.push(line.to_string()),
                None => {
                    return Err(IngestError::Validation(format!(
                        "line {}: record outside a meter block",
                        number + 1
                    )))
                }
            },
        }
    }

    if blocks.is_empty() {
        return Err(IngestError::Validation("no 200 records to split on".to_string()));
    }

    Ok(PartitionedFile { header, blocks })
}

/// Indices of the blocks one chunk carries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPlan {
    pub blocks: Vec<usize>,
    pub size_bytes: usize,
    /// A single block that alone exceeds the size bound
    pub oversized: bool,
}

/// Greedy packing in block order
///
/// A block larger than `max_chunk_bytes` becomes its own oversized chunk; it is
/// never cut mid-meter.
pub fn pack(file: &PartitionedFile, policy: &SplitPolicy) -> Vec<ChunkPlan> {
    let base = file.header_bytes();
    let mut plans = Vec::new();
    let mut current = ChunkPlan {
        blocks: Vec::new(),
        size_bytes: base,
        oversized: false,
    };

    for (index, block) in file.blocks.iter().enumerate() {
        let too_big = current.size_bytes + block.size_bytes > policy.max_chunk_bytes;
        let too_many = current.blocks.len() >= policy.max_meters_per_chunk;
        if !current.blocks.is_empty() && (too_big || too_many) {
            plans.push(std::mem::replace(
                &mut current,
                ChunkPlan {
                    blocks: Vec::new(),
                    size_bytes: base,
                    oversized: false,
                },
            ));
        }
        current.blocks.push(index);
        current.size_bytes += block.size_bytes;
    }
    plans.push(current);

    for plan in &mut plans {
        plan.oversized = plan.blocks.len() == 1 && plan.size_bytes > policy.max_chunk_bytes;
    }
    plans
}

/// Render a chunk: shared header, its blocks, terminator
pub fn render(file: &PartitionedFile, plan: &ChunkPlan) -> String {
    let mut out = String::with_capacity(plan.size_bytes);
    for line in &file.header {
        out.push_str(line);
        out.push('\n');
    }
    for &index in &plan.blocks {
        for line in &file.blocks[index].lines {
            out.push_str(line);
            out.push('\n');
        }
    }
    out.push_str(END_OF_DATA);
    out.push('\n');
    out
}

/// Landing key of chunk `sequence` of `key`
pub fn chunk_key(key: &str, sequence: usize) -> String {
    let name = meterflow_common::types::file_name(key);
    let (stem, ext) = match name.rfind('.') {
        Some(dot) if dot > 0 => name.split_at(dot),
        _ => (name, ""),
    };
    format!("{}{}_chunk_{:03}{}", Zone::Landing.prefix(), stem, sequence, ext)
}

/// A chunk written back to landing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfo {
    pub sequence: usize,
    pub location: ObjectLocation,
    pub meter_ids: Vec<String>,
    pub size_bytes: usize,
    pub oversized: bool,
    /// Entity tag reported by the store for the written chunk
    pub etag: Option<String>,
}

/// Result of a split attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SplitOutcome {
    Chunks(Vec<ChunkInfo>),
    /// Everything fits one chunk; process the file as is
    Unsplittable,
}

pub struct FileSplitter {
    store: Arc<dyn ObjectStore>,
    policy: SplitPolicy,
    concurrency: usize,
}

impl FileSplitter {
    pub fn new(store: Arc<dyn ObjectStore>, policy: SplitPolicy, concurrency: usize) -> Self {
        Self {
            store,
            policy,
            concurrency: concurrency.max(1),
        }
    }

    /// Partition `bytes` and write the chunks next to the source in landing
    ///
    /// Chunks are always UTF-8, whatever the source encoding was.
    #[instrument(skip(self, bytes), fields(source = %location, size = bytes.len()))]
    pub async fn split(
        &self,
        location: &ObjectLocation,
        bytes: &[u8],
        encoding: TextEncoding,
    ) -> IngestResult<SplitOutcome> {
        let text = decode_text(bytes, encoding)?;
        let file = partition(&text)?;
        drop(text);

        let plans = pack(&file, &self.policy);
        if plans.len() < 2 {
            return Ok(SplitOutcome::Unsplittable);
        }

        let writes = plans.iter().enumerate().map(|(i, plan)| {
            let sequence = i + 1;
            let key = chunk_key(&location.key, sequence);
            let body = render(&file, plan);
            let mut info = ChunkInfo {
                sequence,
                location: location.with_key(key.clone()),
                meter_ids: plan
                    .blocks
                    .iter()
                    .map(|&b| file.blocks[b].meter_id.clone())
                    .collect(),
                size_bytes: body.len(),
                oversized: plan.oversized,
                etag: None,
            };
            let store = Arc::clone(&self.store);
            async move {
                if info.oversized {
                    warn!(
                        chunk = %info.location,
                        size = info.size_bytes,
                        "Meter block exceeds the chunk size limit; emitted as a single oversized chunk"
                    );
                }
                let written = store.put(&key, body.into_bytes(), Some("text/csv")).await?;
                info.etag = written.etag;
                Ok::<_, IngestError>(info)
            }
        });

        let mut chunks: Vec<ChunkInfo> = stream::iter(writes)
            .buffer_unordered(self.concurrency)
            .try_collect()
            .await?;
        chunks.sort_by_key(|c| c.sequence);

        info!(
            chunks = chunks.len(),
            meters = file.blocks.len(),
            "Split {} into {} chunks",
            location,
            chunks.len()
        );
        Ok(SplitOutcome::Chunks(chunks))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::storage::MemoryObjectStore;

    fn policy(max_chunk_bytes: usize, max_meters: usize) -> SplitPolicy {
        SplitPolicy {
            size_threshold_bytes: 0,
            channel_threshold: 0,
            max_chunk_bytes,
            max_meters_per_chunk: max_meters,
        }
    }

    const FILE: &str = "100,NEM12,202601010000,MDA1,RET\n\
200,NMI1,E1,1,E1,N1,M1,kWh,30,\n300,20260101,1,A\n\
200,NMI2,E1,1,E1,N1,M2,kWh,30,\n300,20260101,2,A\n400,1,1,F,,\n\
200,NMI1,B1,2,B1,N2,M1,kWh,30,\n300,20260101,3,A\n\
900\n";

    #[test]
    fn test_partition_merges_meter_records() {
        let file = partition(FILE).unwrap();
        assert_eq!(file.header, vec!["100,NEM12,202601010000,MDA1,RET"]);
        assert_eq!(file.meter_ids().collect::<Vec<_>>(), vec!["NMI1", "NMI2"]);
        assert_eq!(
            file.blocks[0].lines,
            vec![
                "200,NMI1,E1,1,E1,N1,M1,kWh,30,",
                "300,20260101,1,A",
                "200,NMI1,B1,2,B1,N2,M1,kWh,30,",
                "300,20260101,3,A",
            ]
        );
        assert_eq!(file.blocks[1].lines.len(), 3);
        assert_eq!(
            file.blocks[0].size_bytes,
            file.blocks[0].lines.iter().map(|l| l.len() + 1).sum::<usize>()
        );
    }

    #[test]
    fn test_partition_without_meters_is_invalid() {
        assert!(matches!(
            partition("100,NEM12\n900\n"),
            Err(IngestError::Validation(_))
        ));
    }

    #[test]
    fn test_pack_respects_meter_limit() {
        let file = partition(FILE).unwrap();
        let plans = pack(&file, &policy(usize::MAX, 1));
        assert_eq!(plans.len(), 2);
        assert!(plans.iter().all(|p| !p.oversized));
    }

    #[test]
    fn test_oversized_block_stays_whole() {
        let file = partition(FILE).unwrap();
        let plans = pack(&file, &policy(10, 50));
        assert_eq!(plans.len(), 2);
        assert!(plans.iter().all(|p| p.oversized && p.blocks.len() == 1));
    }

    #[test]
    fn test_render_is_well_formed() {
        let file = partition(FILE).unwrap();
        let plans = pack(&file, &policy(usize::MAX, 1));
        let chunk = render(&file, &plans[1]);
        assert!(chunk.starts_with("100,NEM12"));
        assert!(chunk.ends_with("900\n"));
        assert!(chunk.contains("200,NMI2"));
        assert!(!chunk.contains("NMI1"));
    }

    #[test]
    fn test_chunk_key() {
        assert_eq!(chunk_key("landing/big file.csv", 3), "landing/big file_chunk_003.csv");
        assert_eq!(chunk_key("landing/noext", 12), "landing/noext_chunk_012");
    }

    #[test]
    fn test_should_split() {
        let policy = SplitPolicy {
            size_threshold_bytes: 100,
            channel_threshold: 10,
            max_chunk_bytes: 50,
            max_meters_per_chunk: 5,
        };
        assert!(!policy.should_split(100, 10));
        assert!(policy.should_split(101, 1));
        assert!(policy.should_split(1, 11));
    }

    #[tokio::test]
    async fn test_split_writes_chunks() {
        let store = Arc::new(MemoryObjectStore::new("ingest"));
        let splitter = FileSplitter::new(store.clone(), policy(usize::MAX, 1), 4);
        let location = ObjectLocation::new("ingest", "landing/big.csv");

        let outcome = splitter
            .split(&location, FILE.as_bytes(), TextEncoding::Utf8)
            .await
            .unwrap();
        let SplitOutcome::Chunks(chunks) = outcome else {
            panic!("expected chunks");
        };
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].meter_ids, vec!["NMI1"]);
        assert!(store.contains("landing/big_chunk_001.csv"));
        assert!(store.contains("landing/big_chunk_002.csv"));
    }

    #[tokio::test]
    async fn test_single_chunk_is_unsplittable() {
        let store = Arc::new(MemoryObjectStore::new("ingest"));
        let splitter = FileSplitter::new(store.clone(), policy(usize::MAX, 50), 4);
        let location = ObjectLocation::new("ingest", "landing/small.csv");
        let outcome = splitter
            .split(&location, FILE.as_bytes(), TextEncoding::Utf8)
            .await
            .unwrap();
        assert_eq!(outcome, SplitOutcome::Unsplittable);
        assert!(store.keys().is_empty());
    }
}
