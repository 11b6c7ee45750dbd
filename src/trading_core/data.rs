//! Loading session inputs from disk
//!
//! - Scanner output: JSON object of symbol -> pivot level
//! - Bars: `.json` (object of symbol -> bars) or `.csv` rows, either one
//!   optionally zstd-compressed (`.json.zst`, `.csv.zst`)
//! - Ticks: CSV rows `symbol,timestamp,price,volume`, plain or `.zst`

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use tracing::{info, warn};

use super::bars::Bar;
use super::pipeline::MarketEvent;
use crate::types::{PivotLevel, Tick};

fn is_zst(name: &str) -> bool {
    name.ends_with(".zst")
}

fn decode(name: &str, raw: Vec<u8>) -> Result<Vec<u8>> {
    if is_zst(name) {
        zstd::decode_all(&raw[..]).with_context(|| format!("Failed to decompress {}", name))
    } else {
        Ok(raw)
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    let raw = std::fs::read(path).with_context(|| format!("Failed to read {:?}", path))?;
    decode(&path.to_string_lossy(), raw)
}

/// Accepts RFC 3339 or integer epoch milliseconds
fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(millis) = raw.parse::<i64>() {
        return DateTime::from_timestamp_millis(millis)
            .with_context(|| format!("Timestamp out of range: {}", raw));
    }
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("Failed to parse timestamp: {}", raw))?
        .with_timezone(&Utc))
}

/// Load the pre-market scanner output
pub fn load_scanner(path: &Path) -> Result<BTreeMap<String, PivotLevel>> {
    let bytes = read_file(path)?;
    let levels: BTreeMap<String, PivotLevel> =
        serde_json::from_slice(&bytes).with_context(|| format!("Invalid scanner file {:?}", path))?;
    info!("Loaded pivot levels for {} symbols", levels.len());
    Ok(levels)
}

#[derive(Debug, Deserialize)]
struct BarRow {
    symbol: String,
    start_time: String,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: u64,
    buy_volume: Option<u64>,
    sell_volume: Option<u64>,
}

fn parse_bar_csv<R: Read>(reader: R) -> Result<BTreeMap<String, Vec<Bar>>> {
    let mut csv_reader = csv::Reader::from_reader(reader);
    let mut bars: BTreeMap<String, Vec<Bar>> = BTreeMap::new();
    for result in csv_reader.deserialize() {
        let row: BarRow = result.with_context(|| "Failed to parse bar CSV row")?;
        let bar = Bar {
            index: 0,
            start_time: parse_timestamp(&row.start_time)?,
            open: row.open,
            high: row.high,
            low: row.low,
            close: row.close,
            volume: row.volume,
            buy_volume: row.buy_volume.unwrap_or(0),
            sell_volume: row.sell_volume.unwrap_or(0),
        };
        bars.entry(row.symbol).or_default().push(bar);
    }
    Ok(bars)
}

/// Bars that traded volume but carry no buy/sell split
fn unsplit_bars(bars: &BTreeMap<String, Vec<Bar>>) -> usize {
    bars.values()
        .flatten()
        .filter(|b| b.volume > 0 && b.buy_volume + b.sell_volume == 0)
        .count()
}

fn parse_bar_map(name: &str, bytes: &[u8]) -> Result<BTreeMap<String, Vec<Bar>>> {
    let plain = name.strip_suffix(".zst").unwrap_or(name);
    let bars = if plain.ends_with(".csv") {
        parse_bar_csv(bytes)?
    } else {
        serde_json::from_slice(bytes).with_context(|| format!("Invalid bar file {}", name))?
    };
    let unsplit = unsplit_bars(&bars);
    if unsplit > 0 {
        warn!(
            "{}: {} bars have no buy/sell volume, CVD and order-flow read them as neutral",
            name, unsplit
        );
    }
    Ok(bars)
}

/// Load historical bars keyed by symbol
pub fn load_bars(path: &Path) -> Result<BTreeMap<String, Vec<Bar>>> {
    let name = path.to_string_lossy().to_string();
    let bytes = read_file(path)?;
    let bars = parse_bar_map(&name, &bytes)?;
    let total: usize = bars.values().map(|b| b.len()).sum();
    info!("Loaded {} bars for {} symbols from {:?}", total, bars.len(), path);
    Ok(bars)
}

#[derive(Debug, Deserialize)]
struct TickRow {
    symbol: String,
    timestamp: String,
    price: f64,
    volume: u64,
}

/// Stream tick rows as market events, in file order
pub fn tick_events<R: Read>(reader: R) -> impl Iterator<Item = Result<MarketEvent>> {
    csv::Reader::from_reader(reader)
        .into_deserialize::<TickRow>()
        .map(|result| {
            let row = result.with_context(|| "Failed to parse tick CSV row")?;
            let timestamp = parse_timestamp(&row.timestamp)?;
            Ok(MarketEvent::Tick {
                symbol: row.symbol,
                tick: Tick::new(timestamp, row.price, row.volume),
            })
        })
}

/// Open a tick source: a file path (optionally `.zst`) or `-` for stdin
pub fn open_ticks(path: &Path) -> Result<Box<dyn Read + Send>> {
    if path.as_os_str() == "-" {
        return Ok(Box::new(std::io::stdin()));
    }
    let file = File::open(path).with_context(|| format!("Failed to open file: {:?}", path))?;
    if is_zst(&path.to_string_lossy()) {
        let decoder = zstd::stream::Decoder::new(file)
            .with_context(|| format!("Failed to create zstd decoder for: {:?}", path))?;
        Ok(Box::new(BufReader::new(decoder)))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bar_csv_groups_by_symbol() {
        let csv = "symbol,start_time,open,high,low,close,volume,buy_volume,sell_volume\n\
                   AAA,2023-11-14T22:13:00Z,100,101,99,100.5,1000,600,400\n\
                   BBB,1699999985000,50,50.5,49.5,50.2,500,,\n\
                   AAA,2023-11-14T22:13:05Z,100.5,101,100,100.8,800,300,500\n";
        let bars = parse_bar_map("bars.csv", csv.as_bytes()).unwrap();
        assert_eq!(bars["AAA"].len(), 2);
        assert_eq!(bars["AAA"][1].sell_volume, 500);
        assert_eq!(bars["BBB"][0].buy_volume, 0);
        assert_eq!(bars["BBB"][0].start_time.timestamp(), 1_699_999_985);
        assert_eq!(unsplit_bars(&bars), 1);
    }

    #[test]
    fn test_compressed_json_bars() {
        let json = r#"{"AAA": [{"start_time": "2023-11-14T22:13:00Z", "open": 1.0, "high": 1.0,
                       "low": 1.0, "close": 1.0, "volume": 5}]}"#;
        let compressed = zstd::encode_all(json.as_bytes(), 3).unwrap();
        let raw = decode("bars.json.zst", compressed).unwrap();
        let bars = parse_bar_map("bars.json.zst", &raw).unwrap();
        assert_eq!(bars["AAA"][0].volume, 5);
        assert_eq!(bars["AAA"][0].index, 0);
    }

    #[test]
    fn test_tick_rows_report_bad_lines() {
        let csv = "symbol,timestamp,price,volume\n\
                   AAA,2023-11-14T22:13:00.250Z,100.25,10\n\
                   AAA,not-a-time,100.30,5\n";
        let rows: Vec<Result<MarketEvent>> = tick_events(csv.as_bytes()).collect();
        assert_eq!(rows.len(), 2);
        match &rows[0] {
            Ok(MarketEvent::Tick { symbol, tick }) => {
                assert_eq!(symbol, "AAA");
                assert_eq!(tick.volume, 10);
                assert_eq!(tick.timestamp.timestamp_subsec_millis(), 250);
            }
            other => panic!("unexpected row {:?}", other),
        }
        assert!(rows[1].is_err());
    }

    #[test]
    fn test_scanner_json_shape() {
        let json = r#"{"AAA": {"resistance": 100.0, "support": 95.0, "targets": [102.0, 104.0], "score": 7.5},
                       "BBB": {"support": 40.0, "downside_targets": [38.0]}}"#;
        let levels: BTreeMap<String, PivotLevel> = serde_json::from_str(json).unwrap();
        assert_eq!(levels["AAA"].targets, vec![102.0, 104.0]);
        assert_eq!(levels["BBB"].resistance, None);
    }
}
