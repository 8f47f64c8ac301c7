// Reporter module - history rendering, summary and JSON export
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::client::SystemInfo;
use crate::store::VoipTestRecord;

/// 履歴の集計
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistorySummary {
    pub count: usize,
    pub avg_latency_ms: f64,
    pub avg_jitter_ms: f64,
    pub avg_packet_loss_pct: f64,
    pub avg_quality_score: f64,
    pub connectivity_ratio: f64,
}

/// JSONエクスポートのルート
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryExport {
    pub exported_at: DateTime<Utc>,
    pub summary: HistorySummary,
    pub records: Vec<VoipTestRecord>,
}

/// 履歴1件を1行で表示する
pub fn format_history_line(record: &VoipTestRecord) -> String {
    let r = &record.test_results;
    format!(
        "{} - {}  {}  {}  latency={}ms jitter={}ms loss={}% quality={} connectivity={}",
        record.extension,
        record.sip_server,
        record.created_at.format("%Y-%m-%d %H:%M"),
        record.status,
        r.latency,
        r.jitter,
        r.packet_loss,
        r.quality_score,
        if r.connectivity { "ok" } else { "fail" },
    )
}

pub fn format_system_info(info: &SystemInfo) -> String {
    let last_check = info
        .last_check
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "never".to_string());
    format!(
        "version={} status={} last_check={}",
        info.version, info.status, last_check
    )
}

fn mean(values: impl Iterator<Item = u32>, count: usize) -> f64 {
    if count == 0 {
        return 0.0;
    }
    values.map(f64::from).sum::<f64>() / count as f64
}

/// 履歴を集計する。空の場合はすべて 0。
pub fn summarize(records: &[VoipTestRecord]) -> HistorySummary {
    let count = records.len();
    let connected = records.iter().filter(|r| r.test_results.connectivity).count();

    HistorySummary {
        count,
        avg_latency_ms: mean(records.iter().map(|r| r.test_results.latency), count),
        avg_jitter_ms: mean(records.iter().map(|r| r.test_results.jitter), count),
        avg_packet_loss_pct: mean(records.iter().map(|r| r.test_results.packet_loss), count),
        avg_quality_score: mean(records.iter().map(|r| r.test_results.quality_score), count),
        connectivity_ratio: if count == 0 {
            0.0
        } else {
            connected as f64 / count as f64
        },
    }
}

/// 履歴をJSONファイルに書き出す
pub fn write_json_history(records: &[VoipTestRecord], path: &Path) -> anyhow::Result<()> {
    let export = HistoryExport {
        exported_at: Utc::now(),
        summary: summarize(records),
        records: records.to_vec(),
    };
    let json = serde_json::to_string_pretty(&export)?;
    std::fs::write(path, json)?;
    Ok(())
}
