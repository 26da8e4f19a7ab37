use std::path::Path;
use std::sync::Arc;

use arrow::array::{ArrayRef, Float64Array, StringArray, UInt32Array, UInt64Array};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use parquet::file::properties::WriterProperties;

use crate::epoch::EpochReport;
use crate::error::{Error, Result};

/// One epoch of one run, tagged with the run configuration.
pub struct BenchRow {
    pub workload: String,
    pub mode: String,
    pub epoch: u32,
    pub node_count: u32,
    pub threads: u32,
    pub coros: u32,
    pub requests: u64,
    pub elapsed_us: u64,
    pub node_mops: f64,
    pub cluster_mops: f64,
    pub cache_hit_rate: f64,
    pub lock_fail_rate: f64,
    pub read_retry_rate: f64,
}

pub struct RunInfo<'a> {
    pub workload: &'a str,
    pub mode: &'a str,
    pub node_count: u32,
    pub threads: u32,
    pub coros: u32,
}

pub fn rows_from_reports(info: &RunInfo<'_>, reports: &[EpochReport]) -> Vec<BenchRow> {
    reports
        .iter()
        .map(|r| BenchRow {
            workload: info.workload.to_string(),
            mode: info.mode.to_string(),
            epoch: r.epoch,
            node_count: info.node_count,
            threads: info.threads,
            coros: info.coros,
            requests: r.requests,
            elapsed_us: r.elapsed_us,
            node_mops: r.node_mops,
            cluster_mops: r.cluster_mops,
            cache_hit_rate: r.cache_hit_rate,
            lock_fail_rate: r.lock_fail_rate,
            read_retry_rate: r.read_retry_rate,
        })
        .collect()
}

fn report_error(path: &Path, source: impl std::error::Error + Send + Sync + 'static) -> Error {
    Error::ReportWrite {
        path: path.to_path_buf(),
        source: Box::new(source),
    }
}

pub fn write_parquet(path: &Path, rows: &[BenchRow]) -> Result<()> {
    if rows.is_empty() {
        return Ok(());
    }

    let schema = Arc::new(Schema::new(vec![
        Field::new("workload", DataType::Utf8, false),
        Field::new("mode", DataType::Utf8, false),
        Field::new("epoch", DataType::UInt32, false),
        Field::new("node_count", DataType::UInt32, false),
        Field::new("threads", DataType::UInt32, false),
        Field::new("coros", DataType::UInt32, false),
        Field::new("requests", DataType::UInt64, false),
        Field::new("elapsed_us", DataType::UInt64, false),
        Field::new("node_mops", DataType::Float64, false),
        Field::new("cluster_mops", DataType::Float64, false),
        Field::new("cache_hit_rate", DataType::Float64, false),
        Field::new("lock_fail_rate", DataType::Float64, false),
        Field::new("read_retry_rate", DataType::Float64, false),
    ]));

    let u32_col = |f: fn(&BenchRow) -> u32| -> ArrayRef {
        Arc::new(UInt32Array::from(rows.iter().map(f).collect::<Vec<_>>()))
    };
    let u64_col = |f: fn(&BenchRow) -> u64| -> ArrayRef {
        Arc::new(UInt64Array::from(rows.iter().map(f).collect::<Vec<_>>()))
    };
    let f64_col = |f: fn(&BenchRow) -> f64| -> ArrayRef {
        Arc::new(Float64Array::from(rows.iter().map(f).collect::<Vec<_>>()))
    };

    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(StringArray::from(
                rows.iter().map(|r| r.workload.as_str()).collect::<Vec<_>>(),
            )) as ArrayRef,
            Arc::new(StringArray::from(
                rows.iter().map(|r| r.mode.as_str()).collect::<Vec<_>>(),
            )) as ArrayRef,
            u32_col(|r| r.epoch),
            u32_col(|r| r.node_count),
            u32_col(|r| r.threads),
            u32_col(|r| r.coros),
            u64_col(|r| r.requests),
            u64_col(|r| r.elapsed_us),
            f64_col(|r| r.node_mops),
            f64_col(|r| r.cluster_mops),
            f64_col(|r| r.cache_hit_rate),
            f64_col(|r| r.lock_fail_rate),
            f64_col(|r| r.read_retry_rate),
        ],
    )
    .map_err(|e| report_error(path, e))?;

    let file = std::fs::File::create(path).map_err(|e| report_error(path, e))?;
    let props = WriterProperties::builder().build();
    let mut writer =
        ArrowWriter::try_new(file, schema, Some(props)).map_err(|e| report_error(path, e))?;
    writer.write(&batch).map_err(|e| report_error(path, e))?;
    writer.close().map_err(|e| report_error(path, e))?;

    Ok(())
}
