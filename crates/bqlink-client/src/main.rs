//! bqlink replay tool
//!
//! Runs a query result through a Connection backed by the in-process
//! warehouse and prints the delivered rows as JSON lines. Useful to see which
//! backend a given result shape and set of thresholds ends up with.

use anyhow::{bail, Context};
use bqlink_client::{
    metrics, telemetry, Connection, FieldValue, InMemoryWarehouse, ReadClientConfig,
    ResultFixture, Row, Schema, Services,
};
use clap::Parser;
use serde_json::{json, Map, Value};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "bqlink-replay")]
#[command(about = "Replay a query result through the adaptive cursor")]
struct Args {
    /// JSON result fixture (schema + rows)
    #[arg(long, conflicts_with = "generate")]
    fixture: Option<PathBuf>,

    /// Generate a single-column result of this many rows instead
    #[arg(long)]
    generate: Option<usize>,

    /// Query text the result is registered under
    #[arg(long, default_value = "SELECT * FROM replay")]
    sql: String,

    /// Total-to-first-page size ratio at or above which streaming is used
    #[arg(long, env = "BQLINK_READ_TOTAL_TO_FIRST_PAGE_SIZE_RATIO")]
    ratio: Option<i64>,

    /// Results smaller than this are always paged
    #[arg(long, env = "BQLINK_READ_MINIMUM_TABLE_SIZE")]
    min_table_size: Option<i64>,

    /// Read-ahead buffer size in rows
    #[arg(long, env = "BQLINK_READ_BUFFER_SIZE")]
    buffer_size: Option<i64>,

    /// Stop after this many rows
    #[arg(long)]
    max_results: Option<u64>,

    /// Read streams over a single partition
    #[arg(long, default_value = "false")]
    strict_ordering: bool,

    /// Partitions offered by the warehouse for streaming reads
    #[arg(long, default_value = "4")]
    partitions: usize,

    /// Rows resident in the first page
    #[arg(long, default_value = "100")]
    first_page_rows: usize,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Print Prometheus metrics after the run
    #[arg(long, default_value = "false")]
    print_metrics: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env if present
    dotenvy::dotenv().ok();

    let args = Args::parse();

    telemetry::init(&args.log_level)?;

    let fixture = load_fixture(&args)?;
    let read_client = read_client_config(&args)?;
    info!(
        ratio = read_client.total_to_first_page_size_ratio(),
        minimum_table_size = read_client.minimum_table_size(),
        buffer_size = read_client.buffer_size(),
        rows = fixture.rows.len(),
        "Starting replay"
    );

    let warehouse = Arc::new(
        InMemoryWarehouse::new()
            .with_first_page_rows(args.first_page_rows)
            .with_partitions(args.partitions),
    );
    warehouse.register(&args.sql, fixture);

    let mut connection =
        Connection::with_read_client_config(Services::from_backend(warehouse.clone()), read_client);
    connection.set_max_results(args.max_results)?;
    connection.set_strict_ordering(args.strict_ordering)?;

    let mut cursor = connection.execute_select(&args.sql).await?;
    let schema = cursor.schema().clone();
    let selection = cursor.selection();

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    while let Some(row) = cursor.next().await? {
        writeln!(out, "{}", row_to_json(&schema, &row))?;
    }
    out.flush()?;

    info!(
        backend = %selection.kind,
        reason = %selection.reason,
        rows = cursor.rows_delivered(),
        page_fetches = warehouse.page_fetches(),
        chunk_reads = warehouse.chunk_reads(),
        "Replay finished"
    );

    connection.close().await;

    if args.print_metrics {
        print!("{}", metrics::encode_metrics());
    }
    Ok(())
}

fn load_fixture(args: &Args) -> anyhow::Result<ResultFixture> {
    match (&args.fixture, args.generate) {
        (Some(path), _) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading fixture {}", path.display()))?;
            serde_json::from_str(&raw).with_context(|| format!("parsing fixture {}", path.display()))
        }
        (None, Some(rows)) => Ok(ResultFixture::sequence("n", rows)),
        (None, None) => bail!("either --fixture or --generate is required"),
    }
}

/// Environment thresholds, overridden by command-line flags
fn read_client_config(args: &Args) -> anyhow::Result<ReadClientConfig> {
    let mut builder = ReadClientConfig::from_env()?.to_builder();
    if let Some(ratio) = args.ratio {
        builder = builder.total_to_first_page_size_ratio(ratio);
    }
    if let Some(rows) = args.min_table_size {
        builder = builder.minimum_table_size(rows);
    }
    if let Some(rows) = args.buffer_size {
        builder = builder.buffer_size(rows);
    }
    Ok(builder.build()?)
}

fn row_to_json(schema: &Schema, row: &Row) -> Value {
    let mut object = Map::new();
    for (index, value) in row.values.iter().enumerate() {
        let name = schema
            .fields
            .get(index)
            .map(|field| field.name.clone())
            .unwrap_or_else(|| format!("f{}", index));
        object.insert(name, value_to_json(value));
    }
    Value::Object(object)
}

fn value_to_json(value: &FieldValue) -> Value {
    match value {
        FieldValue::Null => Value::Null,
        FieldValue::Bool(v) => json!(v),
        FieldValue::Int64(v) => json!(v),
        FieldValue::Float64(v) => json!(v),
        FieldValue::String(v) => json!(v),
        FieldValue::Bytes(v) => json!(v),
        FieldValue::Repeated(values) | FieldValue::Record(values) => {
            Value::Array(values.iter().map(value_to_json).collect())
        }
    }
}
