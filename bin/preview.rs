use std::path::PathBuf;
use std::time::Instant;

use anyhow::{anyhow, bail, Context};
use bulk_ingest::{preview_csv, CsvMeta, FieldSpec, FieldType, IngestConfig, PreviewOptions};
use clap::{Arg, ArgAction, Command};
use tracing_subscriber::EnvFilter;

/// `name:type[:required]`, where type is text, date, numeric, bool or
/// `enum=a|b|c`.
fn parse_field(raw: &str) -> anyhow::Result<FieldSpec> {
    let mut parts = raw.split(':');
    let name = parts.next().filter(|n| !n.trim().is_empty()).ok_or_else(|| anyhow!("empty field name in {raw:?}"))?;
    let ty = parts.next().unwrap_or("text");

    let mut spec = if let Some(values) = ty.strip_prefix("enum=") {
        FieldSpec::one_of(name.trim(), values.split('|').map(str::trim))
    } else {
        let field_type = FieldType::parse(ty).ok_or_else(|| anyhow!("unknown field type {ty:?} in {raw:?}"))?;
        FieldSpec::new(name.trim(), field_type)
    };
    match parts.next() {
        None => {}
        Some("required") => spec = spec.required(),
        Some(other) => bail!("unexpected modifier {other:?} in {raw:?}"),
    }
    Ok(spec)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let matches = Command::new("preview")
        .about("Validate a CSV export against a column layout without writing anything")
        .arg(
            Arg::new("path")
                .long("path")
                .value_parser(clap::value_parser!(PathBuf))
                .required(true),
        )
        .arg(
            Arg::new("field")
                .long("field")
                .help("Column as name:type[:required]; type is text|date|numeric|bool|enum=a|b")
                .action(ArgAction::Append)
                .required(true),
        )
        .arg(
            Arg::new("limit")
                .long("limit")
                .help("Stop after N data rows")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("lookahead")
                .long("lookahead")
                .help("Rows searched for the header")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("show")
                .long("show")
                .help("Invalid rows to print")
                .default_value("20")
                .value_parser(clap::value_parser!(usize)),
        )
        .get_matches();

    let config = IngestConfig::from_env()?;
    let path = matches
        .get_one::<PathBuf>("path")
        .ok_or_else(|| anyhow!("--path is required"))?;
    let specs = matches
        .get_many::<String>("field")
        .into_iter()
        .flatten()
        .map(|f| parse_field(f))
        .collect::<anyhow::Result<Vec<_>>>()?;
    let options = PreviewOptions {
        mapping: None,
        header_lookahead: matches
            .get_one::<usize>("lookahead")
            .copied()
            .unwrap_or(config.header_lookahead),
        date_pivot: config.date_pivot,
        max_rows: matches.get_one::<u64>("limit").copied(),
    };
    let show = matches.get_one::<usize>("show").copied().unwrap_or(20);

    let start = Instant::now();
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("opening {}", path.display()))?;
    let size = file.metadata().await.ok().map(|m| m.len());
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_string();
    let meta = CsvMeta::for_file(name, size);

    let report = preview_csv(&specs, file, &meta, &options).await?;
    let elapsed = start.elapsed().as_secs_f64().max(f64::EPSILON);

    println!(
        "source={} header_line={} header={:?}",
        path.display(),
        report.header_line,
        report.header
    );
    println!(
        "rows={} valid={} invalid={}",
        report.rows_checked,
        report.valid_rows,
        report.invalid_rows.len()
    );
    for row in report.invalid_rows.iter().take(show) {
        println!("  line {}: {}", row.line, row.errors.join("; "));
    }
    if report.invalid_rows.len() > show {
        println!("  ... {} more", report.invalid_rows.len() - show);
    }
    println!(
        "elapsed={:.2}s rows/sec={:.0} MB/s={:.1}",
        elapsed,
        report.rows_checked as f64 / elapsed,
        report.bytes_read as f64 / elapsed / 1_000_000.0
    );
    Ok(())
}
