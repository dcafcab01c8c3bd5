use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use std::env;
use std::path::Path;

use vintage_series::{
    search, GroupAssignment, IngestOptions, ProjectOptions, SearchQuery, SeriesError, Session,
    StoredTable, Table, TimeSeriesType, VERSION,
};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = env::args().collect();

    match args.get(1).map(String::as_str) {
        Some("import") => run_import(&args[2..]),
        Some("as-of") => run_as_of(&args[2..]),
        Some("search") => run_search(&args[2..]),
        _ => {
            print_usage();
            Ok(())
        }
    }
}

fn print_usage() {
    println!("vintage-series {}", VERSION);
    println!();
    println!("USAGE:");
    println!("  vintage-series import <csv> <type> [group-code]");
    println!("  vintage-series as-of <code> [cutoff YYYY-MM-DD]");
    println!("  vintage-series search <text>");
    println!();
    println!("Database: VINTAGE_ENV (development|testing|production), VINTAGE_DATABASE=<path>");
}

fn run_import(args: &[String]) -> Result<()> {
    let (csv_path, type_name) = match args {
        [csv_path, type_name, ..] => (csv_path, type_name),
        _ => bail!("usage: vintage-series import <csv> <type> [group-code]"),
    };

    println!("📥 Importing {}", csv_path);

    // 1. Load CSV
    let table = Table::from_csv_path(Path::new(csv_path))
        .with_context(|| format!("Failed to read {}", csv_path))?;
    println!("✓ Loaded {} rows, columns: {}", table.row_count(), table.column_names().join(", "));

    // 2. Open store
    let mut session = Session::from_env().context("Failed to open series store")?;

    // 3. Resolve type (created on save when new) and optional group
    let series_type = match session.load_type_by_name(type_name) {
        Ok(key) => key,
        Err(SeriesError::UnresolvedReference(_)) => {
            println!("✓ New type '{}'", type_name);
            session.graph_mut().add_type(TimeSeriesType::new(type_name.as_str()))
        }
        Err(e) => return Err(e.into()),
    };

    let mut options = IngestOptions::new(series_type);
    if let Some(group_code) = args.get(2) {
        let group = session
            .load_group_by_code(group_code)
            .with_context(|| format!("Unknown group '{}'", group_code))?;
        options = options.with_groups(GroupAssignment::Single(group));
    }

    // 4. Ingest + save with one commit
    let ingested = session
        .ingest_and_save(&table, &options)
        .context("Import failed; nothing was written")?;

    for key in ingested.keys() {
        let series = session.graph().get(key)?;
        println!("✓ Saved {} ({})", series.code(), series.name);
    }
    println!(
        "✓ Store holds {} time series, {} observations",
        session.count(StoredTable::TimeSeries)?,
        session.count(StoredTable::Observation)?
    );

    Ok(())
}

fn run_as_of(args: &[String]) -> Result<()> {
    let Some(code) = args.first() else {
        bail!("usage: vintage-series as-of <code> [cutoff YYYY-MM-DD]");
    };

    let cutoff = args
        .get(1)
        .map(|raw| NaiveDate::parse_from_str(raw, "%Y-%m-%d"))
        .transpose()
        .context("Cutoff must be YYYY-MM-DD")?;

    let mut session = Session::from_env().context("Failed to open series store")?;
    let key = session
        .load_time_series_by_code(code)
        .with_context(|| format!("Unknown time series '{}'", code))?;

    let options = ProjectOptions {
        cutoff,
        include_release_date: true,
        include_created_at: false,
        all_vintages: false,
    };
    let table = vintage_series::project(session.graph(), key, &options)?;
    table.write_csv(std::io::stdout())?;

    Ok(())
}

fn run_search(args: &[String]) -> Result<()> {
    if args.is_empty() {
        bail!("usage: vintage-series search <text>");
    }

    let session = Session::from_env().context("Failed to open series store")?;
    let hits = search(session.connection(), &SearchQuery::new(args.join(" ")))?;

    if hits.is_empty() {
        println!("No series found");
        return Ok(());
    }

    println!("🔍 {} match(es)", hits.len());
    for hit in hits {
        println!(
            "  [{}] {:<12} {:<30} {}",
            hit.kind.label(),
            hit.code,
            hit.name,
            hit.keywords.join(", ")
        );
    }

    Ok(())
}
