#![forbid(unsafe_code)]

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand};

use ensemble_appraiser::category::load_overrides_json;
use ensemble_appraiser::gateway::TracingUsageSink;
use ensemble_appraiser::logging::{self, LogFormat};
use ensemble_appraiser::{
    records_from_outcome, BenchmarkStore, CategoryClassifier, Decision, EnsembleConfig,
    GroundTruth, ImageInput, JsonlTraceSink, ProviderRegistry, SelfHealEngine,
    SqliteBenchmarkStore, ValuationEngine, ValuationRequest, ValuationResult,
};

#[derive(Parser)]
#[command(name = "appraiser", version, about = "Ensemble resale valuation CLI")]
struct Cli {
    /// JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Human)]
    log_format: LogFormat,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Value one item with every available provider
    Analyze {
        /// Item photos
        images: Vec<PathBuf>,
        #[arg(long, default_value = "")]
        name: String,
        #[arg(long)]
        price: Option<f64>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        location: Option<String>,
        /// Write the result here instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
        /// Append a JSONL audit line
        #[arg(long)]
        trace: Option<PathBuf>,
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// Print the category an item name maps to
    Classify {
        #[arg(long)]
        name: String,
        #[arg(long)]
        description: Option<String>,
        /// JSON array of overrides
        #[arg(long)]
        overrides: Option<PathBuf>,
        #[arg(long)]
        verbose: bool,
    },
    /// Score a saved valuation against the real sale price
    RecordOutcome {
        #[arg(long)]
        result: PathBuf,
        #[arg(long)]
        actual: f64,
        #[arg(long, value_parser = parse_decision)]
        decision: Option<Decision>,
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// Show current accuracy statistics and multipliers
    Weights {
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// Export benchmark records to JSONL
    ExportBenchmarks {
        #[arg(long)]
        db: Option<PathBuf>,
        #[arg(long)]
        out: PathBuf,
    },
    /// Replace stored category overrides with a JSON array file
    ImportOverrides {
        #[arg(long)]
        file: PathBuf,
        #[arg(long)]
        db: Option<PathBuf>,
    },
}

fn parse_decision(s: &str) -> Result<Decision, String> {
    Decision::parse_lenient(s).ok_or_else(|| format!("expected BUY or SELL, got {s:?}"))
}

fn open_store(db: Option<PathBuf>, config: &EnsembleConfig) -> Result<Arc<SqliteBenchmarkStore>, Box<dyn std::error::Error>> {
    let path = db
        .or_else(|| config.benchmark_db.clone())
        .unwrap_or_else(SqliteBenchmarkStore::default_path);
    Ok(Arc::new(SqliteBenchmarkStore::new(path)?))
}

fn write_json(value: &impl serde::Serialize, out: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let rendered = serde_json::to_string_pretty(value)?;
    match out {
        Some(path) => {
            let mut file = File::create(path)?;
            writeln!(file, "{rendered}")?;
        }
        None => {
            let stdout = io::stdout();
            let mut handle = stdout.lock();
            writeln!(handle, "{rendered}")?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    logging::init(&cli.log_level, cli.log_format);
    let config = EnsembleConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Analyze {
            images,
            name,
            price,
            description,
            location,
            out,
            trace,
            db,
        } => {
            if images.is_empty() && name.trim().is_empty() {
                return Err("analyze needs at least one image or --name".into());
            }
            let store = open_store(db, &config)?;

            let mut overrides = store.load_overrides().await?;
            if let Some(path) = &config.overrides_path {
                overrides.extend(load_overrides_json(path)?);
            }
            let classifier = CategoryClassifier::with_overrides(&overrides)?;

            let registry = ProviderRegistry::from_resolved(
                &config.resolve_providers(),
                Arc::new(TracingUsageSink),
                &config.adapter,
            );
            if registry.is_empty() {
                return Err("no providers available; set at least one provider API key".into());
            }

            let self_heal = Arc::new(SelfHealEngine::new(
                store.clone(),
                config.weight_cache(),
                config.self_heal.clone(),
            ));
            self_heal.refresh().await;

            let mut engine = ValuationEngine::new(
                Arc::new(registry),
                Arc::new(classifier),
                config.engine_config(),
            )
            .with_self_heal(self_heal);

            let mut worker = None;
            if let Some(path) = trace {
                let (sink, w) = JsonlTraceSink::new(path)?;
                engine = engine.with_trace_sink(Arc::new(sink));
                worker = Some(w);
            }

            let mut request = ValuationRequest::new(name);
            for path in images {
                request = request.with_image(ImageInput::Bytes(std::fs::read(&path)?));
            }
            if let Some(price) = price {
                request = request.with_asking_price(price);
            }
            if let Some(description) = description {
                request = request.with_description(description);
            }
            if let Some(location) = location {
                request = request.with_location(location);
            }

            let result = engine.analyze(request).await;
            drop(engine);
            if let Some(worker) = worker {
                worker.join()?;
            }
            write_json(&result, out.as_deref())?;
        }
        Commands::Classify {
            name,
            description,
            overrides,
            verbose,
        } => {
            let mut entries = Vec::new();
            if let Some(path) = overrides.as_ref().or(config.overrides_path.as_ref()) {
                entries = load_overrides_json(path)?;
            }
            let classifier = CategoryClassifier::with_overrides(&entries)?;
            if verbose {
                let classification = classifier.classify_detailed(&name, description.as_deref());
                write_json(&classification, None)?;
            } else {
                println!("{}", classifier.classify(&name, description.as_deref()));
            }
        }
        Commands::RecordOutcome {
            result,
            actual,
            decision,
            db,
        } => {
            let raw = std::fs::read_to_string(&result)?;
            let valuation: ValuationResult = serde_json::from_str(&raw)?;
            let mut truth = GroundTruth::sold_for(actual);
            if let Some(decision) = decision {
                truth = truth.with_decision(decision);
            }
            let records = records_from_outcome(&valuation, &truth, Utc::now())?;
            let store = open_store(db, &config)?;
            let written = store.append(&records).await?;
            println!("recorded {written} benchmark rows for {}", valuation.valuation_id);
        }
        Commands::Weights { category, db } => {
            let store = open_store(db, &config)?;
            let engine = SelfHealEngine::new(store, config.weight_cache(), config.self_heal.clone());
            let report = engine.compute(category.as_deref()).await?;
            write_json(&report, None)?;
        }
        Commands::ExportBenchmarks { db, out } => {
            let store = open_store(db, &config)?;
            let count = store.export_jsonl(&out).await?;
            println!("exported {count} records to {}", out.display());
        }
        Commands::ImportOverrides { file, db } => {
            let entries = load_overrides_json(&file)?;
            // compile once so a bad pattern is rejected before it is stored
            CategoryClassifier::with_overrides(&entries)?;
            let store = open_store(db, &config)?;
            let count = store.replace_overrides(&entries).await?;
            println!("stored {count} category overrides");
        }
    }

    Ok(())
}
