use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use dicom_hierarchy::batch::Coordinator;
use dicom_hierarchy::deid::{Pseudonymizer, Recipe};
use dicom_hierarchy::grouping::{
    run_stage, GroupingStage, PatientStage, SeriesStage, StudyStage,
};
use dicom_hierarchy::hashing::Blake3Hasher;
use dicom_hierarchy::ingest::Ingestor;
use dicom_hierarchy::paths;
use dicom_hierarchy::store::{Db, Filter, ImageStore, MemoryStore};
use env_logger::Builder;
use log::{Level, LevelFilter};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

fn parse_mount(s: &str) -> Result<(String, PathBuf), String> {
    match s.split_once('=') {
        Some((name, path)) if !name.is_empty() && !path.is_empty() => {
            Ok((name.to_string(), PathBuf::from(path)))
        }
        _ => Err(format!("{s} is not of the form NAME=PATH")),
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq)]
enum Stage {
    Series,
    Studies,
    Patients,
    All,
}

/// Group DICOM metadata records into a series/study/patient hierarchy
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Database snapshot file
    #[arg(short, long, value_name = "DB_PATH", default_value = "dcmgroup-db.json")]
    db: PathBuf,

    /// Number of worker threads
    #[arg(short, long, default_value_t = 4)]
    workers: usize,

    /// Groups per batch, overriding the per-stage defaults
    #[arg(short, long)]
    batch_size: Option<usize>,

    /// Project name stamped into created documents
    #[arg(short, long)]
    project_name: Option<String>,

    /// Secret salt for pseudonymization hashes
    #[arg(long, env = "DCMGROUP_SALT", hide_env_values = true)]
    salt: Option<String>,

    /// Show more verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ingest a tree of flat JSON tag records into the image collection
    Ingest {
        /// Directory to walk for record files
        input: PathBuf,

        /// Drive mounts as NAME=PATH; defaults to 'local=<INPUT>'
        #[arg(long = "mount", value_name = "NAME=PATH", value_parser = parse_mount)]
        mounts: Vec<(String, PathBuf)>,
    },

    /// Run grouping stages over the ingested images
    Group {
        #[arg(value_enum, default_value_t = Stage::All)]
        stage: Stage,
    },

    /// Print the anonymized export path for every ingested image
    PseudoPaths,
}

fn ingest(db: Db, args: &Args, input: &PathBuf, mounts: &[(String, PathBuf)]) -> Result<()> {
    let mut mount_paths: BTreeMap<String, PathBuf> = mounts.iter().cloned().collect();
    if mount_paths.is_empty() {
        mount_paths.insert("local".to_string(), input.clone());
    }
    let ingestor = Ingestor::new(db, mount_paths, args.project_name.clone());
    let report = ingestor.ingest_dir(input);
    if report.failed > 0 {
        bail!("{} of {} record files failed", report.failed, report.seen);
    }
    Ok(())
}

fn group(db: Db, args: &Args, stage: Stage) -> Result<()> {
    let coordinator = Coordinator::new(args.workers);
    let project = args.project_name.clone();
    if matches!(stage, Stage::Series | Stage::All) {
        let series = SeriesStage::new(db.clone(), project.clone());
        let batch_size = args.batch_size.unwrap_or_else(|| series.default_batch_size());
        run_stage(&series, &coordinator, batch_size)?;
    }
    if matches!(stage, Stage::Studies | Stage::All) {
        let studies = StudyStage::new(db.clone(), project);
        let batch_size = args.batch_size.unwrap_or_else(|| studies.default_batch_size());
        run_stage(&studies, &coordinator, batch_size)?;
    }
    if matches!(stage, Stage::Patients | Stage::All) {
        let patients = PatientStage::new(db);
        let batch_size = args.batch_size.unwrap_or_else(|| patients.default_batch_size());
        run_stage(&patients, &coordinator, batch_size)?;
    }
    Ok(())
}

fn pseudo_paths(db: Db, args: &Args) -> Result<()> {
    let Some(salt) = args.salt.as_deref() else {
        bail!("pseudo-paths needs a salt (--salt or DCMGROUP_SALT)");
    };
    let pseudonymizer = Pseudonymizer::new(Recipe::default_recipe(), Blake3Hasher::new(salt));
    let images = ImageStore::new(db);
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for image in images.entities().find(&Filter::new())? {
        let anonymized = match pseudonymizer.pseudonymize(&image.tags) {
            Ok(record) => record,
            Err(err) => {
                log::error!("{}: {err}", image.file_source.rel_path);
                continue;
            }
        };
        match paths::instance_path(&anonymized) {
            Ok(path) => writeln!(out, "{}\t{}", image.file_source.rel_path, path.display())?,
            Err(err) => log::error!("{}: {err}", image.file_source.rel_path),
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose {
        LevelFilter::Info
    } else {
        LevelFilter::Error
    };

    let mut builder = Builder::from_default_env();
    builder
        .format(|buf, record| {
            let level = match record.level() {
                Level::Error => "Error",
                Level::Warn => "Warning",
                Level::Info => "Info",
                Level::Debug => "Debug",
                Level::Trace => "Trace",
            };
            writeln!(buf, "{}: {}", level, record.args())
        })
        .filter(None, log_level);
    builder.init();

    let store = Arc::new(
        MemoryStore::load(&args.db)
            .with_context(|| format!("failed to load database {}", args.db.display()))?,
    );
    let db: Db = store.clone();

    match &args.command {
        Command::Ingest { input, mounts } => {
            let result = ingest(db, &args, input, mounts);
            store
                .persist(&args.db)
                .with_context(|| format!("failed to persist database {}", args.db.display()))?;
            result
        }
        Command::Group { stage } => {
            group(db, &args, *stage)?;
            store
                .persist(&args.db)
                .with_context(|| format!("failed to persist database {}", args.db.display()))
        }
        Command::PseudoPaths => pseudo_paths(db, &args),
    }
}
