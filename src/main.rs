use std::{
    fs::File,
    io::{BufRead, BufReader, BufWriter},
    path::Path,
    process::ExitCode,
};

use clap::Parser;
use pgxrag::{
    cli::{self, Cli, Command, ModelAction, RetrieveOptions},
    config_db::{self, ConfigDb},
    corpus::Corpus,
    data_dir::DataDir,
    error::{self, Error},
    indexer::{self, IndexBuilder, IndexOptions},
    materialize::{DroppedHit, ResultMaterializer, SaveReport, SavedPage},
    model_manager::{self, EmbedderKind, ModelManager},
    render::{BoundSide, PdfiumRenderer, ResizeSpec},
    retrieval::{self, RankedHit, RetrievalEngine},
    rewrite::{self, CommandRewriter, QueryRewriter, SubQuery},
    schema,
    store::{IndexStore, LocalStore},
    vespa::{EndpointConfig, VespaStore},
};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if let Ok(env) = std::env::var("PGXRAG_LOG") {
        EnvFilter::new(env)
    } else if quiet {
        EnvFilter::new("warn")
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> error::Result<()> {
    if let Command::Completions(args) = &cli.command {
        args.generate();
        return Ok(());
    }

    let data_dir = DataDir::resolve(cli.data_dir.as_deref())?;
    let access = Access::for_command(&cli.command);
    let config_db = match access {
        Access::ReadWrite => ConfigDb::open(&data_dir.config_db())?,
        Access::ReadOnly => ConfigDb::open_read_only(&data_dir.config_db())?,
    };

    match &cli.command {
        Command::Index(args) => cmd_index(&cli, &data_dir, &config_db, args),
        Command::Retrieve(args) => {
            let store = open_store(&cli, &data_dir, access)?;
            let mut model = query_model(&cli, &config_db)?;
            cmd_retrieve(store.as_ref(), &mut model, &args.query, &args.options)
        }
        Command::Ask(args) => cmd_ask(&cli, &data_dir, &config_db, args),
        Command::Schema(args) => {
            let dimension = match args.dimension {
                Some(d) => d,
                None => config_db
                    .encoder_shape()?
                    .map_or(model_manager::DEFAULT_DIMENSION, |(_, d)| d)
                    as u32,
            };
            print!("{}", schema::render_vespa_schema(&args.name, dimension));
            Ok(())
        }
        Command::Status(args) => {
            cmd_status(&cli, &config_db, &data_dir, args.json)
        }
        Command::Remove(args) => {
            let store = open_store(&cli, &data_dir, access)?;
            let pages = indexer::remove_document(
                store.as_ref(),
                &config_db,
                &args.document,
            )?;
            println!("Removed '{}' ({pages} page(s))", args.document);
            Ok(())
        }
        Command::Feed(args) => cmd_feed(&cli, &data_dir, &config_db, args),
        Command::Model { action } => cmd_model(&cli, &config_db, action),
        Command::Completions(_) => Ok(()),
    }
}

/// Whether a command writes the local index and settings. Readers take no
/// writer lock, so any number of them can share a data directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    ReadWrite,
    ReadOnly,
}

impl Access {
    fn for_command(command: &Command) -> Self {
        match command {
            Command::Index(_) | Command::Remove(_) | Command::Feed(_) => {
                Self::ReadWrite
            }
            Command::Model {
                action: ModelAction::Set { .. } | ModelAction::Clear,
            } => Self::ReadWrite,
            _ => Self::ReadOnly,
        }
    }
}

/// The Vespa endpoint when one was given, else the local data directory.
fn open_store(
    cli: &Cli,
    data_dir: &DataDir,
    access: Access,
) -> error::Result<Box<dyn IndexStore>> {
    let endpoint = match (&cli.endpoint, &cli.endpoint_file) {
        (Some(url), _) => Some(EndpointConfig::from_url(url)),
        (None, Some(file)) => Some(EndpointConfig::from_file(file)?),
        (None, None) => None,
    };
    Ok(match (endpoint, access) {
        (Some(config), _) => {
            info!(
                endpoint = %config.endpoint,
                schema = %cli.schema,
                "using Vespa index store"
            );
            Box::new(
                VespaStore::new(&config)?
                    .with_schema(&cli.schema)
                    .with_namespace(cli.namespace()),
            )
        }
        (None, Access::ReadWrite) => Box::new(LocalStore::open(data_dir)?),
        (None, Access::ReadOnly) => {
            Box::new(LocalStore::open_read_only(data_dir)?)
        }
    })
}

fn resolved_embedder(
    cli: &Cli,
    config_db: &ConfigDb,
) -> error::Result<EmbedderKind> {
    let stored = config_db.get_setting(config_db::SETTING_EMBEDDER)?;
    model_manager::resolve_embedder(
        cli.embedder.map(EmbedderKind::from),
        stored.as_deref(),
    )
}

fn resolved_model_id(
    cli: &Cli,
    config_db: &ConfigDb,
    kind: EmbedderKind,
) -> error::Result<String> {
    Ok(model_manager::resolve_model_id(
        kind,
        cli.model.as_deref(),
        config_db.get_setting(config_db::SETTING_MODEL)?,
    ))
}

fn query_model(cli: &Cli, config_db: &ConfigDb) -> error::Result<ModelManager> {
    let kind = resolved_embedder(cli, config_db)?;
    Ok(ModelManager::new(kind, resolved_model_id(cli, config_db, kind)?))
}

fn cmd_index(
    cli: &Cli,
    data_dir: &DataDir,
    config_db: &ConfigDb,
    args: &cli::IndexArgs,
) -> error::Result<()> {
    if !args.dir.is_dir() {
        return Err(Error::Config(format!(
            "not a directory: {}",
            args.dir.display()
        )));
    }
    let corpus = Corpus::scan(&args.dir, &args.include)?;
    if corpus.is_empty() {
        eprintln!("No documents found in {}", args.dir.display());
        return Ok(());
    }
    eprintln!("Found {} document(s)", corpus.len());

    let kind = resolved_embedder(cli, config_db)?;
    let model_id = resolved_model_id(cli, config_db, kind)?;
    if config_db.get_setting(config_db::SETTING_EMBEDDER)?.is_none() {
        config_db.set_setting(config_db::SETTING_EMBEDDER, kind.name())?;
    }
    if config_db.get_setting(config_db::SETTING_MODEL)?.is_none() {
        config_db.set_setting(config_db::SETTING_MODEL, &model_id)?;
    }
    let (stored_patches, stored_dimension) = config_db.encoder_shape()?.unzip();
    let mut model = ModelManager::new(kind, model_id)
        .with_patches_per_page(
            args.patches_per_page
                .or(stored_patches)
                .unwrap_or(kind.default_patches_per_page()),
        )
        .with_dimension(
            stored_dimension.unwrap_or(model_manager::DEFAULT_DIMENSION),
        );

    let renderer = PdfiumRenderer::new()?.with_dpi(args.dpi);
    let store = open_store(cli, data_dir, Access::ReadWrite)?;
    let options = IndexOptions {
        batch_size: args.batch_size,
        thumbnail: args
            .thumbnail
            .map(|px| ResizeSpec::new(px, BoundSide::Longer)),
        changed_only: args.changed_only,
        progress: !cli.quiet,
    };

    let mut feed_file = args
        .feed_output
        .as_ref()
        .map(|path| File::create(path).map(BufWriter::new))
        .transpose()?;
    let mut builder =
        IndexBuilder::new(&renderer, &mut model, store.as_ref(), config_db)
            .with_options(options);
    if let Some(out) = feed_file.as_mut() {
        builder = builder.with_feed_output(out, cli.namespace(), &cli.schema);
    }
    let report = builder.build(&corpus)?;

    eprintln!(
        "Indexed {} document(s), {} page(s); {} unchanged",
        report.documents_indexed,
        report.pages_fed,
        report.documents_unchanged
    );
    for (name, reason) in &report.failed_documents {
        eprintln!("  skipped {name}: {reason}");
    }
    if !report.failed_pages.is_empty() {
        eprintln!("  {} page(s) failed to feed", report.failed_pages.len());
    }
    Ok(())
}

#[derive(Serialize)]
struct RetrieveOutput<'a> {
    query: &'a str,
    hits: &'a [RankedHit],
    saved: &'a [SavedPage],
    dropped: &'a [DroppedHit],
}

/// Retrieve for one query and save the pages. Returns what was saved.
fn retrieve_and_save(
    engine: &RetrievalEngine<'_>,
    model: &mut ModelManager,
    query: &str,
    opts: &RetrieveOptions,
    save_dir: &Path,
) -> error::Result<(Vec<RankedHit>, SaveReport)> {
    let hits = engine.retrieve(model, query, opts.top_k)?;
    if opts.no_save || hits.is_empty() {
        return Ok((hits, SaveReport::default()));
    }

    let renderer = PdfiumRenderer::new()?;
    let report = ResultMaterializer::new(&renderer)
        .with_resize(opts.resize_spec())
        .with_source(opts.image_source())
        .save(&hits, save_dir)?;
    Ok((hits, report))
}

fn print_human(query: &str, hits: &[RankedHit], report: &SaveReport) {
    retrieval::format_human(query, hits);
    for page in &report.saved {
        println!("saved {}", page.file.display());
    }
    for dropped in &report.dropped {
        println!(
            "dropped {} p.{}: {}",
            dropped.document_name,
            dropped.page_number + 1,
            dropped.reason
        );
    }
}

fn cmd_retrieve(
    store: &dyn IndexStore,
    model: &mut ModelManager,
    query: &str,
    opts: &RetrieveOptions,
) -> error::Result<()> {
    let engine = RetrievalEngine::new(store, opts.retrieval_config());
    let (hits, report) =
        retrieve_and_save(&engine, model, query, opts, &opts.save_dir)?;

    if opts.json {
        let output = RetrieveOutput {
            query,
            hits: &hits,
            saved: &report.saved,
            dropped: &report.dropped,
        };
        println!("{}", serde_json::to_string(&output)?);
    } else {
        print_human(query, &hits, &report);
    }
    Ok(())
}

#[derive(Serialize)]
struct AskOutput<'a> {
    question: &'a str,
    answer: &'a str,
    sub_queries: Vec<SubQueryOutput<'a>>,
}

#[derive(Serialize)]
struct SubQueryOutput<'a> {
    sub_query: &'a SubQuery,
    query: String,
    hits: Vec<RankedHit>,
    saved: Vec<SavedPage>,
    dropped: Vec<DroppedHit>,
}

fn cmd_ask(
    cli: &Cli,
    data_dir: &DataDir,
    config_db: &ConfigDb,
    args: &cli::AskArgs,
) -> error::Result<()> {
    let mut rewriter =
        CommandRewriter::new(&args.rewrite_cmd, args.rewrite_arg.clone());
    let raw = rewriter.rewrite(&args.question)?;
    let answer = rewrite::extract_answer(&raw);
    let sub_queries = rewrite::parse_sub_queries(&answer);
    info!(count = sub_queries.len(), "question rewritten");

    let opts = &args.options;
    let mut outputs = Vec::with_capacity(sub_queries.len());
    if !sub_queries.is_empty() {
        let store = open_store(cli, data_dir, Access::ReadOnly)?;
        let mut model = query_model(cli, config_db)?;
        let engine =
            RetrievalEngine::new(store.as_ref(), opts.retrieval_config());

        for (i, sub) in sub_queries.iter().enumerate() {
            let query = sub.search_text();
            let save_dir = opts.save_dir.join(format!("q{i}"));
            let (hits, report) = retrieve_and_save(
                &engine, &mut model, &query, opts, &save_dir,
            )?;
            outputs.push(SubQueryOutput {
                sub_query: sub,
                query,
                hits,
                saved: report.saved,
                dropped: report.dropped,
            });
        }
    }

    if opts.json {
        let output = AskOutput {
            question: &args.question,
            answer: &answer,
            sub_queries: outputs,
        };
        println!("{}", serde_json::to_string(&output)?);
    } else if outputs.is_empty() {
        println!("{}", rewrite::NO_GUIDELINE_SENTINEL);
    } else {
        for (i, out) in outputs.iter().enumerate() {
            println!("[q{i}] {}", out.query);
            let report = SaveReport {
                saved: out.saved.clone(),
                dropped: out.dropped.clone(),
            };
            print_human(&out.query, &out.hits, &report);
            println!();
        }
    }
    Ok(())
}

fn cmd_status(
    cli: &Cli,
    config_db: &ConfigDb,
    data_dir: &DataDir,
    json: bool,
) -> error::Result<()> {
    let kind = resolved_embedder(cli, config_db)?;
    let model_name = resolved_model_id(cli, config_db, kind)?;
    let documents = config_db.list_documents()?;
    let manifest_pages: u64 =
        documents.iter().map(|(_, r)| u64::from(r.page_count)).sum();
    let shape = config_db.encoder_shape()?;
    let store = open_store(cli, data_dir, Access::ReadOnly)?;
    let indexed_pages = store.page_count()?;

    if json {
        let status = serde_json::json!({
            "data_dir": data_dir.root(),
            "embedder": kind.name(),
            "model": model_name,
            "patches_per_page": shape.map(|(p, _)| p),
            "dimension": shape.map(|(_, d)| d),
            "documents": documents.len(),
            "manifest_pages": manifest_pages,
            "indexed_pages": indexed_pages,
        });
        println!("{status}");
    } else {
        println!("Data directory: {}", data_dir.root().display());
        println!("Model: {model_name} ({kind})");
        match shape {
            Some((p, d)) => println!("Encoder shape: {p} patches x {d} dims"),
            None => println!("Encoder shape: (nothing indexed yet)"),
        }
        println!("Documents: {}", documents.len());
        for (name, record) in &documents {
            println!("  {name}: {} page(s)", record.page_count);
        }
        println!("Indexed pages: {indexed_pages} (manifest: {manifest_pages})");
    }
    Ok(())
}

fn cmd_feed(
    cli: &Cli,
    data_dir: &DataDir,
    config_db: &ConfigDb,
    args: &cli::FeedArgs,
) -> error::Result<()> {
    let input: Box<dyn BufRead> = if args.file == Path::new("-") {
        Box::new(std::io::stdin().lock())
    } else {
        Box::new(BufReader::new(File::open(&args.file)?))
    };
    let dimension = match args.dimension {
        Some(d) => d,
        None => config_db
            .encoder_shape()?
            .map_or(model_manager::DEFAULT_DIMENSION, |(_, d)| d)
            as u32,
    };

    let store = open_store(cli, data_dir, Access::ReadWrite)?;
    let report = indexer::replay_feed(
        store.as_ref(),
        config_db,
        input,
        dimension,
        args.batch_size,
    )?;

    eprintln!(
        "Fed {} page(s) of {} document(s)",
        report.pages_fed, report.documents
    );
    for (line, reason) in &report.failed_lines {
        eprintln!("  line {line}: {reason}");
    }
    if !report.failed_pages.is_empty() {
        eprintln!("  {} page(s) failed to feed", report.failed_pages.len());
    }
    Ok(())
}

fn cmd_model(
    cli: &Cli,
    config_db: &ConfigDb,
    action: &ModelAction,
) -> error::Result<()> {
    match action {
        ModelAction::Show { json } => {
            let kind = resolved_embedder(cli, config_db)?;
            let stored = config_db.get_setting(config_db::SETTING_MODEL)?;
            let env = std::env::var(model_manager::MODEL_ENV_VAR).ok();
            let resolved = resolved_model_id(cli, config_db, kind)?;
            let source = if cli.model.is_some() {
                "flag"
            } else if env.is_some() {
                "env"
            } else if stored.is_some() {
                "config"
            } else {
                "default"
            };

            if *json {
                let out = serde_json::json!({
                    "resolved": resolved,
                    "source": source,
                    "embedder": kind.name(),
                    "stored": stored,
                    "env": env,
                });
                println!("{out}");
            } else {
                println!("{resolved} ({source}, {kind} embedder)");
            }
        }
        ModelAction::Set { model } => {
            config_db.set_setting(config_db::SETTING_MODEL, model)?;
            println!("Model set to {model}");
        }
        ModelAction::Clear => {
            if config_db.remove_setting(config_db::SETTING_MODEL)? {
                let kind = resolved_embedder(cli, config_db)?;
                println!(
                    "Model setting cleared (default: {})",
                    kind.default_model_id()
                );
            } else {
                println!("No model setting stored");
            }
        }
    }
    Ok(())
}
