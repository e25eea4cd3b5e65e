use std::{path::PathBuf, time::Duration};

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;

use crate::{
    indexer::DEFAULT_BATCH_SIZE,
    model_manager::EmbedderKind,
    materialize::{DEFAULT_RESIZE, DEFAULT_SAVE_DIR, ImageSource},
    render::{BoundSide, DEFAULT_DPI, ResizeSpec},
    retrieval::{DEFAULT_TOP_K, RetrievalConfig},
    schema::{DEFAULT_SCHEMA_NAME, RankProfile},
};

#[derive(Debug, Parser)]
#[command(
    name = "pgxrag",
    about = "Page-level retrieval over pharmacogenomics guideline PDFs"
)]
pub struct Cli {
    /// Override the XDG data directory
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Page encoder; defaults to the one the index was built with
    #[arg(long, global = true, value_enum)]
    pub embedder: Option<EmbedderArg>,

    /// Override the encoder model ID or local model path
    #[arg(long, global = true)]
    pub model: Option<String>,

    /// Use a Vespa application at this URL instead of the local index
    #[arg(long, global = true, conflicts_with = "endpoint_file")]
    pub endpoint: Option<String>,

    /// Read the Vespa endpoint (and credentials) from a file
    #[arg(long, global = true)]
    pub endpoint_file: Option<PathBuf>,

    /// Vespa schema holding the pages
    #[arg(long, global = true, default_value = DEFAULT_SCHEMA_NAME)]
    pub schema: String,

    /// Vespa document namespace; defaults to the schema name
    #[arg(long, global = true)]
    pub namespace: Option<String>,

    /// Increase log verbosity (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log warnings and errors; hide progress bars
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Render, embed and index every document in a directory
    Index(IndexArgs),
    /// Retrieve the best pages for a query and save them as images
    Retrieve(RetrieveArgs),
    /// Rewrite a question into sub-queries, then retrieve for each
    Ask(AskArgs),
    /// Print the Vespa schema definition for the page index
    Schema(SchemaArgs),
    /// Show system status and statistics
    Status(StatusArgs),
    /// Remove every page of a document from the index
    Remove(RemoveArgs),
    /// Feed JSONL put operations written by `index --feed-output`
    Feed(FeedArgs),
    /// Manage the encoder model configuration
    Model {
        #[command(subcommand)]
        action: ModelAction,
    },
    /// Generate shell completions
    #[command(hide = true)]
    Completions(CompletionsArgs),
}

// -- Model --

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EmbedderArg {
    /// ColPali over the page image
    Visual,
    /// ColBERT over the page text
    Text,
}

impl From<EmbedderArg> for EmbedderKind {
    fn from(arg: EmbedderArg) -> Self {
        match arg {
            EmbedderArg::Visual => EmbedderKind::Visual,
            EmbedderArg::Text => EmbedderKind::Text,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum ModelAction {
    /// Show the currently resolved model
    Show {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Persist a default model ID or local path in config.db
    Set {
        /// Model ID (HuggingFace) or local path
        model: String,
    },
    /// Clear the stored model setting (revert to default)
    Clear,
}

// -- Index --

#[derive(Debug, Parser)]
pub struct IndexArgs {
    /// Directory holding the guideline documents
    pub dir: PathBuf,

    /// Glob of files to include, relative to DIR (repeatable)
    #[arg(long = "include", value_name = "GLOB")]
    pub include: Vec<String>,

    /// Pages per encoder call
    #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
    pub batch_size: usize,

    /// Patch vectors kept per page (fixed for the whole index)
    #[arg(long)]
    pub patches_per_page: Option<usize>,

    /// Rendering resolution
    #[arg(long, default_value_t = DEFAULT_DPI)]
    pub dpi: f32,

    /// Also write every page as a Vespa JSONL put operation
    #[arg(long, value_name = "FILE")]
    pub feed_output: Option<PathBuf>,

    /// Skip documents that have not changed since the last build
    #[arg(long)]
    pub changed_only: bool,

    /// Downscale stored page images so the longer side is at most PX
    #[arg(long, value_name = "PX")]
    pub thumbnail: Option<u32>,
}

// -- Retrieve --

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ProfileArg {
    Default,
    Hamming,
}

impl From<ProfileArg> for RankProfile {
    fn from(arg: ProfileArg) -> Self {
        match arg {
            ProfileArg::Default => RankProfile::Default,
            ProfileArg::Hamming => RankProfile::Hamming,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SideArg {
    Height,
    Longer,
    Shorter,
}

impl From<SideArg> for BoundSide {
    fn from(arg: SideArg) -> Self {
        match arg {
            SideArg::Height => BoundSide::Height,
            SideArg::Longer => BoundSide::Longer,
            SideArg::Shorter => BoundSide::Shorter,
        }
    }
}

/// Flags shared by `retrieve` and `ask`.
#[derive(Debug, Clone, Args)]
pub struct RetrieveOptions {
    /// Number of pages to return
    #[arg(short = 'k', long, default_value_t = DEFAULT_TOP_K)]
    pub top_k: usize,

    /// Directory the page images are written to
    #[arg(long, default_value = DEFAULT_SAVE_DIR)]
    pub save_dir: PathBuf,

    /// Do not write page images, only list the hits
    #[arg(long)]
    pub no_save: bool,

    /// Downscale saved images to at most PX on the bounded side
    #[arg(long, value_name = "PX", default_value_t = DEFAULT_RESIZE)]
    pub resize: u32,

    /// Save images at full resolution
    #[arg(long, conflicts_with = "resize")]
    pub no_resize: bool,

    /// Which side the resize bound applies to
    #[arg(long, value_enum, default_value_t = SideArg::Height)]
    pub resize_side: SideArg,

    /// Rank profile evaluated by the index store
    #[arg(long, value_enum, default_value_t = ProfileArg::Default)]
    pub rank_profile: ProfileArg,

    /// Number of first-phase candidates to rescore
    #[arg(long)]
    pub rerank_count: Option<usize>,

    /// Query timeout in seconds
    #[arg(long, value_name = "SECS", default_value_t = 120)]
    pub timeout: u64,

    /// Use the page image stored in the index instead of re-rendering
    #[arg(long)]
    pub use_stored_images: bool,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

impl RetrieveOptions {
    pub fn retrieval_config(&self) -> RetrievalConfig {
        RetrievalConfig {
            rank_profile: self.rank_profile.into(),
            rerank_count: self.rerank_count,
            timeout: Duration::from_secs(self.timeout),
            include_image: self.use_stored_images && !self.no_save,
        }
    }

    pub fn resize_spec(&self) -> Option<ResizeSpec> {
        (!self.no_resize)
            .then(|| ResizeSpec::new(self.resize, self.resize_side.into()))
    }

    pub fn image_source(&self) -> ImageSource {
        if self.use_stored_images {
            ImageSource::StoredImage
        } else {
            ImageSource::Rerender
        }
    }
}

#[derive(Debug, Parser)]
pub struct RetrieveArgs {
    /// The search query
    pub query: String,

    #[command(flatten)]
    pub options: RetrieveOptions,
}

// -- Ask --

#[derive(Debug, Parser)]
pub struct AskArgs {
    /// The clinical question
    pub question: String,

    /// Program that runs the query-rewrite model; it receives
    /// `--question <QUESTION>` and prints the model output
    #[arg(long, value_name = "CMD")]
    pub rewrite_cmd: String,

    /// Extra argument passed to the rewrite program (repeatable)
    #[arg(long, value_name = "ARG", allow_hyphen_values = true)]
    pub rewrite_arg: Vec<String>,

    #[command(flatten)]
    pub options: RetrieveOptions,
}

// -- Schema --

#[derive(Debug, Parser)]
pub struct SchemaArgs {
    /// Schema (and document type) name
    #[arg(long, default_value = DEFAULT_SCHEMA_NAME)]
    pub name: String,

    /// Patch vector dimension; defaults to the one the index was built with
    #[arg(long)]
    pub dimension: Option<u32>,
}

// -- Status --

#[derive(Debug, Parser)]
pub struct StatusArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Remove --

#[derive(Debug, Parser)]
pub struct RemoveArgs {
    /// Document name as shown by `status` (path relative to the corpus)
    pub document: String,
}

// -- Feed --

#[derive(Debug, Parser)]
pub struct FeedArgs {
    /// JSONL file of put operations, or `-` for stdin
    pub file: PathBuf,

    /// Patch bit width; defaults to the one the index was built with
    #[arg(long)]
    pub dimension: Option<u32>,

    /// Pages per store request
    #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
    pub batch_size: usize,
}

// -- Completions --

#[derive(Debug, Parser)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    pub shell: Shell,
}

impl Cli {
    /// Document namespace for Vespa ids and feed lines.
    pub fn namespace(&self) -> &str {
        self.namespace.as_deref().unwrap_or(&self.schema)
    }
}

impl CompletionsArgs {
    /// Generate shell completions and print to stdout.
    pub fn generate(&self) {
        let mut cmd = Cli::command();
        clap_complete::generate(
            self.shell,
            &mut cmd,
            "pgxrag",
            &mut std::io::stdout(),
        );
    }
}
