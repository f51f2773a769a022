use tabula::checkpoint::{
    CheckpointLedger, CheckpointStorage, InMemoryCheckpointStorage, SqliteCheckpointStorage,
};
use tabula::context::InMemoryContextStore;
use tabula::dictionary::DataDictionary;
use tabula::executor::QueryExecutor;
use tabula::llm::{
    IntentClassifier, KeywordIntentClassifier, LlmClient, ResponseComposer, TemplateComposer,
};
use tabula::pipeline::{Pipeline, PipelineOutcome};
use tabula::resolver::SemanticResolver;
use tabula::table_source::{RemoteTableStore, TableSourceResolver};

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "tabula")]
#[command(about = "Deterministic natural-language queries over registered tables")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ask a question against the registered tables
    Ask {
        /// The question in natural language
        question: String,

        /// Path to the data dictionary document
        #[arg(short = 'D', long, default_value = "dictionary.json")]
        dictionary: PathBuf,

        /// Path to the local table directory (one <table>.csv per table)
        #[arg(short, long, default_value = "data")]
        data_dir: PathBuf,

        /// Tables to resolve against (default: every table in the dictionary)
        #[arg(short, long, value_delimiter = ',')]
        tables: Vec<String>,

        /// Conversation id, for follow-ups and disambiguation answers
        #[arg(short, long)]
        conversation: Option<String>,

        /// SQLite file for the checkpoint ledger (default: in-memory)
        #[arg(long)]
        checkpoint_db: Option<PathBuf>,

        /// Base URL of the remote table store fallback
        #[arg(long)]
        remote_url: Option<String>,
    },
    /// Validate a dictionary document and list its contents
    Validate {
        #[arg(default_value = "dictionary.json")]
        dictionary: PathBuf,
    },
    /// Show the checkpoint trail for a conversation
    Checkpoints {
        conversation_id: String,

        #[arg(long)]
        checkpoint_db: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    match args.command {
        Commands::Ask {
            question,
            dictionary,
            data_dir,
            tables,
            conversation,
            checkpoint_db,
            remote_url,
        } => {
            ask(
                &question,
                &dictionary,
                data_dir,
                tables,
                conversation.as_deref(),
                checkpoint_db,
                remote_url,
            )
            .await
        }
        Commands::Validate { dictionary } => validate(&dictionary),
        Commands::Checkpoints {
            conversation_id,
            checkpoint_db,
        } => checkpoints(&conversation_id, &checkpoint_db),
    }
}

#[allow(clippy::too_many_arguments)]
async fn ask(
    question: &str,
    dictionary_path: &PathBuf,
    data_dir: PathBuf,
    tables: Vec<String>,
    conversation: Option<&str>,
    checkpoint_db: Option<PathBuf>,
    remote_url: Option<String>,
) -> Result<()> {
    let dictionary = Arc::new(DataDictionary::load(dictionary_path)?);
    info!(version = %dictionary.version, "dictionary loaded");

    let available_tables = if tables.is_empty() {
        dictionary.list_tables()
    } else {
        tables
    };

    let storage: Arc<dyn CheckpointStorage> = match checkpoint_db {
        Some(path) => Arc::new(SqliteCheckpointStorage::open(&path)?),
        None => Arc::new(InMemoryCheckpointStorage::new()),
    };

    let remote = remote_url.map(RemoteTableStore::new);
    let (classifier, composer): (Arc<dyn IntentClassifier>, Arc<dyn ResponseComposer>) =
        match LlmClient::from_env() {
            Some(client) => (Arc::new(client.clone()), Arc::new(client)),
            None => {
                info!("no API key configured, using keyword classifier and template composer");
                (
                    Arc::new(KeywordIntentClassifier::new()),
                    Arc::new(TemplateComposer::new()),
                )
            }
        };

    let pipeline = Pipeline::new(
        SemanticResolver::new(dictionary, Arc::new(InMemoryContextStore::new())),
        QueryExecutor::new(TableSourceResolver::new(data_dir, remote)),
        classifier,
        composer,
        CheckpointLedger::new(storage),
    );

    let response = pipeline
        .execute_query(question, &available_tables, conversation)
        .await?;

    match response.outcome {
        PipelineOutcome::Answer(text) => println!("{text}"),
        PipelineOutcome::Disambiguation { prompt, .. } => println!("{prompt}"),
        PipelineOutcome::NeedsClarification(text) => println!("{text}"),
    }
    println!(
        "\n[intent: {} | confidence: {:.2} | conversation: {}]",
        response.intent.as_str(),
        response.confidence,
        response.conversation_id
    );
    Ok(())
}

fn validate(dictionary_path: &PathBuf) -> Result<()> {
    let dictionary = DataDictionary::load(dictionary_path)?;
    println!("dictionary version {} is valid", dictionary.version);
    for table in dictionary.list_tables() {
        let aliases = dictionary.alias_index(&table).len();
        println!("  table {table}: {aliases} alias entries");
    }
    Ok(())
}

fn checkpoints(conversation_id: &str, checkpoint_db: &PathBuf) -> Result<()> {
    let storage = SqliteCheckpointStorage::open(checkpoint_db)?;
    let trail = storage.by_conversation(conversation_id)?;
    if trail.is_empty() {
        println!("no checkpoints for conversation {conversation_id}");
        return Ok(());
    }
    for checkpoint in trail {
        println!(
            "{} {} [{}] {:.1}ms",
            checkpoint.timestamp.to_rfc3339(),
            checkpoint.stage,
            checkpoint.status.as_str(),
            checkpoint.execution_time_ms
        );
        println!("  output: {}", checkpoint.output);
    }
    Ok(())
}
