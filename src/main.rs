use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use colloquy::models::{Message, MessageStatus, Model, Topic};
use colloquy::providers::{AiProvider, ProviderRegistry};
use colloquy::services::{
    AssistantService, Database, FileManager, MessageStore, Orchestrator, SendOptions,
    SettingsService, SharedSettings, TopicManager, TopicNamer,
};

#[derive(Parser)]
#[command(name = "colloquy")]
#[command(about = "Chat with several AI providers from the terminal")]
struct Cli {
    /// Database file (defaults to $XDG_DATA_HOME/colloquy/colloquy.db)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a message and print the answers
    Send {
        content: String,
        /// Topic id; defaults to the newest topic of the default assistant
        #[arg(long, short = 't')]
        topic: Option<String>,
        /// Start a new topic
        #[arg(long, conflicts_with = "topic")]
        new: bool,
        /// provider:model to answer with; repeat to ask several models
        #[arg(long = "model", short = 'm', value_parser = parse_model)]
        models: Vec<Model>,
        /// Attach a file
        #[arg(long = "file", short = 'f')]
        files: Vec<PathBuf>,
    },

    /// Generate an answer again
    Resend {
        topic: String,
        message: String,
        /// Add another answer instead of replacing this one
        #[arg(long)]
        mention: bool,
    },

    /// List topics with their message counts
    Topics,

    /// Print a topic's messages
    Show { topic: String },

    /// Rename a topic
    Rename { topic: String, name: String },

    /// Delete a topic with its messages and files
    Delete { topic: String },

    /// List the models each configured provider offers
    Models,

    /// Check that a model answers with the configured credentials
    Check {
        #[arg(value_parser = parse_model)]
        model: Model,
    },
}

fn parse_model(s: &str) -> Result<Model, String> {
    Model::parse_qualified(s).ok_or_else(|| format!("expected provider:model, got {:?}", s))
}

struct Services {
    assistants: Arc<AssistantService>,
    topics: TopicManager,
    messages: Arc<MessageStore>,
    providers: Arc<ProviderRegistry>,
    orchestrator: Orchestrator,
}

impl Services {
    async fn open(path: Option<PathBuf>) -> Result<Self> {
        let db = Database::open(path).await?;
        let settings = SharedSettings::new(SettingsService::load(&db).await);
        let files = FileManager::new(db.clone());
        let assistants = Arc::new(AssistantService::load(db.clone()).await?);
        let topics = TopicManager::new(Arc::new(db.clone()), files.clone());
        let messages = Arc::new(MessageStore::new(Arc::new(db.clone()), files));
        let providers = Arc::new(ProviderRegistry::from_configs(&settings.get().providers));
        let namer = Arc::new(TopicNamer::new(
            providers.clone(),
            assistants.clone(),
            messages.clone(),
            settings.clone(),
        ));
        let orchestrator = Orchestrator::new(
            messages.clone(),
            providers.clone(),
            namer,
            settings,
            None,
        );

        Ok(Self {
            assistants,
            topics,
            messages,
            providers,
            orchestrator,
        })
    }

    fn topic(&self, topic_id: &str) -> Result<Topic> {
        self.assistants
            .find_topic(topic_id)
            .with_context(|| format!("Topic {} not found", topic_id))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let services = Services::open(cli.db).await?;

    match cli.command {
        Commands::Send {
            content,
            topic,
            new,
            models,
            files,
        } => send(&services, content, topic, new, models, files).await,
        Commands::Resend {
            topic,
            message,
            mention,
        } => resend(&services, &topic, &message, mention).await,
        Commands::Topics => list_topics(&services).await,
        Commands::Show { topic } => show_topic(&services, &topic).await,
        Commands::Rename { topic, name } => {
            let topic = services.assistants.rename_topic(&topic, &name).await?;
            println!("{}  {}", topic.id, topic.name);
            Ok(())
        }
        Commands::Delete { topic } => {
            services.assistants.remove_topic(&topic, &services.topics).await?;
            println!("Deleted {}", topic);
            Ok(())
        }
        Commands::Models => list_models(&services).await,
        Commands::Check { model } => {
            let provider = services.providers.for_model(&model)?;
            provider.check(&model).await?;
            println!("{}:{} ok", model.provider, model.id);
            Ok(())
        }
    }
}

async fn send(
    services: &Services,
    content: String,
    topic_id: Option<String>,
    new: bool,
    models: Vec<Model>,
    files: Vec<PathBuf>,
) -> Result<()> {
    let topic = match topic_id {
        Some(id) => services.topic(&id)?,
        None if new => {
            let topic = AssistantService::default_topic(colloquy::config::DEFAULT_ASSISTANT_ID);
            services.assistants.add_topic(topic.clone()).await?;
            topic
        }
        None => services
            .assistants
            .get(colloquy::config::DEFAULT_ASSISTANT_ID)
            .and_then(|a| a.topics.first().cloned())
            .context("The default assistant has no topics")?,
    };
    let mut assistant = services
        .assistants
        .get(&topic.assistant_id)
        .with_context(|| format!("Assistant {} not found", topic.assistant_id))?;

    let mut message = Message::user(&assistant.id, &topic.id, &content);
    for path in &files {
        message.files.push(services.messages.files().upload_path(path).await?);
    }

    let mut options = SendOptions::default();
    match models.len() {
        0 => {}
        1 => assistant = assistant.with_model(models.into_iter().next()),
        _ => {
            message.mentions = models.clone();
            options.mentions = models;
        }
    }

    if !services.messages.prepare_topic(&topic).await {
        bail!("Could not load topic {}", topic.id);
    }
    let answers = services
        .orchestrator
        .send_message(message, &assistant, &topic, options)
        .await;
    print_answers(services, &topic.id, &answers);
    services.orchestrator.wait_for_background_tasks().await;
    Ok(())
}

async fn resend(services: &Services, topic_id: &str, message_id: &str, mention: bool) -> Result<()> {
    let topic = services.topic(topic_id)?;
    let assistant = services
        .assistants
        .get(&topic.assistant_id)
        .with_context(|| format!("Assistant {} not found", topic.assistant_id))?;
    services.messages.prepare_topic(&topic).await;
    let message = services
        .messages
        .topic_messages(topic_id)
        .into_iter()
        .find(|m| m.id == message_id)
        .with_context(|| format!("Message {} not found", message_id))?;

    let answers = services
        .orchestrator
        .resend_message(&message, &assistant, &topic, mention)
        .await?;
    print_answers(services, topic_id, &answers);
    services.orchestrator.wait_for_background_tasks().await;
    Ok(())
}

fn print_answers(services: &Services, topic_id: &str, answers: &[String]) {
    let messages = services.messages.topic_messages(topic_id);
    for id in answers {
        let Some(answer) = messages.iter().find(|m| &m.id == id) else {
            continue;
        };
        let model = answer
            .model
            .as_ref()
            .map(|m| format!("{}:{}", m.provider, m.id))
            .unwrap_or_default();
        println!("[{}] {}", model, answer.id);
        match answer.status {
            MessageStatus::Error => println!(
                "error: {}",
                answer.error.as_ref().map(|e| e.message.as_str()).unwrap_or("unknown")
            ),
            _ => println!("{}", answer.content),
        }
        if let Some(total) = answer.usage.as_ref().and_then(|u| u.total_tokens) {
            println!("({} tokens)", total);
        }
        println!();
    }
}

async fn list_topics(services: &Services) -> Result<()> {
    for assistant in services.assistants.assistants() {
        println!("{}", assistant.name);
        for topic in &assistant.topics {
            let count = services.topics.get_topic_messages(&topic.id).await?.len();
            println!("  {}  {}  ({} messages)", topic.id, topic.name, count);
        }
    }
    Ok(())
}

async fn show_topic(services: &Services, topic_id: &str) -> Result<()> {
    let topic = services.topic(topic_id)?;
    services.messages.prepare_topic(&topic).await;
    if let Some(error) = services.messages.error(topic_id) {
        bail!(error);
    }
    println!("{}\n", topic.name);
    for message in services.messages.topic_messages(topic_id) {
        println!("{} [{}] {:?}", message.role.as_str(), message.id, message.status);
        println!("{}\n", message.content);
    }
    Ok(())
}

async fn list_models(services: &Services) -> Result<()> {
    let ids = services.providers.ids();
    if ids.is_empty() {
        println!("No providers configured");
        return Ok(());
    }
    for id in ids {
        let provider = services.providers.get(&id)?;
        match provider.models().await {
            Ok(models) => {
                println!("{}", id);
                for model in models {
                    println!("  {}:{}  {}", id, model.id, model.name);
                }
            }
            Err(e) => println!("{}: {}", id, e),
        }
    }
    Ok(())
}
