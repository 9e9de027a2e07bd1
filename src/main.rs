use anyhow::Result;
use premise2novel::config::Config;
use premise2novel::llm;
use premise2novel::setup;
use premise2novel::workflow::WorkflowManager;
use std::path::PathBuf;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match Config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config: {:#}", e);
            eprintln!("Please ensure 'config.yml' exists with valid LLM settings.");
            return Err(e);
        }
    };

    config.ensure_directories()?;

    // Optional positional argument: path to the book description.
    let book_path = std::env::args().nth(1).map(PathBuf::from);
    let spec = setup::load_or_prompt_book(&config, book_path.as_deref())?;
    spec.validate(&config.generation)?;

    let llm = llm::create_llm(&config)?;

    let manager = WorkflowManager::new(config, llm);
    let path = manager.run(&spec).await?;
    println!("Manuscript written to {}", path.display());

    Ok(())
}
