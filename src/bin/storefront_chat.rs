use anyhow::Result;
use std::io::Write;
use storefront_assistant::api::{ApiClient, BackendClient};
use storefront_assistant::config::Config;
use storefront_assistant::describe::{Describer, ProductDetails};
use storefront_assistant::recommend::Recommender;
use storefront_assistant::state::{Author, AssemblerUpdate, ChatSession, EntryStatus};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

const HELP: &str = "Commands: /refresh reloads store data, /recommend suggests products, \
/describe <image url> | <name> [| category] [| description] writes product copy, /quit exits. \
Ctrl-C stops the current reply.";

/// Prints a streaming reply incrementally. Rendering is recomputed over the
/// whole reply on every delta, so only a suffix that extends what is already
/// on screen can be printed in place.
#[derive(Default)]
struct ReplyPrinter {
    printed: String,
    diverged: bool,
}

impl ReplyPrinter {
    fn show(&mut self, rendered: &str) -> Result<()> {
        if self.diverged {
            return Ok(());
        }
        match rendered.strip_prefix(self.printed.as_str()) {
            Some(suffix) => {
                print!("{suffix}");
                std::io::stdout().flush()?;
                self.printed = rendered.to_string();
            }
            None => self.diverged = true,
        }
        Ok(())
    }

    fn finish(&mut self, final_text: &str) {
        if self.printed != final_text {
            if !self.printed.is_empty() {
                println!();
            }
            print!("{final_text}");
        }
        println!();
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn run_turn(session: &mut ChatSession, utterance: &str) -> Result<()> {
    let Some(turn) = session.start_turn(utterance) else {
        return Ok(());
    };
    let entry_index = turn.entry_index();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(turn.run(tx));

    let mut printer = ReplyPrinter::default();
    print!("assistant> ");
    std::io::stdout().flush()?;

    loop {
        tokio::select! {
            update = rx.recv() => match update {
                Some(update) => {
                    session.apply_update(entry_index, &update);
                    if let AssemblerUpdate::Delta(rendered) = &update {
                        printer.show(rendered)?;
                    }
                }
                None => break,
            },
            signal = tokio::signal::ctrl_c(), if session.is_turn_in_progress() => {
                signal?;
                session.cancel();
            }
        }
    }

    let finished = handle.await?;
    session.finish_turn(finished);

    let entries = &session.messages()[entry_index..];
    if let Some(reply) = entries.first() {
        printer.finish(&reply.text);
        if reply.status == EntryStatus::Cancelled {
            println!("(reply stopped)");
        }
    }
    for notice in entries.iter().skip(1) {
        if notice.author == Author::System {
            println!("! {}", notice.text);
        }
    }
    Ok(())
}

async fn recommend(session: &ChatSession) {
    let snapshot = session.cache().snapshot();
    let recommender = Recommender::new(session.client());
    let ids = recommender
        .recommend(&snapshot, session.viewer().id.as_deref())
        .await;
    if ids.is_empty() {
        println!("No recommendations available.");
        return;
    }
    for id in ids {
        println!("  /producto/{id}");
    }
}

fn parse_product(args: &str) -> ProductDetails {
    let mut fields = args.split('|').map(str::trim);
    let mut next = || fields.next().filter(|f| !f.is_empty()).map(str::to_string);
    ProductDetails {
        image_url: next().unwrap_or_default(),
        name: next().unwrap_or_default(),
        category: next(),
        description: next(),
    }
}

async fn describe(describer: &Describer, args: &str) {
    match describer.describe(&parse_product(args)).await {
        Ok(description) => println!("{description}"),
        Err(error) => println!("! {error}"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Config::load()?;
    config.validate()?;

    let backend = BackendClient::new(&config)?;
    let client = ApiClient::new(&config)?;
    let model = client.model().to_string();
    let mut session = ChatSession::new(&config, client);
    let describer = Describer::new(session.client(), config.idle_timeout)?;
    if !session.refresh_data(&backend).await {
        if let Some(notice) = session.messages().last() {
            println!("! {}", notice.text);
        }
    }

    println!(
        "Storefront assistant ({model}, {} viewer {}). {HELP}",
        session.viewer().role,
        session.viewer().label()
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };

        match line.trim() {
            "" => continue,
            "/quit" | "/exit" => break,
            "/help" => println!("{HELP}"),
            "/refresh" => {
                session.invalidate_data();
                if session.refresh_data(&backend).await {
                    println!("Store data reloaded.");
                } else if let Some(notice) = session.messages().last() {
                    println!("! {}", notice.text);
                }
            }
            "/recommend" => recommend(&session).await,
            command if command.starts_with("/describe") => {
                describe(&describer, &command["/describe".len()..]).await
            }
            utterance => run_turn(&mut session, utterance).await?,
        }
    }

    Ok(())
}
