use anyhow::Result;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, warn};

use investigation_engine::services::{EmbeddingProvider, HttpCompletionProvider, HttpEmbeddingProvider};
use investigation_engine::utils::logger::init_logger;
use investigation_engine::{ActivityLogger, ConversationController, NextQuestion, Settings, TurnOutcome};

const HELP: &str = "\
commands:
  /skip                       skip the current category
  /edit <exchange_id> <text>  replace an earlier answer
  /context <query>            show retrieved context
  /history                    list recorded exchanges
  /save                       write a checkpoint
  /load <session_id>          resume a saved session
  /sessions                   list saved checkpoints
  /quit                       exit
anything else is taken as the answer to the current question";

fn show(question: &NextQuestion) {
    let tag = if question.is_followup { " (follow-up)" } else { "" };
    println!("\n[{}{}] {}", question.state, tag, question.prompt);
}

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::load()?;
    std::fs::create_dir_all(&settings.storage.log_dir)?;
    init_logger(&settings.storage.log_dir)?;

    info!("Starting investigation engine");

    let embedder: Arc<dyn EmbeddingProvider> = Arc::new(HttpEmbeddingProvider::new(&settings.embedding));
    let logger = ActivityLogger::from_settings(&settings.activity);
    let mut controller = ConversationController::new(&settings, embedder, logger);
    if settings.completion.enabled {
        let completion = HttpCompletionProvider::new(
            &settings.completion,
            settings.controller.external_timeout(),
        );
        controller = controller.with_completion_provider(Arc::new(completion));
    }

    let (mut session_id, first) = controller.start_session().await?;
    println!("session {}\n{}", session_id, HELP);
    show(&first);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
        let result = match command {
            "/quit" => break,
            "/skip" => controller.skip(&session_id).await.map(Some),
            "/edit" => match rest.split_once(' ') {
                Some((exchange_id, text)) => controller
                    .edit(&session_id, exchange_id, text)
                    .await
                    .map(|_| {
                        println!("edited {}", exchange_id);
                        None
                    }),
                None => {
                    println!("usage: /edit <exchange_id> <text>");
                    Ok(None)
                }
            },
            "/context" => {
                let top_k = settings.retrieval.top_k;
                let max_tokens = settings.retrieval.max_tokens;
                controller
                    .get_context(&session_id, rest, top_k, max_tokens)
                    .await
                    .map(|chunks| {
                        for chunk in chunks {
                            println!("---\n{}", chunk);
                        }
                        None
                    })
            }
            "/history" => controller.history(&session_id).await.map(|exchanges| {
                for e in exchanges {
                    println!("{} [{}] {}\n  {}", e.id, e.category_label(), e.question, e.answer);
                }
                None
            }),
            "/save" => controller.save_session(&session_id).await.map(|_| {
                println!("saved {}", session_id);
                None
            }),
            "/load" => match controller.load_session(rest).await {
                Ok((session, exchanges)) => {
                    session_id = session.id.clone();
                    println!("resumed {} at {} ({} exchanges)", session.id, session.state, exchanges.len());
                    controller
                        .current_question(&session_id)
                        .await
                        .map(|q| q.map(TurnOutcome::Question).or(Some(TurnOutcome::Complete)))
                }
                Err(e) => Err(e),
            },
            "/sessions" => controller.list_checkpoints().await.map(|list| {
                for s in list {
                    println!("{}  {}  {} exchanges  saved {}", s.id, s.state, s.exchange_count, s.saved_at);
                }
                None
            }),
            "/help" => {
                println!("{}", HELP);
                Ok(None)
            }
            _ => controller.process_answer(&session_id, line).await.map(Some),
        };

        match result {
            Ok(Some(TurnOutcome::Question(q))) => show(&q),
            Ok(Some(TurnOutcome::Complete)) => println!("\ninvestigation complete"),
            Ok(None) => {}
            Err(e) => {
                warn!("Command failed: {}", e);
                println!("error: {}", e);
            }
        }
    }

    if let Err(e) = controller.save_session(&session_id).await {
        warn!("Final checkpoint failed: {}", e);
    }
    Ok(())
}
