use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use client_core::{
    config::{load_settings, load_settings_from},
    ChatCore, ChatError, ComposeDraft, SyncEvent, SyncSignal,
};
use futures::StreamExt;
use shared::{domain::UserId, protocol::UserProfile};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Runs two participants against one store and prints what each sees.
#[derive(Parser, Debug)]
struct Args {
    /// Settings file; defaults to `chat.toml` in the working directory.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    database_url: Option<String>,
    #[arg(long, default_value = "alice")]
    first: String,
    #[arg(long, default_value = "bob")]
    second: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let mut settings = match &args.config {
        Some(path) => load_settings_from(path)?,
        None => load_settings(),
    };
    if let Some(database_url) = args.database_url {
        settings.database_url = database_url;
    }
    let core = ChatCore::open(settings).await?;

    let first = UserId::new(args.first.as_str());
    let second = UserId::new(args.second.as_str());
    for user in [&first, &second] {
        core.directory
            .provision(&UserProfile::new(user.clone(), user.as_str()))
            .await
            .with_context(|| format!("failed to provision {user}"))?;
    }

    let chat_id = match core.index.create_conversation(&first, &second).await {
        Ok(chat_id) => chat_id,
        Err(ChatError::AlreadyExists { .. }) => core
            .index
            .conversations(&first)
            .await?
            .into_iter()
            .find(|item| item.counterpart.id == second)
            .map(|item| item.summary.chat_id)
            .context("conversation reported as existing but not listed")?,
        Err(err) => return Err(err.into()),
    };
    let first_view = core.index.select_conversation(&first, &chat_id).await?;
    let second_view = core.index.select_conversation(&second, &chat_id).await?;
    println!("conversation {chat_id} between {first} and {second}");

    let mut watch = core.sync.watch_conversation(&first_view.context);
    let mut blocks = core.blocks.changes_for(&first);

    let mut draft = ComposeDraft {
        text: format!("hello {first}"),
        attachment: None,
    };
    core.sessions.send_draft(&second_view.context, &mut draft).await?;
    core.sessions
        .send_message(&first_view.context, &format!("hi {second}"), None)
        .await?;

    core.blocks.toggle_block(&first, &second).await?;
    if let Some(change) = blocks.next().await {
        println!("{} now sees {:?}", change.viewer, change.state);
    }
    let mut draft = ComposeDraft {
        text: "are you there?".into(),
        attachment: None,
    };
    match core.sessions.send_draft(&second_view.context, &mut draft).await {
        Err(ChatError::Blocked { .. }) => {
            println!("{second} is blocked; draft kept: {:?}", draft.text)
        }
        other => warn!(?other, "expected the send to be blocked"),
    }
    core.blocks.toggle_block(&first, &second).await?;

    while let Ok(Some(event)) =
        tokio::time::timeout(Duration::from_millis(200), watch.next_event()).await
    {
        match event {
            SyncEvent::ConversationUpdated(doc) => {
                println!("{first} sees {} message(s)", doc.messages.len())
            }
            SyncEvent::Signal(SyncSignal::NewInboundMessage(message)) => {
                println!("{first} notified: {} says {:?}", message.sender_id, message.text)
            }
            SyncEvent::Signal(SyncSignal::ScrollToEnd) => println!("{first} scrolls to end"),
            SyncEvent::IndexUpdated(_) => {}
            SyncEvent::Degraded => warn!("conversation feed degraded"),
        }
    }
    watch.unsubscribe();

    for item in core.index.conversations(&second).await? {
        println!(
            "{second}'s list: {} | {} | seen={}",
            item.display_name(),
            item.display_preview(),
            item.summary.is_seen
        );
    }
    info!("console: done");
    Ok(())
}
