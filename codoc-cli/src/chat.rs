//! Interactive chat loop.

use std::io::Write;
use std::sync::Arc;

use anyhow::Result;
use chrono::{Local, Utc};
use codoc_chat::{
    ApiClient, ChatController, ConversationStatus, Message, RateLimitGovernor, SendOutcome,
    SessionChange, SessionPatch, SessionStore, StaticToken,
};
use codoc_common::Config;
use tokio::io::{self, AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;

use crate::render::ReplyPrinter;

const HELP: &str = "Commands:\n  /reset  start this problem over\n  /help   show this help\n  /quit   leave the chat\nPress Ctrl-C while a reply streams to stop it.";

pub async fn run(config: &Config, problem_id: &str, message: Option<String>) -> Result<()> {
    let credentials = Arc::new(StaticToken::new(config.api.access_token.clone()));
    let api = ApiClient::new(&config.api, credentials, RateLimitGovernor::new())?;
    let chat = ChatController::new(api, SessionStore::new(), &config.chat);

    let mut lines = BufReader::new(io::stdin()).lines();

    chat.open(problem_id);
    print_intro(&chat, problem_id);

    if let Some(text) = message {
        turn(&chat, problem_id, &text, &mut lines).await?;
        chat.leave_study_flow();
        return Ok(());
    }

    prompt();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim().to_string();
        match line.as_str() {
            "" => {}
            "/quit" | "/exit" => break,
            "/help" => println!("{HELP}"),
            "/reset" => {
                chat.reset(problem_id);
                chat.store().patch(
                    problem_id,
                    SessionPatch::new().messages(vec![Message::intro()]),
                );
                print_intro(&chat, problem_id);
            }
            text => turn(&chat, problem_id, text, &mut lines).await?,
        }
        prompt();
    }

    chat.leave_study_flow();
    Ok(())
}

/// Send one turn and follow its reply to the end.
async fn turn(
    chat: &ChatController,
    problem_id: &str,
    text: &str,
    lines: &mut Lines<BufReader<Stdin>>,
) -> Result<()> {
    rate_limit_gate(chat, lines).await?;

    let user_index = chat
        .store()
        .get(problem_id)
        .map_or(0, |session| session.messages.len());
    let mut printer = ReplyPrinter::new(user_index);
    let mut changes = chat.store().subscribe();

    chat.set_draft(problem_id, text);
    match chat.send(problem_id).await {
        SendOutcome::Ignored => println!("(a reply is still in progress)"),
        SendOutcome::Completed => println!("(done)"),
        SendOutcome::RateLimited(notice) => println!("⚠️  {notice}"),
        SendOutcome::Failed => print_error(chat, problem_id),
        SendOutcome::Streaming { conversation_id } => {
            debug!(conversation_id = %conversation_id, "Following reply");
            follow(chat, problem_id, &mut printer, &mut changes).await?;
            if printer.has_output() {
                println!();
            }
            print_error(chat, problem_id);
        }
    }
    Ok(())
}

async fn follow(
    chat: &ChatController,
    problem_id: &str,
    printer: &mut ReplyPrinter,
    changes: &mut tokio::sync::broadcast::Receiver<SessionChange>,
) -> Result<()> {
    let idle = chat.wait_idle(problem_id);
    tokio::pin!(idle);

    loop {
        tokio::select! {
            () = &mut idle => break,
            _ = tokio::signal::ctrl_c() => {
                if chat.stop(problem_id) {
                    println!("\n(stopped)");
                }
            }
            change = changes.recv() => match change {
                Ok(SessionChange::Updated(key)) if key == problem_id => {
                    write_delta(chat, problem_id, printer)?;
                }
                Ok(_) => {}
                Err(RecvError::Lagged(_)) => write_delta(chat, problem_id, printer)?,
                Err(RecvError::Closed) => break,
            },
        }
    }

    write_delta(chat, problem_id, printer)
}

fn write_delta(chat: &ChatController, problem_id: &str, printer: &mut ReplyPrinter) -> Result<()> {
    let Some(session) = chat.store().get(problem_id) else {
        return Ok(());
    };
    if let Some(delta) = printer.delta(&session) {
        let mut stdout = std::io::stdout().lock();
        stdout.write_all(delta.as_bytes())?;
        stdout.flush()?;
    }
    Ok(())
}

/// Hold the conversation while the global rate limit is engaged.
async fn rate_limit_gate(chat: &ChatController, lines: &mut Lines<BufReader<Stdin>>) -> Result<()> {
    let governor = chat.governor();
    if !governor.is_limited() {
        return Ok(());
    }

    match governor.get().retry_at {
        Some(at) if at > Utc::now() => println!(
            "⏳ Too many requests. You can retry after {}.",
            at.with_timezone(&Local).format("%H:%M:%S")
        ),
        _ => println!("⏳ Too many requests. Please try again."),
    }
    println!("Press Enter to continue.");

    lines.next_line().await?;
    governor.clear();
    Ok(())
}

fn print_intro(chat: &ChatController, problem_id: &str) {
    if let Some(session) = chat.store().get(problem_id) {
        if let [intro] = session.messages.as_slice() {
            println!("{}\n", intro.content);
        }
    }
}

fn print_error(chat: &ChatController, problem_id: &str) {
    let Some(session) = chat.store().get(problem_id) else {
        return;
    };
    if let Some(error) = session.last_error {
        println!("❌ {error}");
    } else if session.status == ConversationStatus::Idle {
        debug!(problem_id = %problem_id, "Turn stopped");
    }
}

fn prompt() {
    print!("> ");
    let _ = std::io::stdout().flush();
}
