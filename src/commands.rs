//! Command handlers for the hosted backend.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio_stream::StreamExt;

use crate::auth::firebase::FirebaseAuth;
use crate::auth::TokenStore;
use crate::backend::client::FirebaseClient;
use crate::backend::firestore::Firestore;
use crate::backend::storage::FirebaseStorage;
use crate::chat::{ChatClient, LocalFile, SessionState};
use crate::config::Config;
use crate::models::{Identity, Message};

/// How long `users` waits for the first roster snapshot.
const ROSTER_TIMEOUT: Duration = Duration::from_secs(15);

/// Wire a chat client to the hosted backend described by `config`.
fn connect(config: Config) -> Result<ChatClient> {
    let settings = config.backend()?;
    let auth = Arc::new(FirebaseAuth::new(config)?);
    let client = FirebaseClient::new(Arc::clone(&auth));
    let store = Arc::new(Firestore::new(
        client.clone(),
        settings.project_id,
        settings.poll_interval,
    ));
    let files = Arc::new(FirebaseStorage::new(client, settings.storage_bucket));
    Ok(ChatClient::new(auth, store, files))
}

/// Connect and wait until the stored session has been restored.
async fn start() -> Result<ChatClient> {
    let mut chat = connect(Config::load()?)?;
    chat.start().await?;
    Ok(chat)
}

fn signed_in(chat: &ChatClient) -> Result<Identity> {
    chat.session
        .current()
        .context("Not signed in. Run 'cause-chat login' first.")
}

fn settled(state: &SessionState) -> bool {
    matches!(state, SessionState::SignedIn(_) | SessionState::Failed(_))
}

async fn wait_signed_in(chat: &ChatClient) -> Result<Identity> {
    let mut state = chat.session.watch_state();
    let ready = state
        .wait_for(settled)
        .await
        .context("Session closed before sign-in completed")?;
    match &*ready {
        SessionState::SignedIn(identity) => Ok(identity.clone()),
        SessionState::Failed(reason) => bail!("Session failed: {}", reason),
        _ => bail!("Sign-in did not complete"),
    }
}

/// Update backend settings.
pub fn configure(
    api_key: Option<String>,
    project_id: Option<String>,
    bucket: Option<String>,
    poll_ms: Option<u64>,
) -> Result<()> {
    let mut config = Config::load()?;
    if api_key.is_some() {
        config.api_key = api_key;
    }
    if project_id.is_some() {
        config.project_id = project_id;
    }
    if bucket.is_some() {
        config.storage_bucket = bucket;
    }
    if poll_ms.is_some() {
        config.poll_interval_ms = poll_ms;
    }
    config.save()?;

    match config.backend() {
        Ok(settings) => {
            println!("Project:  {}", settings.project_id);
            println!("Bucket:   {}", settings.storage_bucket);
            println!("Polling:  {} ms", settings.poll_interval.as_millis());
        }
        Err(e) => println!("Saved. Still incomplete: {:#}", e),
    }
    Ok(())
}

pub async fn signup(email: &str, password: &str, name: &str) -> Result<()> {
    let chat = start().await?;
    let result = create_account(&chat, email, password, name).await;
    chat.finish(result).await
}

async fn create_account(chat: &ChatClient, email: &str, password: &str, name: &str) -> Result<()> {
    let user = chat.session.sign_up(email, password, name).await?;
    let me = wait_signed_in(chat).await?;
    println!("Created account {} ({})", me.label(), user.uid);
    Ok(())
}

pub async fn login(email: &str, password: &str) -> Result<()> {
    let chat = start().await?;
    let result = sign_in(&chat, email, password).await;
    chat.finish(result).await
}

async fn sign_in(chat: &ChatClient, email: &str, password: &str) -> Result<()> {
    chat.session.sign_in(email, password).await?;
    let me = wait_signed_in(chat).await?;
    println!("Signed in as {} ({})", me.label(), me.id);
    Ok(())
}

/// Mark the account offline and clear stored credentials.
pub async fn logout() -> Result<()> {
    let config = Config::load()?;
    if config.stored_user().is_none() {
        let mut config = config;
        config.clear_tokens();
        config.save()?;
        println!("Logged out.");
        return Ok(());
    }

    let mut chat = connect(config)?;
    chat.start().await?;
    let result = sign_out(&chat).await;
    chat.finish(result).await?;
    println!("Logged out.");
    Ok(())
}

async fn sign_out(chat: &ChatClient) -> Result<()> {
    chat.session.sign_out().await?;
    let mut state = chat.session.watch_state();
    let done = state
        .wait_for(|s| matches!(s, SessionState::SignedOut | SessionState::Failed(_)))
        .await
        .context("Session closed before sign-out completed")?;
    if let SessionState::Failed(ref reason) = *done {
        bail!("Session failed: {}", reason);
    }
    Ok(())
}

/// Show configuration and credential state without touching the network.
pub fn status() -> Result<()> {
    let config = Config::load()?;

    match config.backend() {
        Ok(settings) => {
            println!("Project:     {}", settings.project_id);
            println!("Bucket:      {}", settings.storage_bucket);
        }
        Err(e) => println!("Backend:     not configured ({:#})", e),
    }

    match config.stored_user() {
        Some(user) => {
            let name = user.display_name.as_deref().unwrap_or("-");
            println!("Account:     {} ({})", name, user.uid);
        }
        None => println!("Account:     signed out"),
    }

    match config.get_id_token() {
        Some(token) if !token.is_expired() => {
            println!("ID token:    valid");
            if let Some(exp) = token.expires_at {
                println!("  expires_at: {}", exp);
            }
        }
        Some(_) => println!("ID token:    expired"),
        None => println!("ID token:    none"),
    }

    match config.get_refresh_token() {
        Some(_) => println!("Refresh tok: present"),
        None => println!("Refresh tok: none"),
    }

    Ok(())
}

/// Print the roster with online markers.
pub async fn users() -> Result<()> {
    let mut chat = start().await?;
    let result = print_users(&mut chat).await;
    chat.finish(result).await
}

async fn print_users(chat: &mut ChatClient) -> Result<()> {
    let me = signed_in(chat)?;

    let mut roster = chat.session.watch_roster();
    tokio::select! {
        arrived = tokio::time::timeout(ROSTER_TIMEOUT, roster.wait_for(|r| !r.is_empty())) => {
            arrived
                .context("Timed out waiting for the user list")?
                .context("Session closed before the user list arrived")?;
        }
        closed = chat.session_closed() => {
            closed?;
            bail!("Session ended before the user list arrived");
        }
    }

    println!("\nUsers:");
    println!("{:-<60}", "");
    for identity in chat.session.roster() {
        let marker = if identity.online { "*" } else { " " };
        let you = if identity.id == me.id { " (you)" } else { "" };
        println!("{} {}{}", marker, identity.label(), you);
        println!("  ID: {}", identity.id);
    }
    println!("\n{} online besides you", chat.session.online_others().len());
    Ok(())
}

pub async fn groups() -> Result<()> {
    let chat = start().await?;
    let result = print_groups(&chat).await;
    chat.finish(result).await
}

async fn print_groups(chat: &ChatClient) -> Result<()> {
    signed_in(chat)?;
    let groups = chat.groups.list_groups().await?;

    println!("\nGroups:");
    println!("{:-<60}", "");

    if groups.is_empty() {
        println!("  (no groups found)");
    }
    for group in &groups {
        println!("{}", group.name);
        println!("  ID: {}", group.id);
        println!("  Members: {}", group.members.len());
        if let Some(ref preview) = group.last_message {
            if !preview.trim().is_empty() {
                println!("  Last: {}", preview.trim());
            }
        }
        println!();
    }
    Ok(())
}

pub async fn create_group(name: &str, members: Vec<String>) -> Result<()> {
    let chat = start().await?;
    let result = new_group(&chat, name, members).await;
    chat.finish(result).await
}

async fn new_group(chat: &ChatClient, name: &str, members: Vec<String>) -> Result<()> {
    signed_in(chat)?;
    let id = chat.groups.create_group(name, members).await?;
    println!("Created group {} ({})", name.trim(), id);
    Ok(())
}

pub async fn send(group_id: &str, text: &str, attach: Vec<PathBuf>) -> Result<()> {
    let mut files = Vec::with_capacity(attach.len());
    for path in &attach {
        files.push(LocalFile::read(path).await?);
    }

    let chat = start().await?;
    let result = send_message(&chat, group_id, text, files).await;
    chat.finish(result).await
}

async fn send_message(chat: &ChatClient, group_id: &str, text: &str, files: Vec<LocalFile>) -> Result<()> {
    signed_in(chat)?;
    match chat.composer.send(group_id, text, files).await? {
        Some(id) => println!("Message sent ({}).", id),
        None => println!("Nothing to send."),
    }
    Ok(())
}

fn print_message(msg: &Message, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(msg)?);
        return Ok(());
    }
    let time = msg.timestamp.format("%Y-%m-%d %H:%M:%S");
    if msg.text.is_empty() {
        println!("[{}] {}:", time, msg.sender_name);
    } else {
        println!("[{}] {}: {}", time, msg.sender_name, msg.text);
    }
    for att in &msg.attachments {
        println!("    [{}] {} ({} bytes) {}", att.kind.as_str(), att.name, att.size, att.url);
    }
    Ok(())
}

/// Follow a group's feed until interrupted.
pub async fn watch(group_id: &str, json: bool) -> Result<()> {
    let mut chat = start().await?;
    let result = follow_feed(&mut chat, group_id, json).await;
    chat.finish(result).await
}

async fn follow_feed(chat: &mut ChatClient, group_id: &str, json: bool) -> Result<()> {
    let me = signed_in(chat)?;
    let group = chat.groups.get(group_id).await?;
    if !group.is_member(&me.id) {
        bail!("You are not a member of {}", group.name);
    }
    if !json {
        println!("Watching {} (Ctrl-C to stop)", group.name);
    }

    let mut feed = chat.feed.subscribe(group_id);
    let mut seen: HashSet<String> = HashSet::new();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            closed = chat.session_closed() => {
                closed?;
                break;
            }
            item = feed.next() => match item {
                Some(Ok(list)) => {
                    for msg in list.iter().filter(|m| !seen.contains(&m.id)) {
                        print_message(msg, json)?;
                    }
                    seen.extend(list.into_iter().map(|m| m.id));
                }
                Some(Err(e)) => return Err(e).context("Feed failed"),
                None => break,
            },
        }
    }

    feed.unsubscribe();
    Ok(())
}
