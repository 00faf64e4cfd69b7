//! Offline walkthrough against the in-memory backend.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::auth::memory::MemoryAuth;
use crate::auth::AuthUser;
use crate::backend::memory::{MemoryFiles, MemoryStore};
use crate::chat::{ActiveFeed, ChatClient, LocalFile};
use crate::models::Message;

const FEED_TIMEOUT: Duration = Duration::from_secs(5);

async fn join(store: &Arc<MemoryStore>, files: &Arc<MemoryFiles>, user: AuthUser) -> Result<ChatClient> {
    let auth = Arc::new(MemoryAuth::signed_in(user));
    let mut chat = ChatClient::new(auth, store.clone(), files.clone());
    chat.start().await?;
    Ok(chat)
}

fn group_names(list: &[crate::models::Group]) -> String {
    if list.is_empty() {
        return "(none)".to_string();
    }
    list.iter()
        .map(|g| g.name.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

fn describe(msg: &Message) -> String {
    let kinds: Vec<&str> = msg.attachments.iter().map(|a| a.kind.as_str()).collect();
    format!(
        "{} ({}): {:?} attachments={:?}",
        msg.sender_name, msg.sender_id, msg.text, kinds
    )
}

async fn wait_for_len(feed: &mut ActiveFeed, len: usize) -> Result<Vec<Message>> {
    while let Some(item) = feed.next().await {
        let list = item?;
        if list.len() == len {
            return Ok(list);
        }
    }
    bail!("feed closed early")
}

pub async fn run() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let files = Arc::new(MemoryFiles::new());

    let a = join(&store, &files, AuthUser::new("alice").with_name("Alice")).await?;
    let b = join(&store, &files, AuthUser::new("bob").with_name("Bob")).await?;
    let c = join(&store, &files, AuthUser::new("carol").with_name("Carol")).await?;

    let group = a.groups.create_group("Volunteers", ["bob"]).await?;
    println!("Alice created \"Volunteers\" ({}) with Bob", group);

    println!("\nGroups visible to:");
    println!("  Alice: {}", group_names(&a.groups.list_groups().await?));
    println!("  Bob:   {}", group_names(&b.groups.list_groups().await?));
    println!("  Carol: {}", group_names(&c.groups.list_groups().await?));

    let mut feed = ActiveFeed::new(b.feed.clone());
    feed.select(&group);

    match a.composer.send(&group, "", vec![]).await? {
        None => println!("\nBlank send: nothing written"),
        Some(id) => bail!("blank send stored message {}", id),
    }

    a.composer.send(&group, "hello", vec![]).await?;

    let png = vec![0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];
    let image = LocalFile::new("banner.png", "image/png", png.clone());
    a.composer.send(&group, "Rally banner", vec![image]).await?;

    let pdf = LocalFile::new("agenda.pdf", "application/pdf", b"%PDF-1.4".to_vec());
    a.composer.send(&group, "", vec![pdf]).await?;

    let list = tokio::time::timeout(FEED_TIMEOUT, wait_for_len(&mut feed, 3))
        .await
        .context("Timed out waiting for Bob's feed")??;
    feed.clear();

    println!("\nBob's feed:");
    for msg in &list {
        println!("  [{}] {}", msg.timestamp.format("%H:%M:%S%.3f"), describe(msg));
    }

    if let Some(att) = list
        .iter()
        .flat_map(|m| m.attachments.iter())
        .find(|a| a.name == "banner.png")
    {
        let fetched = files.fetch(&att.url)?;
        println!(
            "\nImage round trip: {} ({} bytes, matches: {})",
            att.url,
            fetched.len(),
            fetched == png
        );
    }

    let volunteers = b.groups.get(&group).await?;
    println!(
        "Group preview: {:?}",
        volunteers.last_message.as_deref().unwrap_or("")
    );
    println!(
        "Online besides Bob: {}",
        b.session
            .online_others()
            .iter()
            .map(|i| i.label())
            .collect::<Vec<_>>()
            .join(", ")
    );

    a.shutdown().await?;
    b.shutdown().await?;
    c.shutdown().await?;
    Ok(())
}
