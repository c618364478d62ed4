use std::time::Duration;

use client_core::{ChatCore, ChatError, Settings, SyncEvent, SyncHandle, SyncSignal};
use shared::{
    domain::{BlockState, UserId},
    protocol::{ConversationDocument, UserProfile},
};

async fn core_with(users: &[&str]) -> ChatCore {
    let settings = Settings {
        database_url: "sqlite::memory:".into(),
        ..Settings::default()
    };
    let core = ChatCore::open(settings).await.expect("open");
    for id in users {
        core.directory
            .provision(&UserProfile::new(*id, *id))
            .await
            .expect("provision");
    }
    core
}

async fn next_event(handle: &mut SyncHandle<ConversationDocument>) -> SyncEvent {
    tokio::time::timeout(Duration::from_secs(2), handle.next_event())
        .await
        .expect("event within deadline")
        .expect("open subscription")
}

#[tokio::test]
async fn two_party_exchange_with_block_and_unblock() {
    let core = core_with(&["a", "b"]).await;
    let (a, b) = (UserId::new("a"), UserId::new("b"));

    let chat_id = core.index.create_conversation(&a, &b).await.expect("create");
    let a_view = core.index.select_conversation(&a, &chat_id).await.expect("select");
    let b_view = core.index.select_conversation(&b, &chat_id).await.expect("select");

    let mut a_feed = core.sync.watch_conversation(&a_view.context);
    assert!(matches!(next_event(&mut a_feed).await, SyncEvent::ConversationUpdated(_)));

    let receipt = core
        .sessions
        .send_message(&b_view.context, "hi", None)
        .await
        .expect("send")
        .expect("accepted");
    assert!(matches!(next_event(&mut a_feed).await, SyncEvent::ConversationUpdated(_)));
    assert_eq!(
        next_event(&mut a_feed).await,
        SyncEvent::Signal(SyncSignal::NewInboundMessage(receipt.message))
    );
    assert_eq!(
        next_event(&mut a_feed).await,
        SyncEvent::Signal(SyncSignal::ScrollToEnd)
    );

    let a_list = core.index.conversations(&a).await.expect("list");
    assert_eq!(a_list[0].summary.last_message, "hi");
    assert!(!a_list[0].summary.is_seen);
    let b_list = core.index.conversations(&b).await.expect("list");
    assert!(b_list[0].summary.is_seen);

    assert_eq!(
        core.blocks.toggle_block(&a, &b).await.expect("block"),
        BlockState::CounterpartIsBlocked
    );
    let rejected = core.sessions.send_message(&b_view.context, "hello?", None).await;
    assert!(matches!(rejected, Err(ChatError::Blocked { .. })));
    let conversation = core.sessions.conversation(&chat_id).await.expect("conversation");
    assert_eq!(conversation.messages.len(), 1);

    let b_list = core.index.conversations(&b).await.expect("list");
    assert_eq!(b_list[0].display_name(), "User");

    assert_eq!(
        core.blocks.toggle_block(&a, &b).await.expect("unblock"),
        BlockState::NoneBlocked
    );
    core.sessions
        .send_message(&b_view.context, "back again", None)
        .await
        .expect("send")
        .expect("accepted");
    let conversation = core.sessions.conversation(&chat_id).await.expect("conversation");
    assert_eq!(conversation.messages.len(), 2);

    a_feed.unsubscribe();
    assert_eq!(a_feed.next_event().await, None);
}
