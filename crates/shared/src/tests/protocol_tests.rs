use super::*;
use chrono::TimeZone;
use serde_json::json;

#[test]
fn summary_uses_camel_case_field_names() {
    let summary = ConversationSummary::new(ChatId::new("c1"), UserId::new("bob"), 42);
    assert_eq!(
        serde_json::to_value(&summary).expect("encode"),
        json!({
            "chatId": "c1",
            "receiverId": "bob",
            "lastMessage": "",
            "isSeen": false,
            "updatedAt": 42
        })
    );
}

#[test]
fn message_without_attachment_omits_attachment_fields() {
    let message = Message {
        id: MessageId::new("m1"),
        sender_id: UserId::new("alice"),
        text: "hi".into(),
        created_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        attachment_url: None,
        attachment_kind: None,
    };
    let value = serde_json::to_value(&message).expect("encode");
    assert_eq!(value["senderId"], "alice");
    assert!(value.get("attachmentUrl").is_none());
    assert!(value.get("attachmentKind").is_none());
}

#[test]
fn legacy_profile_without_block_list_decodes() {
    let profile: UserProfile =
        serde_json::from_value(json!({ "id": "alice", "username": "Alice" })).expect("decode");
    assert!(profile.blocked.is_empty());
    assert!(!profile.has_blocked(&UserId::new("bob")));
}

#[test]
fn preview_falls_back_to_attachment_kind() {
    let mut message = Message {
        id: MessageId::new("m1"),
        sender_id: UserId::new("alice"),
        text: String::new(),
        created_at: Utc::now(),
        attachment_url: Some("blob://local/images/x.png".into()),
        attachment_kind: Some(AttachmentKind::Image),
    };
    assert_eq!(message.preview(), "[image]");
    message.attachment_kind = Some(AttachmentKind::File);
    assert_eq!(message.preview(), "[file]");
    message.text = "caption".into();
    assert_eq!(message.preview(), "caption");
}
