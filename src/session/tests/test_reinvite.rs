use super::*;
use crate::{config::ForwardPolicy, media::MediaMode, rsip_ext::RsipMessageExt, session::SessionState};

fn reinvite(session: &Session, seq: u32, body: Option<String>) -> rsip::Request {
    in_dialog(
        session,
        Method::Invite,
        seq,
        body.map(|sdp| ("application/sdp", sdp)),
    )
}

#[tokio::test]
async fn test_relayed_reinvite_blocks_a_second_one() -> Result<()> {
    let bus = MockBus::router("sip/peer", true, UpdateReply::Pending);
    let h = harness(SessionConfig::default(), bus.clone());
    let session = establish(&h, Some(sdp("10.0.0.5", 4000))).await?;
    assert_eq!(session.media_mode(), MediaMode::Forwarded);

    let first = incoming_tx(&h, reinvite(&session, 2, Some(sdp("10.0.0.5", 5000))), ALICE);
    session.handle_event(trying(&first)).await;
    let requests = bus.dispatched(routing::CALL_UPDATE);
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].param("operation"), Some(update::REQUEST));
    assert_eq!(requests[0].param("rtp_port_1"), Some("5000"));
    assert_eq!(first.code(), 0);

    let second = incoming_tx(&h, reinvite(&session, 3, Some(sdp("10.0.0.5", 6000))), ALICE);
    session.handle_event(trying(&second)).await;
    assert_eq!(second.code(), 491);
    assert_eq!(session.remote_media().map(|m| m.media[0].port), Some(4000));

    assert!(session.complete_peer_update(true, None, None).await);
    assert_eq!(first.code(), 200);
    assert_eq!(h.engine.codes_for(Method::Invite), vec![200, 491, 200]);
    assert_eq!(session.remote_media().map(|m| m.media[0].port), Some(5000));
    assert!(!session.complete_peer_update(true, None, None).await);
    Ok(())
}

#[tokio::test]
async fn test_relayed_reinvite_rejected_by_peer() -> Result<()> {
    let bus = MockBus::router("sip/peer", true, UpdateReply::Reject);
    let h = harness(SessionConfig::default(), bus);
    let session = establish(&h, Some(sdp("10.0.0.5", 4000))).await?;

    let tx = incoming_tx(&h, reinvite(&session, 2, Some(sdp("10.0.0.5", 5000))), ALICE);
    session.handle_event(trying(&tx)).await;
    assert_eq!(tx.code(), 488);
    assert_eq!(session.remote_media().map(|m| m.media[0].port), Some(4000));
    assert!(session.last_error().is_some());
    assert_eq!(session.state(), SessionState::Established);
    Ok(())
}

#[tokio::test]
async fn test_relayed_reinvite_accepted_by_peer() -> Result<()> {
    let bus = MockBus::router("sip/peer", true, UpdateReply::Accept);
    let h = harness(SessionConfig::default(), bus);
    let session = establish(&h, Some(sdp("10.0.0.5", 4000))).await?;

    let tx = incoming_tx(&h, reinvite(&session, 2, Some(sdp("10.0.0.5", 5000))), ALICE);
    session.handle_event(trying(&tx)).await;
    assert_eq!(tx.code(), 200);
    let answer = h.engine.last_response().expect("answer");
    assert!(!answer.body.is_empty());
    assert_eq!(session.remote_media().map(|m| m.media[0].port), Some(5000));
    Ok(())
}

#[tokio::test]
async fn test_unrouted_relay_is_refused() -> Result<()> {
    let bus = MockBus::router("sip/peer", true, UpdateReply::Unhandled);
    let h = harness(SessionConfig::default(), bus);
    let session = establish(&h, Some(sdp("10.0.0.5", 4000))).await?;

    let tx = incoming_tx(&h, reinvite(&session, 2, Some(sdp("10.0.0.5", 5000))), ALICE);
    session.handle_event(trying(&tx)).await;
    assert_eq!(tx.code(), 404);

    let empty = incoming_tx(&h, reinvite(&session, 3, None), ALICE);
    session.handle_event(trying(&empty)).await;
    assert_eq!(empty.code(), 488);
    assert_eq!(session.state(), SessionState::Established);
    Ok(())
}

#[tokio::test]
async fn test_proxied_reinvite_refused_restores_media() -> Result<()> {
    let bus = MockBus::router("sip/peer", false, UpdateReply::Reject);
    let h = harness(SessionConfig::default(), bus.clone());
    let session = establish(&h, Some(sdp("10.0.0.5", 4000))).await?;
    assert_eq!(session.media_mode(), MediaMode::Proxied);

    let tx = incoming_tx(&h, reinvite(&session, 2, Some(sdp("10.0.0.5", 5000))), ALICE);
    session.handle_event(trying(&tx)).await;

    assert_eq!(tx.code(), 488);
    assert_eq!(session.state(), SessionState::Established);
    assert_eq!(session.remote_media().map(|m| m.media[0].port), Some(4000));
    assert!(session.last_error().is_some());
    let request = bus.dispatched(routing::CALL_UPDATE);
    assert_eq!(request[0].param("mode"), Some("proxy"));
    let notify = bus.queued(routing::CALL_UPDATE);
    assert_eq!(notify.len(), 1);
    assert_eq!(notify[0].param("operation"), Some(update::NOTIFY));
    assert_eq!(notify[0].param("rtp_port_1"), Some("4000"));
    assert!(h.engine.submitted_for(Method::Bye).is_empty());

    // the session still takes a later update
    let retry = incoming_tx(&h, reinvite(&session, 3, None), ALICE);
    session.handle_event(trying(&retry)).await;
    assert_eq!(retry.code(), 200);
    Ok(())
}

#[tokio::test]
async fn test_proxied_reinvite_accepted() -> Result<()> {
    let bus = MockBus::router("sip/peer", false, UpdateReply::Accept);
    let h = harness(SessionConfig::default(), bus);
    let session = establish(&h, Some(sdp("10.0.0.5", 4000))).await?;

    let tx = incoming_tx(&h, reinvite(&session, 2, Some(sdp("10.0.0.5", 5000))), ALICE);
    session.handle_event(trying(&tx)).await;
    assert_eq!(tx.code(), 200);
    assert_eq!(session.remote_media().map(|m| m.media[0].port), Some(5000));
    assert_eq!(session.local_media(), Some(local_media()));
    Ok(())
}

#[tokio::test]
async fn test_refused_update_without_fallback_drops_call() -> Result<()> {
    let bus = MockBus::router("sip/peer", false, UpdateReply::Reject);
    let h = harness(SessionConfig::default(), bus.clone());
    let session = establish(&h, None).await?;
    assert_eq!(session.media_mode(), MediaMode::Unknown);

    let tx = incoming_tx(&h, reinvite(&session, 2, Some(sdp("10.0.0.5", 5000))), ALICE);
    session.handle_event(trying(&tx)).await;

    assert_eq!(tx.code(), 488);
    assert_eq!(h.engine.submitted_for(Method::Bye).len(), 1);
    assert_eq!(session.state(), SessionState::Cleared);
    assert_eq!(session.reason().map(|r| r.code), Some(488));
    assert_eq!(
        bus.queued(routing::CHAN_HANGUP)[0].param("error"),
        Some("notacceptable")
    );
    Ok(())
}

#[tokio::test]
async fn test_reinvite_refused_when_disabled_or_early() -> Result<()> {
    let bus = MockBus::router("sip/peer", false, UpdateReply::Accept);
    let h = harness(SessionConfig::default().with_reinvite(false), bus.clone());
    let session = establish(&h, Some(sdp("10.0.0.5", 4000))).await?;
    let tx = incoming_tx(&h, reinvite(&session, 2, Some(sdp("10.0.0.5", 5000))), ALICE);
    session.handle_event(trying(&tx)).await;
    assert_eq!(tx.code(), 488);
    assert!(bus.dispatched(routing::CALL_UPDATE).is_empty());

    let h = harness(SessionConfig::default(), bus);
    let invite_tx = incoming_tx(&h, invite("call-2", "alice2", None), ALICE);
    let session = Session::incoming(&h.ctx, &invite_tx)?;
    session.handle_event(trying(&invite_tx)).await;
    let early = incoming_tx(&h, reinvite(&session, 2, None), ALICE);
    session.handle_event(trying(&early)).await;
    assert_eq!(early.code(), 491);
    assert_eq!(session.state(), SessionState::Incoming);
    Ok(())
}

#[tokio::test]
async fn test_start_forwarding() -> Result<()> {
    let bus = MockBus::router("sip/peer", false, UpdateReply::Unhandled);
    let h = harness(SessionConfig::default(), bus);
    let session = establish(&h, Some(sdp("10.0.0.5", 4000))).await?;
    assert_eq!(session.media_mode(), MediaMode::Proxied);

    let peer = MediaDescription::new("192.0.2.50", vec![MediaStream::new("audio", 7000, &["0"])]);
    session.start_forwarding(peer.clone()).await?;
    let submitted = h.engine.submitted_for(Method::Invite);
    assert_eq!(submitted.len(), 1);
    let reinvite_tx = submitted[0].clone();
    assert_eq!(reinvite_tx.original().to_tag(), Some("alice1".to_string()));
    assert!(session.start_forwarding(peer.clone()).await.is_err());
    assert_eq!(session.media_mode(), MediaMode::Proxied);

    session
        .handle_event(response_event(&reinvite_tx, 200, "alice1", Some(sdp("10.0.0.5", 4002))))
        .await;
    assert_eq!(session.media_mode(), MediaMode::Forwarded);
    assert_eq!(session.local_media(), Some(peer));
    assert_eq!(session.remote_media().map(|m| m.media[0].port), Some(4002));
    assert!(session.last_error().is_none());
    Ok(())
}

#[tokio::test]
async fn test_forwarding_disabled_by_policy() -> Result<()> {
    let config = SessionConfig::default().with_forward_policy(ForwardPolicy::Never);
    let h = harness(config, MockBus::router("sip/peer", true, UpdateReply::Unhandled));
    let session = establish(&h, Some(sdp("10.0.0.5", 4000))).await?;
    assert_eq!(session.media_mode(), MediaMode::Proxied);
    assert!(session.start_forwarding(local_media()).await.is_err());
    assert!(h.engine.submitted_for(Method::Invite).is_empty());
    Ok(())
}

#[tokio::test]
async fn test_local_reinvite_timeout_drops_call() -> Result<()> {
    let bus = MockBus::router("sip/peer", false, UpdateReply::Unhandled);
    let h = harness(SessionConfig::default(), bus);
    let session = establish(&h, Some(sdp("10.0.0.5", 4000))).await?;
    session.start_forwarding(local_media()).await?;
    let reinvite_tx = h.engine.submitted_for(Method::Invite)[0].clone();

    session
        .handle_event(TransactionEvent::new(
            TransactionState::Cleared,
            reinvite_tx,
            None,
        ))
        .await;
    assert_eq!(h.engine.submitted_for(Method::Bye).len(), 1);
    assert_eq!(session.state(), SessionState::Cleared);
    assert_eq!(session.reason().map(|r| r.code), Some(408));
    Ok(())
}

#[tokio::test]
async fn test_peer_update_refused_notifies_peer() -> Result<()> {
    let bus = MockBus::router("sip/peer", false, UpdateReply::Unhandled);
    let h = harness(SessionConfig::default(), bus.clone());
    let session = establish(&h, Some(sdp("10.0.0.5", 4000))).await?;
    session.peer_update(local_media()).await?;
    let reinvite_tx = h.engine.submitted_for(Method::Invite)[0].clone();

    session
        .handle_event(response_event(&reinvite_tx, 488, "alice1", None))
        .await;
    assert_eq!(session.state(), SessionState::Established);
    assert_eq!(session.media_mode(), MediaMode::Proxied);
    assert!(session.last_error().is_some());
    let reject = bus.queued(routing::CALL_UPDATE);
    assert_eq!(reject.len(), 1);
    assert_eq!(reject[0].param("operation"), Some(update::REJECT));
    assert_eq!(reject[0].param("error"), Some("notacceptable"));

    // the slot is free again
    session.peer_update(local_media()).await?;
    assert_eq!(h.engine.submitted_for(Method::Invite).len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_remote_lost_dialog_ends_session() -> Result<()> {
    let h = harness(
        SessionConfig::default(),
        MockBus::router("sip/peer", false, UpdateReply::Unhandled),
    );
    let session = establish(&h, Some(sdp("10.0.0.5", 4000))).await?;
    session.peer_update(local_media()).await?;
    let reinvite_tx = h.engine.submitted_for(Method::Invite)[0].clone();
    session
        .handle_event(response_event(&reinvite_tx, 481, "alice1", None))
        .await;

    assert_eq!(session.state(), SessionState::Cleared);
    assert_eq!(session.reason().map(|r| r.code), Some(481));
    assert!(h.engine.submitted_for(Method::Bye).is_empty());
    Ok(())
}

#[tokio::test]
async fn test_pending_relay_answered_on_hangup() -> Result<()> {
    let bus = MockBus::router("sip/peer", true, UpdateReply::Pending);
    let h = harness(SessionConfig::default(), bus);
    let session = establish(&h, Some(sdp("10.0.0.5", 4000))).await?;
    let tx = incoming_tx(&h, reinvite(&session, 2, Some(sdp("10.0.0.5", 5000))), ALICE);
    session.handle_event(trying(&tx)).await;
    session.hangup(None).await;

    assert_eq!(tx.code(), 487);
    assert_eq!(session.state(), SessionState::Cleared);
    Ok(())
}

fn update_msg(operation: &str, media: Option<&MediaDescription>) -> BusMessage {
    let mut msg = BusMessage::new(routing::CALL_UPDATE).with_param("operation", operation);
    if let Some(media) = media {
        media.to_params(&mut msg.params);
    }
    msg
}

#[tokio::test]
async fn test_update_notify_answers_relayed_reinvite() -> Result<()> {
    let bus = MockBus::router("sip/peer", true, UpdateReply::Pending);
    let h = harness(SessionConfig::default(), bus);
    let session = establish(&h, Some(sdp("10.0.0.5", 4000))).await?;
    let tx = incoming_tx(&h, reinvite(&session, 2, Some(sdp("10.0.0.5", 5000))), ALICE);
    session.handle_event(trying(&tx)).await;
    assert_eq!(tx.code(), 0);

    let peer = MediaDescription::new("192.0.2.50", vec![MediaStream::new("audio", 7000, &["0"])]);
    assert!(session.on_update(&update_msg(update::NOTIFY, Some(&peer))).await?);
    assert_eq!(tx.code(), 200);
    assert_eq!(session.local_media(), Some(peer.clone()));
    assert_eq!(session.remote_media().map(|m| m.media[0].port), Some(5000));

    // nothing left to settle
    assert!(!session.on_update(&update_msg(update::NOTIFY, Some(&peer))).await?);
    Ok(())
}

#[tokio::test]
async fn test_update_reject_refuses_relayed_reinvite() -> Result<()> {
    let bus = MockBus::router("sip/peer", true, UpdateReply::Pending);
    let h = harness(SessionConfig::default(), bus);
    let session = establish(&h, Some(sdp("10.0.0.5", 4000))).await?;
    let tx = incoming_tx(&h, reinvite(&session, 2, Some(sdp("10.0.0.5", 5000))), ALICE);
    session.handle_event(trying(&tx)).await;

    assert!(session.on_update(&update_msg(update::REJECT, None)).await?);
    assert_eq!(tx.code(), 488);
    assert_eq!(session.remote_media().map(|m| m.media[0].port), Some(4000));
    assert_eq!(session.state(), SessionState::Established);
    Ok(())
}

#[tokio::test]
async fn test_update_request_reinvites_remote() -> Result<()> {
    let bus = MockBus::router("sip/peer", false, UpdateReply::Unhandled);
    let h = harness(SessionConfig::default(), bus);
    let session = establish(&h, Some(sdp("10.0.0.5", 4000))).await?;

    assert!(session.on_update(&update_msg(update::REQUEST, Some(&local_media()))).await?);
    let submitted = h.engine.submitted_for(Method::Invite);
    assert_eq!(submitted.len(), 1);
    assert!(!submitted[0].original().body.is_empty());
    assert_eq!(session.media_mode(), MediaMode::Proxied);
    Ok(())
}

#[tokio::test]
async fn test_update_initiate_starts_forwarding() -> Result<()> {
    let bus = MockBus::router("sip/peer", false, UpdateReply::Unhandled);
    let h = harness(SessionConfig::default(), bus);
    let session = establish(&h, Some(sdp("10.0.0.5", 4000))).await?;

    let peer = MediaDescription::new("192.0.2.50", vec![MediaStream::new("audio", 7000, &["0"])]);
    assert!(session.on_update(&update_msg(update::INITIATE, Some(&peer))).await?);
    let reinvite_tx = h.engine.submitted_for(Method::Invite)[0].clone();
    session
        .handle_event(response_event(&reinvite_tx, 200, "alice1", Some(sdp("10.0.0.5", 4002))))
        .await;
    assert_eq!(session.media_mode(), MediaMode::Forwarded);
    assert_eq!(session.local_media(), Some(peer));
    Ok(())
}

#[tokio::test]
async fn test_malformed_update_is_a_routing_error() -> Result<()> {
    let bus = MockBus::router("sip/peer", false, UpdateReply::Unhandled);
    let h = harness(SessionConfig::default(), bus);
    let session = establish(&h, Some(sdp("10.0.0.5", 4000))).await?;

    let no_media = session.on_update(&update_msg(update::REQUEST, None)).await;
    assert!(matches!(no_media, Err(crate::Error::RoutingError(_))));
    let unknown = session.on_update(&update_msg("transfer", Some(&local_media()))).await;
    assert!(matches!(unknown, Err(crate::Error::RoutingError(_))));
    let wrong = BusMessage::new(routing::CHAN_HANGUP).with_param("operation", update::NOTIFY);
    assert!(matches!(session.on_update(&wrong).await, Err(crate::Error::RoutingError(_))));
    assert!(h.engine.submitted_for(Method::Invite).is_empty());
    assert_eq!(session.state(), SessionState::Established);
    Ok(())
}
