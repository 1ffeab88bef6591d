//! Mid-call media renegotiation
//!
//! At most one re-INVITE is in progress per session, whichever side started
//! it. A remote re-INVITE on a forwarded call is relayed to the peer leg and
//! answered once the peer decides; on a proxied call it is applied locally
//! and rolled back to the last working media if the update is refused.
use super::{
    session::{Reason, Session},
    SessionState,
};
use crate::{
    config::ForwardPolicy,
    media::{MediaDescription, MediaMode},
    routing::{self, code_to_error, error_to_code, update, BusMessage},
    transaction::{Transaction, TransactionEvent, TransactionState},
    Error, Result,
};
use rsip::Method;
use tracing::{debug, info, warn};

pub(super) enum Secondary {
    /// Re-INVITE from the remote party waiting for a verdict
    Relay {
        tx: Transaction,
        offer: Option<MediaDescription>,
    },
    /// Re-INVITE sent by this side
    Local {
        tx: Option<Transaction>,
        media: MediaDescription,
        target: MediaMode,
        notify_peer: bool,
    },
}

impl Session {
    pub(super) async fn on_reinvite(&self, tx: &Transaction) {
        let req = tx.original();
        let offer = self.observe_media(&req.body);
        let verdict = {
            let mut inner = self.inner.lock();
            if inner.state != SessionState::Established || inner.secondary.is_some() {
                Err(491)
            } else if !self.ctx.config.reinvite_allowed {
                Err(488)
            } else {
                inner.secondary = Some(Secondary::Relay {
                    tx: tx.clone(),
                    offer: offer.clone(),
                });
                Ok(inner.media_mode)
            }
        };
        match verdict {
            Err(code) => {
                info!(id = %self.id(), code, "refusing re-INVITE");
                self.respond(tx, code, None, vec![]).await;
            }
            Ok(MediaMode::Forwarded) => self.relay_reinvite(tx, offer).await,
            Ok(_) => self.proxy_reinvite(tx, offer).await,
        }
    }

    async fn relay_reinvite(&self, tx: &Transaction, offer: Option<MediaDescription>) {
        let Some(offer) = offer else {
            self.take_relay(tx);
            self.set_last_error("re-INVITE without a media description".to_string());
            self.respond(tx, 488, None, vec![]).await;
            return;
        };
        let mut msg = self
            .bus_message(routing::CALL_UPDATE)
            .with_param("operation", update::REQUEST);
        offer.to_params(&mut msg.params);
        if !self.ctx.bus.dispatch(&mut msg).await {
            self.complete_peer_update(false, None, Some("noroute")).await;
            return;
        }
        match msg.param("operation") {
            Some(update::NOTIFY) => {
                let answer = MediaDescription::from_params(&msg.params);
                self.complete_peer_update(true, answer, None).await;
            }
            Some(update::REJECT) => {
                let error = msg.error().unwrap_or("notacceptable").to_string();
                self.complete_peer_update(false, None, Some(&error)).await;
            }
            _ => debug!(id = %self.id(), "re-INVITE waiting for the peer leg"),
        }
    }

    /// Applies a `call.update` record sent by the peer leg
    ///
    /// | `operation` | effect |
    /// | --- | --- |
    /// | `notify` | accepts the pending relayed re-INVITE, answering with the carried media |
    /// | `reject` | refuses it with the status mapped from `error` |
    /// | `request` | offers the carried media to the remote party ([`Session::peer_update`]) |
    /// | `initiate` | moves media to flow directly to the carried address ([`Session::start_forwarding`]) |
    ///
    /// Returns `Ok(false)` when a verdict arrives with no relayed re-INVITE
    /// pending. Records that are not `call.update`, carry an unknown operation
    /// or lack the media an offer needs are routing errors.
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// # use rsipchan::{routing::{self, update, BusMessage}, session::Session, media::*};
    /// # async fn example(session: &Session) -> rsipchan::Result<()> {
    /// let mut msg = BusMessage::new(routing::CALL_UPDATE)
    ///     .with_param("operation", update::INITIATE);
    /// MediaDescription::new("192.0.2.50", vec![MediaStream::new("audio", 7000, &["0"])])
    ///     .to_params(&mut msg.params);
    /// session.on_update(&msg).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn on_update(&self, msg: &BusMessage) -> Result<bool> {
        if msg.name != routing::CALL_UPDATE {
            return Err(Error::RoutingError(format!("{} is not a media update", msg.name)));
        }
        let operation = msg.param("operation").unwrap_or_default();
        debug!(id = %self.id(), operation, "media update from peer leg");
        match operation {
            update::NOTIFY => {
                let answer = MediaDescription::from_params(&msg.params);
                Ok(self.complete_peer_update(true, answer, None).await)
            }
            update::REJECT => {
                let error = msg.error().unwrap_or("notacceptable");
                Ok(self.complete_peer_update(false, None, Some(error)).await)
            }
            update::REQUEST | update::INITIATE => {
                let media = MediaDescription::from_params(&msg.params).ok_or_else(|| {
                    Error::RoutingError(format!("{} update without media", operation))
                })?;
                if operation == update::INITIATE {
                    self.start_forwarding(media).await?;
                } else {
                    self.peer_update(media).await?;
                }
                Ok(true)
            }
            other => Err(Error::RoutingError(format!(
                "unknown update operation '{}'",
                other
            ))),
        }
    }

    /// Finishes a relayed re-INVITE with the peer leg's verdict
    ///
    /// The session media changes only when the update is accepted. Returns
    /// false when no relayed re-INVITE is pending.
    pub async fn complete_peer_update(
        &self,
        accepted: bool,
        media: Option<MediaDescription>,
        error: Option<&str>,
    ) -> bool {
        let relay = {
            let mut inner = self.inner.lock();
            match inner.secondary.take() {
                Some(Secondary::Relay { tx, offer }) => Some((tx, offer)),
                other => {
                    inner.secondary = other;
                    None
                }
            }
        };
        let Some((tx, offer)) = relay else {
            return false;
        };
        if tx.is_answered() {
            return false;
        }
        if accepted {
            let answer = {
                let mut inner = self.inner.lock();
                if offer.is_some() {
                    inner.remote_media = offer;
                }
                if media.is_some() {
                    inner.local_media = media;
                }
                inner.last_error = None;
                inner.local_media.clone()
            };
            let contact = self.contact();
            self.respond(&tx, 200, answer.as_ref(), contact.into_iter().collect())
                .await;
            info!(id = %self.id(), "re-INVITE accepted by peer");
        } else {
            let error = error.unwrap_or("notacceptable");
            self.set_last_error(format!("re-INVITE rejected by peer: {}", error));
            self.respond(&tx, error_to_code(error).0, None, vec![]).await;
            info!(id = %self.id(), error, "re-INVITE rejected by peer");
        }
        true
    }

    async fn proxy_reinvite(&self, tx: &Transaction, offer: Option<MediaDescription>) {
        let Some(offer) = offer else {
            // session refresh, answer with what we have
            self.take_relay(tx);
            let local = self.local_media();
            let contact = self.contact();
            self.respond(tx, 200, local.as_ref(), contact.into_iter().collect())
                .await;
            return;
        };
        let snapshot = {
            let mut inner = self.inner.lock();
            inner.revert = inner.remote_media.clone();
            inner.revert.clone()
        };
        let mut msg = self
            .bus_message(routing::CALL_UPDATE)
            .with_param("operation", update::REQUEST)
            .with_param("mode", "proxy");
        offer.to_params(&mut msg.params);
        let handled = self.ctx.bus.dispatch(&mut msg).await;
        let accepted = handled
            && msg.error().is_none()
            && msg.param("operation") != Some(update::REJECT);
        self.take_relay(tx);

        if accepted {
            let local = {
                let mut inner = self.inner.lock();
                inner.remote_media = Some(offer);
                inner.revert = None;
                inner.local_media.clone()
            };
            let contact = self.contact();
            self.respond(tx, 200, local.as_ref(), contact.into_iter().collect())
                .await;
            return;
        }

        let error = msg.error().unwrap_or("notacceptable").to_string();
        match snapshot {
            Some(previous) => {
                {
                    let mut inner = self.inner.lock();
                    inner.remote_media = Some(previous.clone());
                    inner.revert = None;
                    inner.last_error = Some(format!(
                        "media update refused ({}), reverted to {}",
                        error, previous
                    ));
                }
                self.respond(tx, 488, None, vec![]).await;
                let notify = self
                    .bus_message(routing::CALL_UPDATE)
                    .with_param("operation", update::NOTIFY)
                    .with_param("mode", "proxy");
                self.ctx.bus.enqueue(notify);
                info!(id = %self.id(), media = %previous, "media update refused, previous media restored");
            }
            None => {
                self.inner.lock().revert = None;
                self.set_last_error(format!(
                    "media update refused ({}) with no media to fall back to",
                    error
                ));
                self.respond(tx, 488, None, vec![]).await;
                warn!(id = %self.id(), "media update refused and nothing to restore, dropping call");
                self.hangup(Some("notacceptable")).await;
            }
        }
    }

    fn take_relay(&self, tx: &Transaction) -> bool {
        let mut inner = self.inner.lock();
        let pending = matches!(
            &inner.secondary,
            Some(Secondary::Relay { tx: pending, .. }) if pending == tx
        );
        if pending {
            inner.secondary = None;
        }
        pending
    }

    pub(super) fn is_relay(&self, tx: &Transaction) -> bool {
        matches!(
            &self.inner.lock().secondary,
            Some(Secondary::Relay { tx: pending, .. }) if pending == tx
        )
    }

    /// The remote re-INVITE ended before anyone answered it
    pub(super) fn abort_relay(&self, tx: &Transaction) {
        if self.take_relay(tx) && !tx.is_answered() {
            debug!(id = %self.id(), "relayed re-INVITE expired");
            self.set_last_error("re-INVITE expired before the peer answered".to_string());
        }
    }

    /// Switches media to flow directly between `media` and the remote party
    pub async fn start_forwarding(&self, media: MediaDescription) -> Result<()> {
        if self.ctx.config.forward_policy == ForwardPolicy::Never {
            return Err(Error::SessionError(
                "media forwarding disabled".to_string(),
                self.dialog_id(),
            ));
        }
        self.send_reinvite(media, MediaMode::Forwarded, false).await
    }

    /// Offers new media requested by the peer leg; the verdict goes back to
    /// it as a `call.update` notification
    pub async fn peer_update(&self, media: MediaDescription) -> Result<()> {
        let mode = self.media_mode();
        self.send_reinvite(media, mode, true).await
    }

    async fn send_reinvite(
        &self,
        media: MediaDescription,
        target: MediaMode,
        notify_peer: bool,
    ) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            if inner.state != SessionState::Established {
                return Err(Error::SessionError(
                    format!("cannot update media in state {}", inner.state),
                    inner.dialog.id(),
                ));
            }
            if inner.secondary.is_some() {
                return Err(Error::SessionError(
                    "another re-INVITE is pending".to_string(),
                    inner.dialog.id(),
                ));
            }
            inner.secondary = Some(Secondary::Local {
                tx: None,
                media: media.clone(),
                target,
                notify_peer,
            });
        }
        let submitted = match self.dialog_request(Method::Invite, Some(&media)) {
            Ok(request) => {
                self.ctx
                    .engine
                    .submit(request, self.binding.clone(), self.owner())
                    .await
            }
            Err(e) => Err(e),
        };
        match submitted {
            Ok(transaction) => {
                let mut inner = self.inner.lock();
                if let Some(Secondary::Local { tx: slot, .. }) = inner.secondary.as_mut() {
                    if slot.is_none() {
                        *slot = Some(transaction);
                    }
                }
                info!(id = %self.id(), %media, mode = %target, "re-INVITE sent");
                Ok(())
            }
            Err(e) => {
                self.take_local();
                warn!(id = %self.id(), "failed to send re-INVITE: {}", e);
                Err(e)
            }
        }
    }

    fn take_local(&self) -> Option<Secondary> {
        let mut inner = self.inner.lock();
        match inner.secondary.take() {
            Some(local @ Secondary::Local { .. }) => Some(local),
            other => {
                inner.secondary = other;
                None
            }
        }
    }

    /// True if `tx` carries the re-INVITE this side sent
    pub(super) fn is_local_reinvite(&self, tx: &Transaction) -> bool {
        let mut inner = self.inner.lock();
        let Some(Secondary::Local { tx: slot, .. }) = inner.secondary.as_mut() else {
            return false;
        };
        if let Some(current) = slot.as_ref() {
            return current == tx;
        }
        if tx.method() != Method::Invite {
            return false;
        }
        *slot = Some(tx.clone());
        true
    }

    pub(super) async fn on_reinvite_response(&self, event: TransactionEvent) {
        let Some(resp) = event.response().cloned() else {
            if event.state == TransactionState::Cleared && !event.transaction.is_answered() {
                self.take_local();
                self.set_last_error("re-INVITE timed out".to_string());
                warn!(id = %self.id(), "re-INVITE timed out, dropping call");
                self.hangup(Some("timeout")).await;
            }
            return;
        };
        let code = resp.status_code.code();
        if code < 200 {
            return;
        }
        let Some(Secondary::Local {
            media,
            target,
            notify_peer,
            ..
        }) = self.take_local()
        else {
            return;
        };

        if code < 300 {
            self.send_ack(&resp).await;
            let answer = self.observe_media(&resp.body);
            {
                let mut inner = self.inner.lock();
                inner.media_mode = target;
                inner.local_media = Some(media);
                if answer.is_some() {
                    inner.remote_media = answer;
                }
                inner.last_error = None;
            }
            info!(id = %self.id(), mode = %target, "media updated");
            if notify_peer {
                let msg = self
                    .bus_message(routing::CALL_UPDATE)
                    .with_param("operation", update::NOTIFY);
                self.ctx.bus.enqueue(msg);
            }
            return;
        }

        match code {
            408 => {
                self.set_last_error("re-INVITE timed out".to_string());
                self.hangup(Some("timeout")).await;
            }
            481 => {
                self.set_last_error("dialog no longer exists on the remote side".to_string());
                self.finish(Reason::new(481, "Call/Transaction Does Not Exist"))
                    .await;
            }
            _ => {
                self.set_last_error(format!("re-INVITE rejected with {}", code));
                info!(id = %self.id(), code, "re-INVITE rejected, keeping current media");
                if notify_peer {
                    let msg = self
                        .bus_message(routing::CALL_UPDATE)
                        .with_param("operation", update::REJECT)
                        .with_param("error", code_to_error(code));
                    self.ctx.bus.enqueue(msg);
                }
            }
        }
    }

    /// Settles a pending re-INVITE when the session goes away
    pub(super) async fn drop_secondary(&self, secondary: Secondary) {
        match secondary {
            Secondary::Relay { tx, .. } if !tx.is_answered() => {
                self.respond(&tx, 487, None, vec![]).await;
            }
            Secondary::Local { tx: Some(tx), .. } if !tx.is_answered() => {
                if let Err(e) = self.ctx.engine.cancel(&tx).await {
                    debug!(id = %self.id(), "cancel of re-INVITE failed: {}", e);
                }
            }
            _ => {}
        }
    }
}
