use super::{connection::TransportReceiver, TransportEvent};
use std::time::Duration;
use tokio::time::{sleep, timeout};

mod test_binding;
mod test_stream;

pub(super) fn options_request(via: &str, call_id: &str) -> String {
    format!(
        "OPTIONS sip:bob@example.com SIP/2.0\r\n\
         Via: SIP/2.0/{};branch=z9hG4bK776asdhds\r\n\
         Max-Forwards: 70\r\n\
         From: <sip:alice@example.com>;tag=1928301774\r\n\
         To: <sip:bob@example.com>\r\n\
         Call-ID: {}\r\n\
         CSeq: 63104 OPTIONS\r\n\
         Content-Length: 0\r\n\r\n",
        via, call_id
    )
}

/// Next `Incoming` event, skipping lifecycle notifications
pub(super) async fn next_incoming(
    events: &mut TransportReceiver,
    within: Duration,
) -> Option<TransportEvent> {
    timeout(within, async {
        while let Some(event) = events.recv().await {
            if let TransportEvent::Incoming(..) = event {
                return Some(event);
            }
        }
        None
    })
    .await
    .ok()
    .flatten()
}

/// Next `Closed` event
pub(super) async fn next_closed(
    events: &mut TransportReceiver,
    within: Duration,
) -> Option<TransportEvent> {
    timeout(within, async {
        while let Some(event) = events.recv().await {
            if let TransportEvent::Closed(..) = event {
                return Some(event);
            }
        }
        None
    })
    .await
    .ok()
    .flatten()
}

pub(super) async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    cond()
}
