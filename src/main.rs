use std::sync::Arc;
use std::time::Duration;

use pairlink::transport::memory::MemoryNetwork;
use pairlink::{ConnectionManager, Event, ManagerConfig, Message, PeerId, RoomId};

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Wait for the first event accepted by `pick`.
async fn wait_for<T>(
    events: &async_channel::Receiver<Event>,
    mut pick: impl FnMut(Event) -> Option<T>,
) -> Result<T, Box<dyn std::error::Error>> {
    let found = tokio::time::timeout(EVENT_TIMEOUT, async {
        while let Ok(event) = events.recv().await {
            if let Some(found) = pick(event) {
                return Some(found);
            }
        }
        None
    })
    .await?;
    found.ok_or_else(|| "event stream closed".into())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let network = Arc::new(MemoryNetwork::new());
    let host = ConnectionManager::new(network.clone(), ManagerConfig::default());
    let guest = ConnectionManager::new(network, ManagerConfig::default());
    let guest_events = guest.events().subscribe();

    let room = RoomId::generate();
    println!("   Pairlink loopback demo");
    println!("   Room {}\n", room);

    host.create_room(room).await?;
    let offer = host.get_connection_info().await?;
    println!("Host offer (copy to the guest):\n{}\n", offer);

    guest.connect_with_info(&offer).await?;
    wait_for(&guest_events, |e| {
        matches!(e, Event::CandidateDiscovered { .. }).then_some(())
    })
    .await?;
    let answer = guest.get_connection_info().await?;
    println!("Guest answer (copy back to the host):\n{}\n", answer);

    host.complete_handshake(&answer, PeerId::host()).await?;
    wait_for(&guest_events, |e| matches!(e, Event::PeerJoin(_)).then_some(())).await?;

    host.send_message(Message::new("chat", "hello from the host"), None)
        .await?;
    let (message, from) = wait_for(&guest_events, |e| match e {
        Event::Message { message, peer_id } => Some((message, peer_id)),
        _ => None,
    })
    .await?;
    println!("Guest received {} from {}: {}", message.kind, from, message.payload);

    host.disconnect().await?;
    guest.disconnect().await?;
    Ok(())
}
