//! Connection probe for a running relay.
//!
//! Walks the whole protocol once against a live server (handshake, ping,
//! message, history, goodbye) and reports each step.  Useful after a deploy
//! to confirm the relay is reachable and persisting.

use std::env;
use std::error::Error;
use std::time::Duration;

use relaypoint::client::RelayClient;
use relaypoint::protocol::{Frame, FrameBody};
use relaypoint::store::now_millis;

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let args: Vec<String> = env::args().collect();
    let url = match args.get(1) {
        Some(url) => url.clone(),
        None => {
            print_usage();
            return Ok(());
        }
    };
    let agent = args.get(2).cloned().unwrap_or_else(|| "probe".to_string());

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    rt.block_on(probe(&url, &agent))
}

fn print_usage() {
    println!(
        "usage: probe <ws-url> [agent-id]\n\
         \n\
         Examples:\n\
         probe ws://127.0.0.1:8080/ws\n\
         probe wss://relay.example.com/ws scout"
    );
}

async fn probe(url: &str, agent: &str) -> Result<(), Box<dyn Error>> {
    println!("connecting to {url} as {agent}");
    let mut client = RelayClient::connect(url, agent).await?;
    let welcome = client.welcome();
    println!(
        "welcome: session={} agents_online={} heartbeat={}s",
        welcome.session_id, welcome.connected_agents, welcome.heartbeat_interval
    );

    client.ping().await?;
    await_frame(&mut client, "PONG", |body| {
        matches!(body, FrameBody::Pong { .. })
    })
    .await?;
    println!("ping: ok");

    let message_id = format!("probe-{}", now_millis());
    client.send_message(&message_id, "probe message").await?;
    let ack = await_frame(&mut client, "ACK", |body| {
        matches!(body, FrameBody::Ack { message_id: id, .. } if *id == message_id)
    })
    .await?;
    if let FrameBody::Ack { timestamp, .. } = ack.body {
        println!("message: acknowledged at {timestamp}");
    }

    client.request_history(None).await?;
    let history = await_frame(&mut client, "HISTORY_RESPONSE", |body| {
        matches!(body, FrameBody::HistoryResponse { .. })
    })
    .await?;
    if let FrameBody::HistoryResponse { messages } = history.body {
        println!("history: {} message(s) stored", messages.len());
    }

    client.goodbye().await?;
    println!("probe complete");
    Ok(())
}

/// Wait for the first frame matching `want`, skipping relayed traffic from
/// other agents that may be interleaved.
async fn await_frame(
    client: &mut RelayClient,
    label: &str,
    want: impl Fn(&FrameBody) -> bool,
) -> Result<Frame, Box<dyn Error>> {
    let deadline = Duration::from_secs(5);
    loop {
        let frame = tokio::time::timeout(deadline, client.next_frame())
            .await
            .map_err(|_| format!("timed out waiting for {label}"))??
            .ok_or_else(|| format!("connection closed waiting for {label}"))?;
        if want(&frame.body) {
            return Ok(frame);
        }
    }
}
