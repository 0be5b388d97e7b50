//! Chat Client - a session that survives server restarts.
//!
//! This example demonstrates:
//! - Building a client with reconnect and repeated connection attempts
//! - Registering a message handler and sending a typed request
//! - Driving handlers from the host's event loop
//!
//! Start `session_server` first, then run this example. Stop and restart
//! the server to watch the client reconnect and resend whatever was not
//! acknowledged.
//!
//! ```sh
//! RUST_LOG=sessionwire=debug cargo run --example chat_client
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use sessionwire::{Client, Message, SessionEvent};
use tracing_subscriber::EnvFilter;

#[derive(Serialize, Deserialize, Debug)]
struct Chat {
    text: String,
}

impl Message for Chat {
    const TYPE_NAME: &'static str = "Demo.Chat";
}

#[derive(Serialize, Deserialize, Debug)]
struct PriceQuery {
    item: String,
}

impl Message for PriceQuery {
    const TYPE_NAME: &'static str = "Demo.PriceQuery";
}

#[derive(Serialize, Deserialize, Debug)]
struct PriceQuote {
    item: String,
    gold: i32,
}

impl Message for PriceQuote {
    const TYPE_NAME: &'static str = "Demo.PriceQuote";
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut client = Client::builder()
        .server("127.0.0.1", 7777)
        .reconnect(true)
        .repeat_connection_attempts(true)
        .reconnection_delay(Duration::from_secs(1))
        .on(|chat: Chat| async move {
            println!("<< {}", chat.text);
            Ok(())
        })
        .start()
        .await?;

    // Send a line every two seconds, whether or not we are connected.
    let handle = client.handle();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(2));
        for n in 1.. {
            interval.tick().await;
            let chat = Chat {
                text: format!("line {}", n),
            };
            if let Err(e) = handle.send_message(&chat).await {
                eprintln!("send failed: {}", e);
            }
        }
    });

    while let Some(event) = client.next_event().await {
        match event {
            SessionEvent::Connected {
                session_id,
                restored,
            } => {
                println!("connected as {} (restored: {})", session_id, restored);

                let handle = client.handle();
                tokio::spawn(async move {
                    let query = PriceQuery {
                        item: "lantern".into(),
                    };
                    match handle.send_request::<_, PriceQuote>(&query).await {
                        Ok(quote) => println!("{} costs {} gold", quote.item, quote.gold),
                        Err(e) => eprintln!("price query failed: {}", e),
                    }
                });
            }
            SessionEvent::ConnectionFailed { error, retrying } => {
                println!("connection failed: {} (retrying: {})", error, retrying);
            }
            SessionEvent::Disconnected { cause } => println!("disconnected: {}", cause),
            SessionEvent::Disposed { .. } => break,
            SessionEvent::Error(e) => eprintln!("error: {}", e),
            other => {
                client.dispatch(other).await?;
            }
        }
    }

    Ok(())
}
