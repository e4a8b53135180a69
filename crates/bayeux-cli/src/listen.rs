//! Interactive session loop for the CLI
//!
//! Subscribes to the requested channels, prints every delivered message to
//! stdout and publishes each line read from stdin.

use bayeux_core::{Listener, Message, SessionClient};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

/// Run a session until stdin closes or Ctrl-C is pressed
pub async fn run_session(
    client: SessionClient,
    channels: &[String],
    publish_channel: Option<&str>,
    json_output: bool,
) -> Result<(), String> {
    client
        .init(None)
        .await
        .map_err(|e| format!("Failed to start session: {e}"))?;

    let (tx, mut deliveries) = mpsc::unbounded_channel::<Message>();
    for channel in channels {
        let tx = tx.clone();
        let listener = Listener::new(move |message| {
            let _ = tx.send(message.clone());
        });
        let ack = client
            .subscribe(channel, listener, None)
            .await
            .map_err(|e| format!("Failed to subscribe to {channel}: {e}"))?;

        let channel = channel.clone();
        tokio::spawn(async move {
            if let Err(e) = ack.wait().await {
                tracing::warn!("Subscription to {} failed: {}", channel, e);
            }
        });
    }
    drop(tx);

    let mut stdin_reader = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = publish_channel.is_some();

    loop {
        tokio::select! {
            line = stdin_reader.next_line(), if stdin_open => {
                match line {
                    Ok(Some(line)) if line.trim().is_empty() => {}
                    Ok(Some(line)) => {
                        let Some(channel) = publish_channel else { continue };
                        if let Err(e) = client.publish(channel, parse_payload(&line), None).await {
                            tracing::error!("Failed to publish: {}", e);
                        }
                    }
                    Ok(None) => {
                        tracing::info!("stdin closed");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("Error reading stdin: {}", e);
                        stdin_open = false;
                    }
                }
            }

            message = deliveries.recv() => {
                match message {
                    Some(message) => println!("{}", format_delivery(&message, json_output)),
                    None if !stdin_open => break,
                    None => {}
                }
            }

            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                break;
            }
        }
    }

    client.disconnect().await;
    Ok(())
}

/// Publish JSON as-is and anything else as a string
fn parse_payload(line: &str) -> Value {
    serde_json::from_str(line).unwrap_or_else(|_| Value::String(line.to_string()))
}

fn format_delivery(message: &Message, json_output: bool) -> String {
    let data = message.data.clone().unwrap_or(Value::Null);
    if json_output {
        return json!({"channel": message.channel, "data": data}).to_string();
    }
    format!("{} {}", message.channel, data)
}
