use std::env;
use std::sync::Arc;

use cinema_realtime::{
    AuthState, DisconnectBanner, HttpTokenProvider, Phase, RealtimeConfig, RealtimeSession,
    SessionProvider, SocketIoConnector, Topic,
};
use log::{error, info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match RealtimeConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    let Some(user_id) = env::var("CINEMA_USER_ID").ok() else {
        error!("CINEMA_USER_ID must name the signed-in identity");
        std::process::exit(1);
    };

    let mut tokens = HttpTokenProvider::new(config.token_url.clone());
    if let Ok(api_token) = env::var("CINEMA_API_TOKEN") {
        tokens = tokens.with_bearer(api_token);
    }

    let connector = match SocketIoConnector::new(&config) {
        Ok(connector) => connector,
        Err(e) => {
            error!("Cannot build realtime connector: {}", e);
            std::process::exit(1);
        }
    };

    let banner_delay = config.banner_delay;
    let session = RealtimeSession::new(config, Arc::new(tokens), Arc::new(connector));
    let provider = SessionProvider::new(Arc::new(session));

    let _events = provider.subscribe(Topic::All, |event| match serde_json::to_string(event) {
        Ok(json) => info!("event {}", json),
        Err(e) => warn!("Unprintable event: {}", e),
    });
    let _banner = DisconnectBanner::spawn(provider.connection_status(), banner_delay);

    info!("Signing in realtime session as {}", user_id);
    if provider.apply_auth(AuthState::signed_in(user_id)).await != Phase::Connected {
        error!("Could not establish realtime session");
        std::process::exit(1);
    }

    info!("Type `<conversationId> <message>` to send, Ctrl-C to quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let Some((conversation_id, content)) = line.trim().split_once(' ') else {
                        warn!("Expected `<conversationId> <message>`");
                        continue;
                    };
                    let sent = provider.send_message(
                        conversation_id,
                        content,
                        Some(Box::new(|ack| {
                            if ack.success {
                                info!("Delivered: {}", ack.data);
                            } else {
                                warn!("Not delivered: {}", ack.error.unwrap_or_default());
                            }
                        })),
                    );
                    if !sent {
                        warn!("Message not sent, session is offline");
                    }
                }
                Ok(None) => {
                    let _ = tokio::signal::ctrl_c().await;
                    break;
                }
                Err(e) => {
                    error!("Failed to read stdin: {}", e);
                    break;
                }
            },
        }
    }

    info!("Shutting down realtime session");
    provider.shutdown().await;
}
