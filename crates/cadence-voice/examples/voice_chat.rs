//! Example: Live Voice Chat
//!
//! Talk to the realtime model through the default microphone and speaker.
//! Typed lines are sent as text turns; `/mute` and `/unmute` toggle the mic.
//!
//! Needs the credential endpoint from `CADENCE__CREDENTIAL_URL` (or config/voice.toml)
//! to be running. Set `CADENCE__CREDENTIAL_BEARER` if it requires a session token.

use anyhow::Context;
use cadence_voice::{
    list_input_devices, ChannelObserver, ConnectOptions, HttpCredentialProvider, NativeAudio,
    SessionEvent, VoiceConfig, VoiceSession,
};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("🎙️ Cadence Voice Chat");
    info!("=====================");

    match list_input_devices() {
        Ok(devices) => {
            for device in devices {
                info!("   input: {}", device);
            }
        }
        Err(e) => warn!("Could not list input devices: {}", e),
    }

    let config = VoiceConfig::load().context("loading voice config")?;
    let credentials =
        HttpCredentialProvider::new(config.credential_url.clone(), config.credential_bearer.clone())
            .context("building credential client")?;
    let options = ConnectOptions::from_config(&config);

    let (observer, mut events) = ChannelObserver::new();
    let mut session = VoiceSession::new(
        config,
        Arc::new(credentials),
        Arc::new(NativeAudio),
        Arc::new(observer),
    );

    if let Err(e) = session.connect(options).await {
        anyhow::bail!("{}", e.user_message());
    }
    if let Err(e) = session.start_capture().await {
        warn!("{} (text only)", e.user_message());
    }

    info!("✅ Connected. Speak, or type a message. Ctrl+C to quit.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(SessionEvent::Transcript { text, is_user: true }) => info!("🧑 {}", text),
                Some(SessionEvent::Transcript { text, is_user: false }) => info!("🤖 {}", text),
                Some(SessionEvent::StatusChanged(state)) => info!("[{}]", state.status_text()),
                Some(SessionEvent::Interrupted) => info!("⚡ (interrupted)"),
                Some(SessionEvent::Error(message)) => warn!("{}", message),
                Some(SessionEvent::Disconnected) | None => break,
                Some(SessionEvent::Connected) => {}
            },
            line = lines.next_line() => match line? {
                Some(line) if line.trim() == "/mute" => session.stop_capture().await,
                Some(line) if line.trim() == "/unmute" => {
                    if let Err(e) = session.start_capture().await {
                        warn!("{}", e.user_message());
                    }
                }
                Some(line) if !line.trim().is_empty() => {
                    if let Err(e) = session.send_text(line.trim()).await {
                        warn!("{}", e.user_message());
                    }
                }
                Some(_) => {}
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    session.disconnect().await;
    info!("👋 Bye");
    Ok(())
}
