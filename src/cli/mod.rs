//! Subcommand implementations for the `pollcall` binary.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::watch;

use pollcall::calling::devices::ToneCaptureDevice;
use pollcall::calling::media::CaptureDevice;
use pollcall::calling::transport::UdpTransportFactory;
use pollcall::calling::{
    CallHandle, CallKind, CallOrchestrator, CallSettings, CallStatus, CallView, Identity,
};
use pollcall::config::Config;
use pollcall::store::{CallSessionStore, HttpSessionStore, MemoryBackend};

/// Write a fresh config for `identity`, keeping other settings.
pub fn init(
    config_path: &Path,
    identity: String,
    name: Option<String>,
    store_url: Option<String>,
    token: Option<String>,
) -> Result<()> {
    let mut config = Config::load_from(config_path)?;
    config.identity = Some(identity);
    if name.is_some() {
        config.display_name = name;
    }
    if let Some(url) = store_url {
        config.store_url = url;
    }
    if token.is_some() {
        config.auth_token = token;
    }
    config.save_to(config_path)?;
    println!("Config written to {}", config_path.display());
    Ok(())
}

pub fn show_config(config_path: &Path) -> Result<()> {
    let mut config = Config::load_from(config_path)?;
    if config.auth_token.is_some() {
        config.auth_token = Some("<redacted>".to_string());
    }
    println!("# {}", config_path.display());
    print!(
        "{}",
        toml::to_string_pretty(&config).context("Failed to serialize config")?
    );
    Ok(())
}

fn capture_device() -> Arc<dyn CaptureDevice> {
    #[cfg(feature = "audio")]
    {
        Arc::new(pollcall::calling::devices::CpalCaptureDevice::new())
    }
    #[cfg(not(feature = "audio"))]
    {
        Arc::new(ToneCaptureDevice::new())
    }
}

fn connect(config: &Config) -> Result<(Identity, CallHandle)> {
    let identity = config.identity()?;
    let settings = config.settings();
    let store: Arc<dyn CallSessionStore> = Arc::new(HttpSessionStore::new(
        &config.store_url,
        identity.clone(),
        config.auth_token.clone(),
    ));
    let transports = Arc::new(UdpTransportFactory::new(settings.stun_servers.clone()));
    let (handle, _task) = CallOrchestrator::spawn(
        identity.clone(),
        store,
        capture_device(),
        transports,
        settings,
    );
    Ok((identity, handle))
}

/// Print what changed between two views.
fn report(previous: &CallView, view: &CallView) {
    if view.call_id != previous.call_id {
        if let Some(ref id) = view.call_id {
            println!("call_id={}", id);
        }
    }
    if view.status != previous.status {
        match view.status {
            Some(status) => println!("status={}", status),
            None => println!("status=idle"),
        }
    }
    if view.remote_media.is_some() && previous.remote_media.is_none() {
        if let Some(ref remote) = view.remote_media {
            println!(
                "remote_media=true remote_video={}",
                remote.has_video()
            );
        }
    }
    for (name, now, before) in [
        ("error", &view.diagnostic_error, &previous.diagnostic_error),
        ("signaling_error", &view.signaling_error, &previous.signaling_error),
        ("inbound_error", &view.inbound_error, &previous.inbound_error),
        ("accept_error", &view.accept_error, &previous.accept_error),
    ] {
        if now != before {
            match now {
                Some(message) => println!("{}={}", name, message),
                None if before.is_some() => println!("{}=cleared", name),
                None => {}
            }
        }
    }
    if view.incoming.as_ref().map(|c| c.id()) != previous.incoming.as_ref().map(|c| c.id()) {
        if let Some(ref call) = view.incoming {
            println!(
                "incoming={} from={} kind={}",
                call.id(),
                call.caller_name,
                call.session.kind.as_str()
            );
        }
    }
}

/// Place a call and hold it for `duration` once connected.
pub async fn call(
    config_path: &Path,
    peer: String,
    video: bool,
    name: Option<String>,
    duration: u64,
) -> Result<()> {
    let config = Config::load_from(config_path)?;
    let (identity, handle) = connect(&config)?;
    let kind = if video { CallKind::Video } else { CallKind::Voice };

    println!();
    println!("=== Call ===");
    match config.display_name {
        Some(ref name) => println!("Caller:   {} ({})", name, identity),
        None => println!("Caller:   {}", identity),
    }
    println!("Callee:   {}", peer);
    println!("Kind:     {}", kind.as_str());
    println!("Duration: {}s", duration);
    println!();

    handle.start(Identity::new(peer), name, kind);
    let mut rx = handle.subscribe();
    let mut previous = CallView::default();
    let mut connected: Option<tokio::time::Instant> = None;
    let hold = Duration::from_secs(duration);

    loop {
        let view = rx.borrow_and_update().clone();
        report(&previous, &view);
        if view.diagnostic_error.is_some() {
            handle.end();
            handle.shutdown();
            bail!("Call failed");
        }
        if previous.has_active_call && !view.has_active_call {
            println!("call_ended=remote");
            break;
        }
        if connected.is_none() && view.status == Some(CallStatus::InProgress) {
            connected = Some(tokio::time::Instant::now());
        }
        previous = view;

        let deadline = connected.map(|at| at + hold);
        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = sleep_until(deadline) => {
                println!("call_ended=local");
                handle.end();
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                println!("call_ended=interrupted");
                handle.end();
                break;
            }
        }
    }

    handle.shutdown();
    wait_stopped(&mut rx).await;
    Ok(())
}

async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Wait for the engine to drop its view channel.
async fn wait_stopped(rx: &mut watch::Receiver<CallView>) {
    let stopped = async { while rx.changed().await.is_ok() {} };
    if tokio::time::timeout(Duration::from_secs(2), stopped)
        .await
        .is_err()
    {
        tracing::debug!("Call engine did not stop within 2s");
    }
}

/// Watch for incoming calls until interrupted.
pub async fn listen(config_path: &Path, auto_accept: bool, decline_all: bool) -> Result<()> {
    if auto_accept && decline_all {
        bail!("--auto-accept and --decline-all are mutually exclusive");
    }
    let config = Config::load_from(config_path)?;
    let (identity, handle) = connect(&config)?;
    println!("Listening for calls to {} (Ctrl-C to stop)", identity);

    let mut rx = handle.subscribe();
    let mut previous = CallView::default();
    loop {
        let view = rx.borrow_and_update().clone();
        report(&previous, &view);
        if let Some(ref call) = view.incoming {
            let fresh = previous.incoming.as_ref().map(|c| c.id()) != Some(call.id());
            if fresh && decline_all {
                handle.decline(call.id());
            } else if fresh && auto_accept && !view.accepting {
                handle.accept(call.id());
            }
        }
        previous = view;

        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    handle.shutdown();
    wait_stopped(&mut rx).await;
    Ok(())
}

/// Two in-process endpoints calling each other over loopback.
pub async fn demo(video: bool, decline: bool) -> Result<()> {
    let backend = MemoryBackend::new();
    let alice = Identity::from("alice");
    let bob = Identity::from("bob");
    backend.set_display_name(&alice, "Alice");
    backend.set_display_name(&bob, "Bob");

    let settings = CallSettings {
        poll_interval: Duration::from_millis(200),
        incoming_poll_interval: Duration::from_millis(200),
        stun_servers: Vec::new(),
        ..CallSettings::default()
    };
    let endpoint = |who: &Identity| {
        CallOrchestrator::spawn(
            who.clone(),
            Arc::new(backend.connect(who.clone())),
            Arc::new(ToneCaptureDevice::new()),
            Arc::new(UdpTransportFactory::new(Vec::new())),
            settings.clone(),
        )
        .0
    };
    let caller = endpoint(&alice);
    let callee = endpoint(&bob);

    let kind = if video { CallKind::Video } else { CallKind::Voice };
    caller.start(bob.clone(), None, kind);

    let step = Duration::from_secs(10);
    let prompt = tokio::time::timeout(step, callee.wait_for(|v| v.incoming.is_some()))
        .await
        .context("Callee never saw the call")?;
    let incoming = prompt
        .incoming
        .context("Callee view lost the incoming call")?;
    println!(
        "bob: incoming {} call {} from {}",
        incoming.session.kind.as_str(),
        incoming.id(),
        incoming.caller_name
    );

    if decline {
        callee.decline(incoming.id());
        tokio::time::timeout(step, caller.wait_for(|v| !v.has_active_call))
            .await
            .context("Caller view never closed")?;
        let status = backend
            .session(incoming.id())
            .map(|s| s.status.label())
            .unwrap_or("unknown");
        println!("alice: call closed (store status: {})", status);
    } else {
        callee.accept(incoming.id());
        let connected = |v: &CallView| v.status == Some(CallStatus::InProgress);
        let bob_view = tokio::time::timeout(step, callee.wait_for(connected))
            .await
            .context("Callee never connected")?;
        let alice_view = tokio::time::timeout(step, caller.wait_for(connected))
            .await
            .context("Caller never connected")?;
        for (who, view) in [("alice", &alice_view), ("bob", &bob_view)] {
            println!(
                "{}: {} with {} (remote video: {})",
                who,
                view.status.map(|s| s.label()).unwrap_or("idle"),
                view.peer_name.as_deref().unwrap_or("?"),
                view.remote_media.as_ref().map(|m| m.has_video()).unwrap_or(false)
            );
        }

        caller.end();
        tokio::time::timeout(step, callee.wait_for(|v| !v.has_active_call))
            .await
            .context("Callee never saw the hang-up")?;
        println!("bob: call ended by alice");
    }

    caller.shutdown();
    callee.shutdown();
    Ok(())
}
