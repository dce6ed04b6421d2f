// crates/kino-ui/src/main.rs
//
// Entry point: CLI parsing, logging and FFmpeg init, signal handling, then
// either the eframe window or the headless refresh loop (--nodisp).
// Exit codes: 0 on a clean quit, 123 after SIGINT/SIGTERM.

mod app;
mod opts;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context as _, Result};
use clap::Parser;
use crossbeam_channel::{Receiver, TryRecvError};
use ffmpeg_the_third as ffmpeg;
use tracing::debug;

use kino_media::player::REFRESH_RATE;
use kino_media::{Player, PlayerEvent};

fn main() {
    let code = match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("kino: {e:#}");
            1
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = opts::Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    ffmpeg::init().context("FFmpeg init failed")?;
    ffmpeg::util::log::set_level(ffmpeg::util::log::Level::Warning);

    let (player, events) = Player::open(cli.to_player_options())?;

    let signaled = Arc::new(AtomicBool::new(false));
    {
        let signaled = Arc::clone(&signaled);
        let player = Arc::clone(&player);
        ctrlc::set_handler(move || {
            signaled.store(true, Ordering::SeqCst);
            player.request_stop();
        })
        .context("cannot install signal handler")?;
    }

    if cli.nodisp {
        run_headless(&player, &events);
    } else {
        let title = cli
            .window_title
            .clone()
            .unwrap_or_else(|| format!("kino - {}", cli.input));
        let native_options = eframe::NativeOptions {
            centered: true,
            viewport: egui::ViewportBuilder::default()
                .with_title(title)
                .with_inner_size([1280.0, 720.0])
                .with_min_inner_size([320.0, 240.0]),
            ..Default::default()
        };
        let app_player = Arc::clone(&player);
        let fullscreen = cli.fs;
        eframe::run_native(
            "kino",
            native_options,
            Box::new(move |cc| Ok(Box::new(app::KinoApp::new(cc, app_player, events, fullscreen)))),
        )
        .map_err(|e| anyhow!("window failed: {e}"))?;
    }

    player.shutdown();
    debug!("shutdown complete");
    Ok(if signaled.load(Ordering::SeqCst) { 123 } else { 0 })
}

/// Audio-only / windowless mode: drive the refresh loop ourselves, sleeping
/// exactly as long as it says we may.
fn run_headless(player: &Arc<Player>, events: &Receiver<PlayerEvent>) {
    loop {
        if player.aborted() {
            break;
        }
        match events.try_recv() {
            Ok(PlayerEvent::Quit) | Err(TryRecvError::Disconnected) => break,
            Err(TryRecvError::Empty) => {}
        }
        let mut remaining_time = REFRESH_RATE;
        player.video_refresh(&mut remaining_time);
        std::thread::sleep(Duration::from_secs_f64(remaining_time.clamp(0.001, REFRESH_RATE)));
    }
}
