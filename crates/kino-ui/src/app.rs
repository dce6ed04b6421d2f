// crates/kino-ui/src/app.rs
//
// The single-window UI: paints the current video frame aspect-fit on a
// black canvas, overlays text subtitles, and translates the keyboard/mouse
// surface into Player requests. Repaints are scheduled from the refresh
// loop's remaining_time hint, so the window wakes only when a frame is due.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Receiver;
use egui::{Align2, Color32, FontId, Pos2, Rect, Vec2};
use ffmpeg_the_third as ffmpeg;

use kino_media::player::{REFRESH_RATE, VOLUME_STEP_DB};
use kino_media::{Player, PlayerEvent};

pub struct KinoApp {
    player:     Arc<Player>,
    events:     Receiver<PlayerEvent>,
    texture:    Option<egui::TextureHandle>,
    /// (serial, pts bits) of the uploaded picture, to skip re-uploads.
    uploaded:   (u64, u64),
    fullscreen: bool,
}

impl KinoApp {
    pub fn new(
        cc: &eframe::CreationContext<'_>,
        player: Arc<Player>,
        events: Receiver<PlayerEvent>,
        fullscreen: bool,
    ) -> Self {
        if fullscreen {
            cc.egui_ctx
                .send_viewport_cmd(egui::ViewportCommand::Fullscreen(true));
        }
        Self {
            player,
            events,
            texture: None,
            uploaded: (u64::MAX, 0),
            fullscreen,
        }
    }

    fn on_key(&mut self, ctx: &egui::Context, key: egui::Key) {
        use egui::Key;
        let player = &self.player;
        match key {
            Key::Q | Key::Escape => {
                player.request_stop();
                ctx.send_viewport_cmd(egui::ViewportCommand::Close);
            }
            Key::Space | Key::P => player.toggle_pause(),
            Key::M => player.toggle_mute(),
            Key::S => player.step_to_next_frame(),
            Key::F => self.toggle_fullscreen(ctx),
            Key::Num9 | Key::Slash => player.update_volume(-1, VOLUME_STEP_DB),
            Key::Num0 => player.update_volume(1, VOLUME_STEP_DB),
            Key::A => player.cycle_stream(ffmpeg::media::Type::Audio),
            Key::V => player.cycle_stream(ffmpeg::media::Type::Video),
            Key::T => player.cycle_stream(ffmpeg::media::Type::Subtitle),
            Key::C => player.cycle_all_streams(),
            Key::ArrowLeft => player.seek_relative(-player.opts.seek_interval),
            Key::ArrowRight => player.seek_relative(player.opts.seek_interval),
            Key::ArrowUp => player.seek_relative(60.0),
            Key::ArrowDown => player.seek_relative(-60.0),
            Key::PageUp => {
                if !player.seek_chapter(1) {
                    player.seek_relative(600.0);
                }
            }
            Key::PageDown => {
                if !player.seek_chapter(-1) {
                    player.seek_relative(-600.0);
                }
            }
            _ => {}
        }
    }

    fn toggle_fullscreen(&mut self, ctx: &egui::Context) {
        self.fullscreen = !self.fullscreen;
        ctx.send_viewport_cmd(egui::ViewportCommand::Fullscreen(self.fullscreen));
    }

    fn handle_input(&mut self, ctx: &egui::Context) {
        let mut keys: Vec<egui::Key> = Vec::new();
        let mut volume_up_text = false;
        let mut double_click = false;
        let mut seek_frac: Option<f64> = None;

        ctx.input(|i| {
            for event in &i.events {
                match event {
                    egui::Event::Key { key, pressed: true, .. } => keys.push(*key),
                    // '*' has no Key of its own.
                    egui::Event::Text(t) if t.as_str() == "*" => volume_up_text = true,
                    _ => {}
                }
            }
            if i.pointer.button_double_clicked(egui::PointerButton::Primary) {
                double_click = true;
            }
            if i.pointer.button_down(egui::PointerButton::Secondary) {
                if let Some(pos) = i.pointer.interact_pos() {
                    let width = i.screen_rect().width();
                    if width > 0.0 {
                        seek_frac = Some(f64::from(pos.x / width));
                    }
                }
            }
        });

        for key in keys {
            self.on_key(ctx, key);
        }
        if volume_up_text {
            self.player.update_volume(1, VOLUME_STEP_DB);
        }
        if double_click {
            self.toggle_fullscreen(ctx);
        }
        if let Some(frac) = seek_frac {
            self.player.seek_to_fraction(frac);
        }
    }

    fn upload_current(&mut self, ctx: &egui::Context) {
        let uploaded = self.uploaded;
        let fresh = self.player.with_current_picture(|vp| {
            let key = (vp.serial, vp.pts.to_bits());
            if key == uploaded {
                return None;
            }
            let image = egui::ColorImage::from_rgba_unmultiplied(
                [vp.width as usize, vp.height as usize],
                &vp.data,
            );
            Some((key, image))
        });
        if let Some(Some((key, image))) = fresh {
            match &mut self.texture {
                Some(tex) => tex.set(image, egui::TextureOptions::LINEAR),
                None => {
                    self.texture =
                        Some(ctx.load_texture("video-frame", image, egui::TextureOptions::LINEAR));
                }
            }
            self.uploaded = key;
        }
    }
}

impl eframe::App for KinoApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        while let Ok(PlayerEvent::Quit) = self.events.try_recv() {
            ctx.send_viewport_cmd(egui::ViewportCommand::Close);
        }
        if self.player.aborted() {
            ctx.send_viewport_cmd(egui::ViewportCommand::Close);
        }

        self.handle_input(ctx);

        let mut remaining_time = REFRESH_RATE;
        if self.player.video_refresh(&mut remaining_time) {
            self.upload_current(ctx);
        }

        egui::CentralPanel::default()
            .frame(egui::Frame::new().fill(Color32::BLACK))
            .show(ctx, |ui| {
                let canvas = ui.available_rect_before_wrap();
                let painter = ui.painter();

                if let Some(tex) = &self.texture {
                    let size = tex.size_vec2();
                    if size.x > 0.0 && size.y > 0.0 {
                        let scale = (canvas.width() / size.x).min(canvas.height() / size.y);
                        let fitted = Vec2::new(size.x * scale, size.y * scale);
                        let rect = Rect::from_center_size(canvas.center(), fitted);
                        painter.image(
                            tex.id(),
                            rect,
                            Rect::from_min_max(Pos2::ZERO, Pos2::new(1.0, 1.0)),
                            Color32::WHITE,
                        );
                    }
                }

                if let Some(text) = self
                    .player
                    .with_current_subtitle(|sp| sp.lines.join("\n"))
                {
                    let anchor = Pos2::new(canvas.center().x, canvas.max.y - 24.0);
                    let font = FontId::proportional(24.0);
                    painter.text(
                        anchor + Vec2::new(1.0, 1.0),
                        Align2::CENTER_BOTTOM,
                        &text,
                        font.clone(),
                        Color32::BLACK,
                    );
                    painter.text(anchor, Align2::CENTER_BOTTOM, &text, font, Color32::WHITE);
                }
            });

        ctx.request_repaint_after(Duration::from_secs_f64(
            remaining_time.clamp(0.0, REFRESH_RATE),
        ));
    }
}
