//! Info command - show capture devices and encoder support

use anyhow::Result;
use rewind_core::capture::drm::{list_cards, DrmCard, DeviceSpec};
use rewind_core::config::ConfigFile;
use rewind_core::encode;
use rewind_core::formats;
use rewind_core::ipc::{capture_socket_path, trigger_socket_path};

/// Encoders worth checking for
const VIDEO_ENCODERS: &[&str] = &["libx264", "libx265", "h264_vaapi", "hevc_vaapi", "h264_nvenc"];
const AUDIO_ENCODERS: &[&str] = &["aac", "libopus"];

/// Show system information
pub async fn info() -> Result<()> {
    println!("Rewind - System Information\n");

    println!("Display Devices:");
    let cards = list_cards();
    if cards.is_empty() {
        println!("  No DRM cards found under /dev/dri");
    }
    for card in &cards {
        print_card(card);
    }

    println!();
    println!("Encoders:");
    if cfg!(feature = "ffmpeg") {
        for name in VIDEO_ENCODERS.iter().chain(AUDIO_ENCODERS) {
            let status = if encode::encoder_available(name) { "yes" } else { "no" };
            println!("  {:<12} {}", name, status);
        }
    } else {
        println!("  Built without the 'ffmpeg' feature; recording is unavailable.");
    }

    println!();
    println!("Endpoints:");
    let service = capture_socket_path();
    let service_state = if service.exists() { "present" } else { "not running" };
    println!("  Capture service: {} ({})", service.display(), service_state);
    println!("  Save trigger:    {}", trigger_socket_path().display());
    println!("  Config file:     {}", ConfigFile::default_path().display());

    Ok(())
}

fn print_card(card: &str) {
    let spec = match DeviceSpec::parse(card) {
        Ok(spec) => spec,
        Err(e) => {
            println!("  {}: {}", card, e);
            return;
        }
    };
    let drm = match DrmCard::open(spec.card_path()) {
        Ok(drm) => drm,
        Err(e) => {
            println!("  {}: cannot open ({})", card, e);
            return;
        }
    };
    let planes = match drm.plane_ids() {
        Ok(planes) => planes,
        Err(e) => {
            println!("  {}: cannot list planes ({})", card, e);
            return;
        }
    };

    println!("  {} ({} planes)", card, planes.len());
    for id in planes {
        let Ok(plane) = drm.plane(id) else {
            continue;
        };
        if plane.fb_id == 0 {
            continue;
        }
        match drm.framebuffer(plane.fb_id) {
            Ok(fb) => {
                println!(
                    "    {}:{:<4} {}x{} {} {}",
                    card,
                    id,
                    fb.width,
                    fb.height,
                    formats::fourcc_name(fb.fourcc),
                    if formats::is_linear(fb.modifier) { "linear" } else { "tiled" }
                );
                drm.close_handles(&fb);
            }
            Err(_) => println!("    {}:{:<4} active (framebuffer not readable)", card, id),
        }
    }
}
