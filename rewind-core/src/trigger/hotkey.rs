//! Global save hotkey via evdev
//!
//! Reads keyboard events directly from /dev/input/event* devices, so it works
//! under any compositor (or none). Needs read access to the input devices.

use evdev::{Device, InputEventKind, Key};
use std::collections::HashSet;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use crate::error::{Result, RewindError};

/// Default save hotkey
pub const DEFAULT_HOTKEY: &str = "alt+f10";

/// Delay between polls of the keyboard devices
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A hotkey binding (modifier keys + trigger key)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hotkey {
    /// Modifier keys that must be held
    pub modifiers: HashSet<Key>,
    /// The trigger key
    pub key: Key,
}

impl Hotkey {
    /// Create a new hotkey binding
    pub fn new(modifiers: impl IntoIterator<Item = Key>, key: Key) -> Self {
        Self {
            modifiers: modifiers.into_iter().collect(),
            key,
        }
    }

    /// Parse a hotkey string like "ctrl+shift+f9"
    pub fn parse(s: &str) -> Result<Self> {
        let lowercase = s.to_lowercase();
        let mut modifiers = HashSet::new();
        let mut key = None;

        for part in lowercase.split('+').map(str::trim) {
            match part {
                "ctrl" | "control" => {
                    modifiers.insert(Key::KEY_LEFTCTRL);
                }
                "alt" => {
                    modifiers.insert(Key::KEY_LEFTALT);
                }
                "shift" => {
                    modifiers.insert(Key::KEY_LEFTSHIFT);
                }
                "super" | "meta" | "win" => {
                    modifiers.insert(Key::KEY_LEFTMETA);
                }
                "" => return Err(RewindError::config(format!("Empty key in hotkey '{}'", s))),
                _ => {
                    if key.is_some() {
                        return Err(RewindError::config(format!(
                            "Hotkey '{}' names more than one key",
                            s
                        )));
                    }
                    key = Some(parse_key(part)?);
                }
            }
        }

        let key = key.ok_or_else(|| RewindError::config("No key specified in hotkey"))?;
        Ok(Self { modifiers, key })
    }

    /// Whether the binding fires for the currently pressed keys
    ///
    /// Left and right modifier variants are interchangeable.
    pub fn matches(&self, pressed: &HashSet<Key>) -> bool {
        if !pressed.contains(&self.key) {
            return false;
        }

        self.modifiers.iter().all(|modifier| match *modifier {
            Key::KEY_LEFTCTRL => {
                pressed.contains(&Key::KEY_LEFTCTRL) || pressed.contains(&Key::KEY_RIGHTCTRL)
            }
            Key::KEY_LEFTALT => {
                pressed.contains(&Key::KEY_LEFTALT) || pressed.contains(&Key::KEY_RIGHTALT)
            }
            Key::KEY_LEFTSHIFT => {
                pressed.contains(&Key::KEY_LEFTSHIFT) || pressed.contains(&Key::KEY_RIGHTSHIFT)
            }
            Key::KEY_LEFTMETA => {
                pressed.contains(&Key::KEY_LEFTMETA) || pressed.contains(&Key::KEY_RIGHTMETA)
            }
            _ => pressed.contains(modifier),
        })
    }
}

/// Parse a key name to evdev Key
fn parse_key(name: &str) -> Result<Key> {
    let key = match name {
        "f1" => Key::KEY_F1,
        "f2" => Key::KEY_F2,
        "f3" => Key::KEY_F3,
        "f4" => Key::KEY_F4,
        "f5" => Key::KEY_F5,
        "f6" => Key::KEY_F6,
        "f7" => Key::KEY_F7,
        "f8" => Key::KEY_F8,
        "f9" => Key::KEY_F9,
        "f10" => Key::KEY_F10,
        "f11" => Key::KEY_F11,
        "f12" => Key::KEY_F12,

        "1" => Key::KEY_1,
        "2" => Key::KEY_2,
        "3" => Key::KEY_3,
        "4" => Key::KEY_4,
        "5" => Key::KEY_5,
        "6" => Key::KEY_6,
        "7" => Key::KEY_7,
        "8" => Key::KEY_8,
        "9" => Key::KEY_9,
        "0" => Key::KEY_0,

        "a" => Key::KEY_A,
        "b" => Key::KEY_B,
        "c" => Key::KEY_C,
        "d" => Key::KEY_D,
        "e" => Key::KEY_E,
        "f" => Key::KEY_F,
        "g" => Key::KEY_G,
        "h" => Key::KEY_H,
        "i" => Key::KEY_I,
        "j" => Key::KEY_J,
        "k" => Key::KEY_K,
        "l" => Key::KEY_L,
        "m" => Key::KEY_M,
        "n" => Key::KEY_N,
        "o" => Key::KEY_O,
        "p" => Key::KEY_P,
        "q" => Key::KEY_Q,
        "r" => Key::KEY_R,
        "s" => Key::KEY_S,
        "t" => Key::KEY_T,
        "u" => Key::KEY_U,
        "v" => Key::KEY_V,
        "w" => Key::KEY_W,
        "x" => Key::KEY_X,
        "y" => Key::KEY_Y,
        "z" => Key::KEY_Z,

        "space" => Key::KEY_SPACE,
        "enter" | "return" => Key::KEY_ENTER,
        "escape" | "esc" => Key::KEY_ESC,
        "tab" => Key::KEY_TAB,
        "insert" | "ins" => Key::KEY_INSERT,
        "delete" | "del" => Key::KEY_DELETE,
        "home" => Key::KEY_HOME,
        "end" => Key::KEY_END,
        "pageup" | "pgup" => Key::KEY_PAGEUP,
        "pagedown" | "pgdn" => Key::KEY_PAGEDOWN,
        "printscreen" | "print" | "prtsc" => Key::KEY_SYSRQ,
        "pause" => Key::KEY_PAUSE,
        "scrolllock" => Key::KEY_SCROLLLOCK,

        _ => return Err(RewindError::config(format!("Unknown key: {}", name))),
    };

    Ok(key)
}

/// Save trigger fired by a global hotkey
pub struct HotkeyTrigger {
    hotkey: Hotkey,
    rx: mpsc::Receiver<()>,
    running: Arc<AtomicBool>,
    thread_handle: Option<std::thread::JoinHandle<()>>,
}

impl HotkeyTrigger {
    /// Start listening for `hotkey` on every keyboard device
    pub fn start(hotkey: Hotkey) -> Result<Self> {
        let devices = find_keyboard_devices();
        if devices.is_empty() {
            warn!("Make sure you have permission to read /dev/input/event* devices.");
            warn!("You may need to add your user to the 'input' group.");
            return Err(RewindError::trigger("No keyboard devices found"));
        }
        info!(
            "Monitoring {} keyboard device(s) for the save hotkey",
            devices.len()
        );

        let (tx, rx) = mpsc::channel(4);
        let running = Arc::new(AtomicBool::new(true));
        let thread_running = Arc::clone(&running);
        let thread_hotkey = hotkey.clone();

        let thread = std::thread::Builder::new()
            .name("rewind-hotkeys".to_string())
            .spawn(move || {
                run_hotkey_loop(devices, &thread_hotkey, &tx, &thread_running);
                thread_running.store(false, Ordering::SeqCst);
            })
            .map_err(|e| RewindError::trigger(format!("Failed to spawn hotkey thread: {}", e)))?;

        Ok(Self {
            hotkey,
            rx,
            running,
            thread_handle: Some(thread),
        })
    }

    /// The binding being listened for
    pub fn hotkey(&self) -> &Hotkey {
        &self.hotkey
    }

    /// Wait for the next hotkey press
    pub async fn wait(&mut self) -> Result<()> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| RewindError::trigger("Hotkey listener stopped"))
    }

    /// Stop listening
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            if handle.join().is_err() {
                error!("Hotkey listener panicked");
            }
        }
    }
}

impl Drop for HotkeyTrigger {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Find keyboard devices, opened in non-blocking mode
fn find_keyboard_devices() -> Vec<Device> {
    let mut devices = Vec::new();

    for entry in std::fs::read_dir("/dev/input").into_iter().flatten().flatten() {
        let path = entry.path();
        if !path.to_string_lossy().contains("event") {
            continue;
        }
        match Device::open(&path) {
            Ok(device) => {
                let is_keyboard = device.supported_keys().is_some_and(|keys| {
                    keys.contains(Key::KEY_A) && keys.contains(Key::KEY_ENTER)
                });
                if !is_keyboard {
                    continue;
                }
                if let Err(e) = set_nonblocking(&device) {
                    debug!("Skipping {:?}: {}", path, e);
                    continue;
                }
                debug!(
                    "Found keyboard device: {:?} - {}",
                    path,
                    device.name().unwrap_or("unknown")
                );
                devices.push(device);
            }
            Err(e) => {
                trace!("Could not open {:?}: {}", path, e);
            }
        }
    }

    devices
}

fn set_nonblocking(device: &Device) -> std::io::Result<()> {
    let fd = device.as_raw_fd();
    // SAFETY: fd belongs to the open device; F_GETFL/F_SETFL only touch its flags.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

fn run_hotkey_loop(
    mut devices: Vec<Device>,
    hotkey: &Hotkey,
    tx: &mpsc::Sender<()>,
    running: &AtomicBool,
) {
    // Pressed keys across all devices
    let mut pressed: HashSet<Key> = HashSet::new();

    while running.load(Ordering::SeqCst) {
        for device in &mut devices {
            let Ok(events) = device.fetch_events() else {
                continue;
            };
            for event in events {
                let InputEventKind::Key(key) = event.kind() else {
                    continue;
                };
                match event.value() {
                    1 => {
                        pressed.insert(key);
                        if key == hotkey.key && hotkey.matches(&pressed) {
                            info!("Save hotkey pressed");
                            // A full queue means a save is already pending
                            if tx.try_send(()).is_err() && tx.is_closed() {
                                debug!("Trigger receiver dropped");
                                return;
                            }
                        }
                    }
                    0 => {
                        pressed.remove(&key);
                    }
                    _ => {}
                }
            }
        }

        std::thread::sleep(POLL_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hotkey() {
        let hotkey = Hotkey::parse("ctrl+shift+f9").unwrap();
        assert_eq!(hotkey.key, Key::KEY_F9);
        assert!(hotkey.modifiers.contains(&Key::KEY_LEFTCTRL));
        assert!(hotkey.modifiers.contains(&Key::KEY_LEFTSHIFT));

        let hotkey = Hotkey::parse(DEFAULT_HOTKEY).unwrap();
        assert_eq!(hotkey.key, Key::KEY_F10);
    }

    #[test]
    fn test_parse_rejects_bad_bindings() {
        assert!(Hotkey::parse("ctrl+shift").is_err());
        assert!(Hotkey::parse("ctrl++f9").is_err());
        assert!(Hotkey::parse("a+b").is_err());
        assert!(parse_key("invalid").is_err());
    }

    #[test]
    fn test_matches() {
        let hotkey = Hotkey::new([Key::KEY_LEFTCTRL, Key::KEY_LEFTSHIFT], Key::KEY_F9);

        let pressed: HashSet<Key> = [Key::KEY_LEFTCTRL, Key::KEY_F9].into_iter().collect();
        assert!(!hotkey.matches(&pressed));

        let pressed: HashSet<Key> = [Key::KEY_RIGHTCTRL, Key::KEY_LEFTSHIFT, Key::KEY_F9]
            .into_iter()
            .collect();
        assert!(hotkey.matches(&pressed));
    }
}
