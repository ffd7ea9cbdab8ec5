//! Key name table and hotkey combo parsing
//!
//! Key names resolve to macOS virtual key codes. The table is platform
//! independent so that slot validation behaves the same everywhere; only
//! the event-tap backend actually posts these codes.

use super::BackendError;

/// Virtual key code as used by the Quartz event APIs
pub type KeyCode = u16;

/// Canonical names plus aliases, lowercase
const KEY_TABLE: &[(&str, KeyCode)] = &[
    // Letters
    ("a", 0x00),
    ("s", 0x01),
    ("d", 0x02),
    ("f", 0x03),
    ("h", 0x04),
    ("g", 0x05),
    ("z", 0x06),
    ("x", 0x07),
    ("c", 0x08),
    ("v", 0x09),
    ("b", 0x0B),
    ("q", 0x0C),
    ("w", 0x0D),
    ("e", 0x0E),
    ("r", 0x0F),
    ("y", 0x10),
    ("t", 0x11),
    ("o", 0x1F),
    ("u", 0x20),
    ("i", 0x22),
    ("p", 0x23),
    ("l", 0x25),
    ("j", 0x26),
    ("k", 0x28),
    ("n", 0x2D),
    ("m", 0x2E),
    // Digits
    ("1", 0x12),
    ("2", 0x13),
    ("3", 0x14),
    ("4", 0x15),
    ("6", 0x16),
    ("5", 0x17),
    ("9", 0x19),
    ("7", 0x1A),
    ("8", 0x1C),
    ("0", 0x1D),
    // Punctuation
    ("=", 0x18),
    ("equal", 0x18),
    ("-", 0x1B),
    ("minus", 0x1B),
    ("]", 0x1E),
    ("[", 0x21),
    ("'", 0x27),
    ("quote", 0x27),
    (";", 0x29),
    ("semicolon", 0x29),
    ("\\", 0x2A),
    ("backslash", 0x2A),
    (",", 0x2B),
    ("comma", 0x2B),
    ("/", 0x2C),
    ("slash", 0x2C),
    (".", 0x2F),
    ("period", 0x2F),
    ("`", 0x32),
    ("grave", 0x32),
    // Editing and whitespace
    ("enter", 0x24),
    ("return", 0x24),
    ("tab", 0x30),
    ("space", 0x31),
    ("backspace", 0x33),
    ("escape", 0x35),
    ("esc", 0x35),
    ("delete", 0x75),
    ("del", 0x75),
    ("insert", 0x72),
    ("help", 0x72),
    // Modifiers
    ("cmd", 0x37),
    ("command", 0x37),
    ("shift", 0x38),
    ("caps lock", 0x39),
    ("capslock", 0x39),
    ("alt", 0x3A),
    ("option", 0x3A),
    ("ctrl", 0x3B),
    ("control", 0x3B),
    ("right shift", 0x3C),
    ("right alt", 0x3D),
    ("right ctrl", 0x3E),
    ("right cmd", 0x36),
    // Function keys
    ("f1", 0x7A),
    ("f2", 0x78),
    ("f3", 0x63),
    ("f4", 0x76),
    ("f5", 0x60),
    ("f6", 0x61),
    ("f7", 0x62),
    ("f8", 0x64),
    ("f9", 0x65),
    ("f10", 0x6D),
    ("f11", 0x67),
    ("f12", 0x6F),
    ("f13", 0x69),
    ("f14", 0x6B),
    ("f15", 0x71),
    ("f16", 0x6A),
    ("f17", 0x40),
    ("f18", 0x4F),
    ("f19", 0x50),
    ("f20", 0x5A),
    // Navigation
    ("home", 0x73),
    ("page up", 0x74),
    ("pageup", 0x74),
    ("end", 0x77),
    ("page down", 0x79),
    ("pagedown", 0x79),
    ("left", 0x7B),
    ("arrowleft", 0x7B),
    ("right", 0x7C),
    ("arrowright", 0x7C),
    ("down", 0x7D),
    ("arrowdown", 0x7D),
    ("up", 0x7E),
    ("arrowup", 0x7E),
];

/// Normalize a user supplied key name: trimmed, lowercase
pub fn normalize(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Resolve a key name (any case, surrounding whitespace ignored)
pub fn key_code(name: &str) -> Option<KeyCode> {
    let name = normalize(name);
    KEY_TABLE
        .iter()
        .find(|(candidate, _)| *candidate == name)
        .map(|(_, code)| *code)
}

/// A modifier key group; left and right keys share one flag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modifier {
    Control,
    Option,
    Command,
    Shift,
    CapsLock,
}

/// Modifier group of a key code, if it is a modifier key.
///
/// macOS reports these keys through flag changes rather than key down/up.
pub fn modifier_of(code: KeyCode) -> Option<Modifier> {
    match code {
        0x3B | 0x3E => Some(Modifier::Control),
        0x3A | 0x3D => Some(Modifier::Option),
        0x37 | 0x36 => Some(Modifier::Command),
        0x38 | 0x3C => Some(Modifier::Shift),
        0x39 => Some(Modifier::CapsLock),
        _ => None,
    }
}

/// Tracks which modifier keys are part of a combo or currently held
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModifierState {
    /// Control key
    pub control: bool,
    /// Option/Alt key
    pub option: bool,
    /// Command key
    pub command: bool,
    /// Shift key
    pub shift: bool,
    /// Caps lock is on; ignored when matching hotkeys
    pub caps_lock: bool,
}

impl ModifierState {
    /// Create a ModifierState from Quartz event flags
    #[cfg(target_os = "macos")]
    pub fn from_flags(flags: core_graphics::event::CGEventFlags) -> Self {
        use core_graphics::event::CGEventFlags;

        Self {
            control: flags.contains(CGEventFlags::CGEventFlagControl),
            option: flags.contains(CGEventFlags::CGEventFlagAlternate),
            command: flags.contains(CGEventFlags::CGEventFlagCommand),
            shift: flags.contains(CGEventFlags::CGEventFlagShift),
            caps_lock: flags.contains(CGEventFlags::CGEventFlagAlphaShift),
        }
    }

    /// Whether the flag of `modifier` is set
    pub fn has(&self, modifier: Modifier) -> bool {
        match modifier {
            Modifier::Control => self.control,
            Modifier::Option => self.option,
            Modifier::Command => self.command,
            Modifier::Shift => self.shift,
            Modifier::CapsLock => self.caps_lock,
        }
    }
}

/// A parsed global hotkey: exact modifier set plus one non-modifier key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hotkey {
    pub modifiers: ModifierState,
    pub key: KeyCode,
}

impl Hotkey {
    /// True when `key` pressed with `held` modifiers fires this hotkey
    pub fn matches(&self, key: KeyCode, held: ModifierState) -> bool {
        let held = ModifierState {
            caps_lock: false,
            ..held
        };
        self.key == key && self.modifiers == held
    }
}

/// Parse a combo such as `ctrl+alt+esc`
pub fn parse_hotkey(combo: &str) -> Result<Hotkey, BackendError> {
    let binding = normalize(combo);
    let mut modifiers = ModifierState::default();
    let mut key = None;

    for part in binding.split('+').map(str::trim) {
        match part {
            "" => return Err(BackendError::InvalidHotkey(combo.to_string())),
            "ctrl" | "control" => modifiers.control = true,
            "alt" | "option" => modifiers.option = true,
            "shift" => modifiers.shift = true,
            "cmd" | "command" | "meta" | "super" => modifiers.command = true,
            name => {
                if key.is_some() {
                    return Err(BackendError::InvalidHotkey(combo.to_string()));
                }
                key = Some(key_code(name).ok_or_else(|| BackendError::UnknownKey(name.to_string()))?);
            }
        }
    }

    let key = key.ok_or_else(|| BackendError::InvalidHotkey(combo.to_string()))?;
    Ok(Hotkey { modifiers, key })
}
