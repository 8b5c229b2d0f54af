//! Key-name to USB HID usage-code table
//!
//! The browser sends keys by name; reports carry usage codes from the
//! keyboard/keypad page (0x07). Upper and lower case letters share a code,
//! as do digits and their shifted symbols: the shift state travels in the
//! modifier byte, not the key code. Unknown names map to 0.

/// USB HID usage codes (Usage Page 0x07)
#[allow(dead_code)]
pub mod usb {
    pub const KEY_A: u8 = 0x04;
    pub const KEY_B: u8 = 0x05;
    pub const KEY_C: u8 = 0x06;
    pub const KEY_D: u8 = 0x07;
    pub const KEY_E: u8 = 0x08;
    pub const KEY_F: u8 = 0x09;
    pub const KEY_G: u8 = 0x0A;
    pub const KEY_H: u8 = 0x0B;
    pub const KEY_I: u8 = 0x0C;
    pub const KEY_J: u8 = 0x0D;
    pub const KEY_K: u8 = 0x0E;
    pub const KEY_L: u8 = 0x0F;
    pub const KEY_M: u8 = 0x10;
    pub const KEY_N: u8 = 0x11;
    pub const KEY_O: u8 = 0x12;
    pub const KEY_P: u8 = 0x13;
    pub const KEY_Q: u8 = 0x14;
    pub const KEY_R: u8 = 0x15;
    pub const KEY_S: u8 = 0x16;
    pub const KEY_T: u8 = 0x17;
    pub const KEY_U: u8 = 0x18;
    pub const KEY_V: u8 = 0x19;
    pub const KEY_W: u8 = 0x1A;
    pub const KEY_X: u8 = 0x1B;
    pub const KEY_Y: u8 = 0x1C;
    pub const KEY_Z: u8 = 0x1D;

    pub const KEY_1: u8 = 0x1E;
    pub const KEY_2: u8 = 0x1F;
    pub const KEY_3: u8 = 0x20;
    pub const KEY_4: u8 = 0x21;
    pub const KEY_5: u8 = 0x22;
    pub const KEY_6: u8 = 0x23;
    pub const KEY_7: u8 = 0x24;
    pub const KEY_8: u8 = 0x25;
    pub const KEY_9: u8 = 0x26;
    pub const KEY_0: u8 = 0x27;

    pub const KEY_ENTER: u8 = 0x28;
    pub const KEY_ESCAPE: u8 = 0x29;
    pub const KEY_BACKSPACE: u8 = 0x2A;
    pub const KEY_TAB: u8 = 0x2B;
    pub const KEY_SPACE: u8 = 0x2C;
    pub const KEY_MINUS: u8 = 0x2D;
    pub const KEY_EQUAL: u8 = 0x2E;
    pub const KEY_LEFT_BRACKET: u8 = 0x2F;
    pub const KEY_RIGHT_BRACKET: u8 = 0x30;
    pub const KEY_BACKSLASH: u8 = 0x31;
    pub const KEY_SEMICOLON: u8 = 0x33;
    pub const KEY_APOSTROPHE: u8 = 0x34;
    pub const KEY_GRAVE: u8 = 0x35;
    pub const KEY_COMMA: u8 = 0x36;
    pub const KEY_PERIOD: u8 = 0x37;
    pub const KEY_SLASH: u8 = 0x38;
    pub const KEY_CAPS_LOCK: u8 = 0x39;

    pub const KEY_F1: u8 = 0x3A;
    pub const KEY_F2: u8 = 0x3B;
    pub const KEY_F3: u8 = 0x3C;
    pub const KEY_F4: u8 = 0x3D;
    pub const KEY_F5: u8 = 0x3E;
    pub const KEY_F6: u8 = 0x3F;
    pub const KEY_F7: u8 = 0x40;
    pub const KEY_F8: u8 = 0x41;
    pub const KEY_F9: u8 = 0x42;
    pub const KEY_F10: u8 = 0x43;
    pub const KEY_F11: u8 = 0x44;
    pub const KEY_F12: u8 = 0x45;

    pub const KEY_PRINT_SCREEN: u8 = 0x46;
    pub const KEY_SCROLL_LOCK: u8 = 0x47;
    pub const KEY_PAUSE: u8 = 0x48;
    pub const KEY_INSERT: u8 = 0x49;
    pub const KEY_HOME: u8 = 0x4A;
    pub const KEY_PAGE_UP: u8 = 0x4B;
    pub const KEY_DELETE: u8 = 0x4C;
    pub const KEY_END: u8 = 0x4D;
    pub const KEY_PAGE_DOWN: u8 = 0x4E;
    pub const KEY_RIGHT_ARROW: u8 = 0x4F;
    pub const KEY_LEFT_ARROW: u8 = 0x50;
    pub const KEY_DOWN_ARROW: u8 = 0x51;
    pub const KEY_UP_ARROW: u8 = 0x52;
}

use usb::*;

/// Look up the usage code for a key name. Returns 0 for unknown names.
pub fn find_key_code(key: &str) -> u8 {
    let mut chars = key.chars();
    if let (Some(c), None) = (chars.next(), chars.next()) {
        return char_code(c);
    }

    named_code(key)
}

/// Single-character keys: letters (case-folded), digits and their shifted
/// symbols, punctuation in both shift states, space.
fn char_code(c: char) -> u8 {
    match c {
        'a'..='z' => KEY_A + (c as u8 - b'a'),
        'A'..='Z' => KEY_A + (c as u8 - b'A'),
        '1' | '!' => KEY_1,
        '2' | '@' => KEY_2,
        '3' | '#' => KEY_3,
        '4' | '$' => KEY_4,
        '5' | '%' => KEY_5,
        '6' | '^' => KEY_6,
        '7' | '&' => KEY_7,
        '8' | '*' => KEY_8,
        '9' | '(' => KEY_9,
        '0' | ')' => KEY_0,
        '-' | '_' => KEY_MINUS,
        '=' | '+' => KEY_EQUAL,
        '[' | '{' => KEY_LEFT_BRACKET,
        ']' | '}' => KEY_RIGHT_BRACKET,
        '\\' | '|' => KEY_BACKSLASH,
        ';' | ':' => KEY_SEMICOLON,
        '\'' | '"' => KEY_APOSTROPHE,
        '`' | '~' => KEY_GRAVE,
        ',' | '<' => KEY_COMMA,
        '.' | '>' => KEY_PERIOD,
        '/' | '?' => KEY_SLASH,
        ' ' => KEY_SPACE,
        _ => 0,
    }
}

fn named_code(key: &str) -> u8 {
    match key.to_ascii_lowercase().as_str() {
        "enter" => KEY_ENTER,
        "esc" | "escape" => KEY_ESCAPE,
        "backspace" => KEY_BACKSPACE,
        "tab" => KEY_TAB,
        "space" => KEY_SPACE,
        "capslock" => KEY_CAPS_LOCK,
        "f1" => KEY_F1,
        "f2" => KEY_F2,
        "f3" => KEY_F3,
        "f4" => KEY_F4,
        "f5" => KEY_F5,
        "f6" => KEY_F6,
        "f7" => KEY_F7,
        "f8" => KEY_F8,
        "f9" => KEY_F9,
        "f10" => KEY_F10,
        "f11" => KEY_F11,
        "f12" => KEY_F12,
        "printscreen" => KEY_PRINT_SCREEN,
        "scrolllock" => KEY_SCROLL_LOCK,
        "pause" => KEY_PAUSE,
        "insert" => KEY_INSERT,
        "home" => KEY_HOME,
        "pageup" => KEY_PAGE_UP,
        "delete" => KEY_DELETE,
        "end" => KEY_END,
        "pagedown" => KEY_PAGE_DOWN,
        "right" | "arrowright" => KEY_RIGHT_ARROW,
        "left" | "arrowleft" => KEY_LEFT_ARROW,
        "down" | "arrowdown" => KEY_DOWN_ARROW,
        "up" | "arrowup" => KEY_UP_ARROW,
        _ => 0,
    }
}
