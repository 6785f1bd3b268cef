//! Input key mapping table (§6, `POST /api/sessions/:id/input`): translates a named key
//! (as sent by a client that doesn't want to hand-encode control sequences) into the raw
//! bytes written to the PTY. Unknown keys are a caller error, never a panic.

/// Maps a `key` field value to the bytes it writes to the PTY. Returns `None` for an
/// unrecognized key name, which the HTTP handler turns into a 400.
pub fn resolve(key: &str) -> Option<&'static [u8]> {
    Some(match key {
        "enter" | "ctrl_enter" | "shift_enter" => b"\n",
        "escape" => b"\x1b",
        "backspace" => b"\x7f",
        "tab" => b"\t",
        "arrow_up" => b"\x1b[A",
        "arrow_down" => b"\x1b[B",
        "arrow_right" => b"\x1b[C",
        "arrow_left" => b"\x1b[D",
        "f1" => b"\x1bOP",
        "f2" => b"\x1bOQ",
        "f3" => b"\x1bOR",
        "f4" => b"\x1bOS",
        "f5" => b"\x1b[15~",
        "f6" => b"\x1b[17~",
        "f7" => b"\x1b[18~",
        "f8" => b"\x1b[19~",
        "f9" => b"\x1b[20~",
        "f10" => b"\x1b[21~",
        "f11" => b"\x1b[23~",
        "f12" => b"\x1b[24~",
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn documented_keys_all_resolve() {
        for key in [
            "enter", "escape", "backspace", "tab", "arrow_up", "arrow_down", "arrow_left",
            "arrow_right", "ctrl_enter", "shift_enter", "f1", "f2", "f3", "f4", "f5", "f6", "f7",
            "f8", "f9", "f10", "f11", "f12",
        ] {
            assert!(resolve(key).is_some(), "key {key} should resolve");
        }
    }

    #[test]
    fn unknown_key_is_none() {
        assert!(resolve("super_hyper_meta").is_none());
    }

    #[test]
    fn enter_variants_agree() {
        assert_eq!(resolve("enter"), resolve("ctrl_enter"));
        assert_eq!(resolve("enter"), resolve("shift_enter"));
    }
}
